//! HTTP layer of the authenticating gateway
//!
//! This library provides:
//! - Deployment settings (reserved paths, cookie and header names, upstream limits)
//! - The auth gate and the `/auth/*` handlers
//! - Upstream forwarding over HTTP or HTTPS
//! - Access-log and metrics middleware
//! - TLS material loading for the listener and for upstreams

pub mod forwarder;
pub mod gate;
pub mod metrics;
pub mod middleware;
pub mod response;
pub mod server;
pub mod settings;
pub mod tls;
pub mod upstream_tls;

pub use forwarder::{ForwardContext, RequestForwarder};
pub use gate::{AuthGate, GateOutcome};
pub use metrics::{AuthDecision, GatewayMetrics};
pub use server::Gateway;
pub use settings::{GatewaySettings, IdentityHeaders, ReservedPaths, UpstreamAuthMode, UpstreamSettings};
pub use tls::load_server_config;
pub use upstream_tls::UpstreamTls;
