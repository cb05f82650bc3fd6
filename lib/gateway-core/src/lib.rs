//! Core types for the authenticating gateway
//!
//! This library provides:
//! - Routing/provider configuration schema and file loading
//! - Route entries and the specificity-ordered route table
//! - The normalized caller identity
//! - The gateway error taxonomy

pub mod config;
pub mod error;
pub mod identity;
pub mod route;

pub use config::{
    ConfigContent, ConfigSource, GatewayConfig, OidcConfig, OpenShiftConfig, ProviderConfig,
    ProviderSpec, RouteConfig, StaticIdentityConfig,
};
pub use error::{GatewayError, Result};
pub use identity::Identity;
pub use route::{RouteEntry, RouteTable};
