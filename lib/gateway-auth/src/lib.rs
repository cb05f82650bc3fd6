//! Identity providers and login-flow protection
//!
//! This library provides:
//! - The [`AuthProvider`] capability and its OIDC, OpenShift, static and
//!   disabled implementations
//! - Correlation-state minting and single-use verification
//! - CSRF checks for state-changing requests
//! - Cookie construction and parsing

pub mod cookies;
pub mod csrf;
pub mod provider;
pub mod state;

pub use cookies::{CookieFactory, CookieNames};
pub use provider::{
    build_provider, AuthProvider, DisabledProvider, LoginOutcome, OidcMetadata, OidcProvider,
    OpenShiftEndpoints, OpenShiftProvider, ProviderContext, ProviderHandle, StaticProvider,
    DEFAULT_PROVIDER_TIMEOUT,
};
pub use state::{random_token, CorrelationState, StateVerifier, STATE_TTL};
