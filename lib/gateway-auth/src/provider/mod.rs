//! Identity provider abstraction
//!
//! Every provider variant implements [`AuthProvider`]. Call sites never switch
//! on the provider type: [`build_provider`] is the only place that maps a
//! [`ProviderSpec`] to a concrete implementation.

mod disabled;
mod fixed;
mod oidc;
mod openshift;

pub use disabled::DisabledProvider;
pub use fixed::StaticProvider;
pub use oidc::{OidcMetadata, OidcProvider};
pub use openshift::{OpenShiftEndpoints, OpenShiftProvider};

use async_trait::async_trait;
use gateway_core::{GatewayError, Identity, ProviderSpec, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Default bound on any single call to the identity provider
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared handle to the active provider
pub type ProviderHandle = Arc<dyn AuthProvider>;

/// Result of a completed authorization-code exchange
#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub identity: Identity,
    /// Credential stored in the session cookie
    pub session_token: String,
    /// Remaining lifetime of `session_token`, when the provider reports one
    pub expires_in: Option<Duration>,
}

/// Deployment-level inputs every provider needs
#[derive(Clone, Debug)]
pub struct ProviderContext {
    /// Absolute URL of the gateway callback handler
    pub redirect_uri: String,
    /// Bound on each remote call
    pub request_timeout: Duration,
}

impl ProviderContext {
    pub fn new(redirect_uri: impl Into<String>) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            request_timeout: DEFAULT_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Capability shared by all identity provider variants
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Whether the gate should enforce authentication at all
    fn is_enabled(&self) -> bool;

    /// URL the browser is redirected to in order to log in
    ///
    /// May perform one-time discovery on first use. Discovery failure is
    /// reported as [`GatewayError::ProviderUnavailable`].
    async fn login_url(&self, state: &str, post_login_path: &str) -> Result<Url>;

    /// Exchange an authorization code and verify the resulting credential
    async fn complete_login(&self, code: &str) -> Result<LoginOutcome>;

    /// Verify a previously issued credential
    async fn validate(&self, token: &str) -> Result<Identity>;

    /// Provider-side logout URL, `None` when only the local cookie is cleared
    fn logout_url(&self, post_logout_path: &str) -> Option<String>;
}

/// Instantiate the provider for a resolved specification
///
/// A specification that cannot be turned into a working provider degrades to
/// the disabled variant instead of failing.
pub fn build_provider(spec: &ProviderSpec, ctx: &ProviderContext) -> ProviderHandle {
    let built: Result<ProviderHandle> = match spec {
        ProviderSpec::Disabled => Ok(Arc::new(DisabledProvider)),
        ProviderSpec::Oidc(config) => {
            OidcProvider::new(config.clone(), ctx).map(|p| Arc::new(p) as ProviderHandle)
        }
        ProviderSpec::ClusterOAuth(config) => {
            OpenShiftProvider::new(config.clone(), ctx).map(|p| Arc::new(p) as ProviderHandle)
        }
        ProviderSpec::Static(config) => Ok(Arc::new(StaticProvider::new(config.clone(), ctx))),
    };

    match built {
        Ok(provider) => {
            info!(provider = provider.name(), enabled = provider.is_enabled(), "Auth provider built");
            provider
        }
        Err(e) => {
            warn!(provider = spec.name(), error = %e, "Failed to build auth provider, authentication disabled");
            Arc::new(DisabledProvider)
        }
    }
}

/// HTTP client for provider calls, optionally trusting a custom CA bundle
pub(crate) fn http_client(timeout: Duration, ca_bundle: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none());

    if let Some(bundle) = ca_bundle.filter(|b| !b.trim().is_empty()) {
        let mut reader = std::io::BufReader::new(bundle.as_bytes());
        let certificates = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| GatewayError::Config(format!("failed to parse CA bundle: {}", e)))?;
        if certificates.is_empty() {
            return Err(GatewayError::Config("CA bundle contains no certificates".to_string()));
        }
        for der in certificates {
            let certificate = reqwest::Certificate::from_der(der.as_ref())
                .map_err(|e| GatewayError::Config(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(certificate);
        }
    }

    builder
        .build()
        .map_err(|e| GatewayError::Config(format!("failed to build HTTP client: {}", e)))
}

pub(crate) fn unavailable(what: &str, err: impl std::fmt::Display) -> GatewayError {
    GatewayError::ProviderUnavailable(format!("{}: {}", what, err))
}

/// Remaining lifetime of a JWT-style `exp` claim
pub(crate) fn lifetime_from_exp(exp: i64) -> Option<Duration> {
    let remaining = exp - chrono::Utc::now().timestamp();
    (remaining > 0).then(|| Duration::from_secs(remaining as u64))
}
