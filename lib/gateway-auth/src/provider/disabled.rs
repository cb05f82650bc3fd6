use super::{AuthProvider, LoginOutcome};
use async_trait::async_trait;
use gateway_core::{GatewayError, Identity, Result};
use url::Url;

/// No-op provider used when authentication is not configured
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledProvider;

#[async_trait]
impl AuthProvider for DisabledProvider {
    fn name(&self) -> &'static str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn login_url(&self, _state: &str, _post_login_path: &str) -> Result<Url> {
        Err(GatewayError::NotConfigured)
    }

    async fn complete_login(&self, _code: &str) -> Result<LoginOutcome> {
        Err(GatewayError::NotConfigured)
    }

    async fn validate(&self, _token: &str) -> Result<Identity> {
        Err(GatewayError::NotConfigured)
    }

    fn logout_url(&self, _post_logout_path: &str) -> Option<String> {
        None
    }
}
