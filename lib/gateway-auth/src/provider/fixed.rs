//! Fixed-identity provider
//!
//! Runs the redirect flow entirely inside the gateway: the login URL points
//! straight back at the callback handler and every caller who completes it is
//! given the same identity. Useful for development clusters and demos.

use super::{AuthProvider, LoginOutcome, ProviderContext};
use crate::state::random_token;
use async_trait::async_trait;
use gateway_core::{GatewayError, Identity, Result, StaticIdentityConfig};
use subtle::ConstantTimeEq;
use url::Url;

pub struct StaticProvider {
    identity: Identity,
    redirect_uri: String,
    /// Per-instance session secret, rotated whenever the provider is rebuilt
    session_secret: String,
}

impl StaticProvider {
    pub fn new(config: StaticIdentityConfig, ctx: &ProviderContext) -> Self {
        let identity = Identity::new(config.username)
            .with_email(config.email)
            .with_groups(config.groups)
            .with_subject(config.subject);

        Self {
            identity,
            redirect_uri: ctx.redirect_uri.clone(),
            session_secret: random_token(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }
}

#[async_trait]
impl AuthProvider for StaticProvider {
    fn name(&self) -> &'static str {
        "static"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    async fn login_url(&self, state: &str, _post_login_path: &str) -> Result<Url> {
        let mut url = Url::parse(&self.redirect_uri)
            .map_err(|e| GatewayError::Config(format!("invalid callback URL: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("code", "static")
            .append_pair("state", state);
        Ok(url)
    }

    async fn complete_login(&self, _code: &str) -> Result<LoginOutcome> {
        Ok(LoginOutcome {
            identity: self.identity.clone(),
            session_token: self.session_secret.clone(),
            expires_in: None,
        })
    }

    async fn validate(&self, token: &str) -> Result<Identity> {
        if bool::from(token.as_bytes().ct_eq(self.session_secret.as_bytes())) {
            Ok(self.identity.clone())
        } else {
            Err(GatewayError::InvalidCredential("unknown session token".to_string()))
        }
    }

    fn logout_url(&self, _post_logout_path: &str) -> Option<String> {
        None
    }
}
