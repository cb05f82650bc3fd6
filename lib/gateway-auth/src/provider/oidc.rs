//! OpenID Connect provider
//!
//! # Flow
//!
//! 1. On first use, fetch `/.well-known/openid-configuration` and the JWKS it
//!    points at. The result is memoized for the provider's lifetime; concurrent
//!    first requests share one discovery.
//! 2. `login_url` builds an authorization-code request with the `state` token.
//! 3. `complete_login` exchanges the code at the token endpoint and verifies
//!    the returned ID token.
//! 4. `validate` verifies ID tokens locally: signature (JWKS key by `kid`, or
//!    the client secret for HMAC algorithms), `iss`, `aud` and `exp`.
//!
//! An unknown `kid` triggers a single JWKS refresh before the token is rejected.
//! Refreshes are at least [`JWKS_REFRESH_INTERVAL`] apart, so forged `kid`
//! values cannot turn requests into calls against the issuer. A token whose key
//! cannot be found or fetched is an invalid credential, not an outage.

use super::{
    http_client, lifetime_from_exp, unavailable, AuthProvider, LoginOutcome, ProviderContext,
};
use async_trait::async_trait;
use gateway_core::{GatewayError, Identity, OidcConfig, Result};
use jsonwebtoken::{jwk::JwkSet, Algorithm, DecodingKey, Header, Validation};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

const SCOPES: &str = "openid profile email";
const CLOCK_SKEW_LEEWAY_SECS: u64 = 60;

/// Minimum spacing between JWKS fetches triggered by unknown keys
pub const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Subset of the issuer's discovery document the gateway uses
#[derive(Clone, Debug, Deserialize)]
pub struct OidcMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

struct Resolved {
    metadata: OidcMetadata,
    jwks: RwLock<JwkSet>,
    last_fetch: Mutex<Option<Instant>>,
}

impl Resolved {
    fn new(metadata: OidcMetadata, jwks: JwkSet, fetched_at: Option<Instant>) -> Self {
        Self {
            metadata,
            jwks: RwLock::new(jwks),
            last_fetch: Mutex::new(fetched_at),
        }
    }

    /// Reserve the next JWKS refresh, unless one happened too recently
    fn claim_refresh(&self) -> bool {
        let mut last_fetch = self.last_fetch.lock();
        if last_fetch.is_some_and(|at| at.elapsed() < JWKS_REFRESH_INTERVAL) {
            return false;
        }
        *last_fetch = Some(Instant::now());
        true
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    sub: String,
    exp: i64,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    email: Option<String>,
    /// Either a list of names or a single name, depending on the issuer
    #[serde(default)]
    groups: Option<serde_json::Value>,
}

pub struct OidcProvider {
    config: OidcConfig,
    redirect_uri: String,
    http: reqwest::Client,
    resolved: OnceCell<Resolved>,
}

impl OidcProvider {
    /// Create a provider that discovers its endpoints lazily
    pub fn new(config: OidcConfig, ctx: &ProviderContext) -> Result<Self> {
        Url::parse(&config.issuer_url)
            .map_err(|e| GatewayError::Config(format!("invalid issuer URL: {}", e)))?;

        Ok(Self {
            http: http_client(ctx.request_timeout, None)?,
            redirect_uri: ctx.redirect_uri.clone(),
            config,
            resolved: OnceCell::new(),
        })
    }

    /// Create a provider from already known metadata and keys, skipping discovery
    pub fn with_metadata(
        config: OidcConfig,
        ctx: &ProviderContext,
        metadata: OidcMetadata,
        jwks: JwkSet,
    ) -> Result<Self> {
        Ok(Self {
            http: http_client(ctx.request_timeout, None)?,
            redirect_uri: ctx.redirect_uri.clone(),
            config,
            resolved: OnceCell::new_with(Some(Resolved::new(metadata, jwks, None))),
        })
    }

    async fn resolved(&self) -> Result<&Resolved> {
        self.resolved.get_or_try_init(|| self.discover()).await
    }

    async fn discover(&self) -> Result<Resolved> {
        let issuer = self.config.issuer_url.trim_end_matches('/');
        let discovery_url = format!("{}/.well-known/openid-configuration", issuer);
        debug!(url = %discovery_url, "Fetching OIDC discovery document");

        let response = self
            .http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| unavailable("OIDC discovery request failed", e))?;
        if !response.status().is_success() {
            return Err(unavailable("OIDC discovery returned", response.status()));
        }
        let metadata: OidcMetadata = response
            .json()
            .await
            .map_err(|e| unavailable("OIDC discovery document is invalid", e))?;

        if metadata.issuer.trim_end_matches('/') != issuer {
            return Err(GatewayError::ProviderUnavailable(format!(
                "issuer mismatch: configured {}, discovered {}",
                issuer, metadata.issuer
            )));
        }

        let jwks = self.fetch_jwks(&metadata.jwks_uri).await?;
        info!(issuer = %metadata.issuer, keys = jwks.keys.len(), "OIDC provider initialized");

        Ok(Resolved::new(metadata, jwks, Some(Instant::now())))
    }

    async fn fetch_jwks(&self, jwks_uri: &str) -> Result<JwkSet> {
        debug!(url = %jwks_uri, "Fetching JWKS");
        let response = self
            .http
            .get(jwks_uri)
            .send()
            .await
            .map_err(|e| unavailable("JWKS request failed", e))?;
        if !response.status().is_success() {
            return Err(unavailable("JWKS endpoint returned", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| unavailable("JWKS document is invalid", e))
    }

    async fn decoding_key(&self, resolved: &Resolved, header: &Header) -> Result<DecodingKey> {
        if matches!(header.alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
            return Ok(DecodingKey::from_secret(self.config.client_secret.as_bytes()));
        }

        if let Some(key) = find_key(&resolved.jwks.read(), header.kid.as_deref())? {
            return Ok(key);
        }

        let unknown = || GatewayError::InvalidCredential(format!("unknown signing key {:?}", header.kid));
        if !resolved.claim_refresh() {
            debug!(kid = ?header.kid, "Key not found in cached JWKS, refresh throttled");
            return Err(unknown());
        }

        debug!(kid = ?header.kid, "Key not found in cached JWKS, refreshing");
        match self.fetch_jwks(&resolved.metadata.jwks_uri).await {
            Ok(refreshed) => *resolved.jwks.write() = refreshed,
            Err(e) => {
                warn!(error = %e, "JWKS refresh failed");
                return Err(unknown());
            }
        }

        find_key(&resolved.jwks.read(), header.kid.as_deref())?.ok_or_else(unknown)
    }

    async fn verify_id_token(&self, token: &str) -> Result<(Identity, Option<Duration>)> {
        let resolved = self.resolved().await?;
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| GatewayError::InvalidCredential(format!("malformed token: {}", e)))?;
        let key = self.decoding_key(resolved, &header).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
        validation.set_issuer(&[resolved.metadata.issuer.as_str()]);
        validation.set_audience(&[self.config.client_id.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        let data = jsonwebtoken::decode::<IdTokenClaims>(token, &key, &validation)
            .map_err(|e| GatewayError::InvalidCredential(format!("token verification failed: {}", e)))?;
        let lifetime = lifetime_from_exp(data.claims.exp);

        Ok((identity_from_claims(data.claims), lifetime))
    }
}

fn find_key(jwks: &JwkSet, kid: Option<&str>) -> Result<Option<DecodingKey>> {
    let jwk = match kid {
        Some(kid) => jwks.find(kid),
        // Issuers with a single key may omit `kid`
        None if jwks.keys.len() == 1 => jwks.keys.first(),
        None => None,
    };

    jwk.map(|jwk| {
        DecodingKey::from_jwk(jwk)
            .map_err(|e| GatewayError::InvalidCredential(format!("unusable signing key: {}", e)))
    })
    .transpose()
}

fn identity_from_claims(claims: IdTokenClaims) -> Identity {
    let groups: Vec<String> = match claims.groups {
        Some(serde_json::Value::Array(values)) => values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(group)) => vec![group],
        _ => Vec::new(),
    };

    let username = claims
        .preferred_username
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| claims.sub.clone());

    Identity::new(username)
        .with_email(claims.email)
        .with_groups(groups)
        .with_subject(Some(claims.sub))
}

#[async_trait]
impl AuthProvider for OidcProvider {
    fn name(&self) -> &'static str {
        "oidc"
    }

    fn is_enabled(&self) -> bool {
        self.config.is_complete()
    }

    async fn login_url(&self, state: &str, _post_login_path: &str) -> Result<Url> {
        let resolved = self.resolved().await?;
        let mut url = Url::parse(&resolved.metadata.authorization_endpoint)
            .map_err(|e| unavailable("invalid authorization endpoint", e))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", SCOPES)
            .append_pair("state", state);
        Ok(url)
    }

    async fn complete_login(&self, code: &str) -> Result<LoginOutcome> {
        let resolved = self.resolved().await?;

        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        let response = self
            .http
            .post(&resolved.metadata.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| unavailable("token request failed", e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(unavailable("token endpoint returned", status));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Token endpoint rejected authorization code");
            debug!(body = %body, "Token endpoint error body");
            return Err(GatewayError::InvalidCredential(format!(
                "token endpoint rejected the authorization code ({})",
                status
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| unavailable("token response is invalid", e))?;
        let id_token = tokens
            .id_token
            .ok_or_else(|| GatewayError::InvalidCredential("no id_token in token response".to_string()))?;

        let (identity, lifetime) = self.verify_id_token(&id_token).await?;
        let expires_in = match (lifetime, tokens.expires_in) {
            (Some(lifetime), _) => Some(lifetime),
            (None, Some(secs)) => Some(Duration::from_secs(secs)),
            (None, None) => None,
        };

        Ok(LoginOutcome {
            identity,
            session_token: id_token,
            expires_in,
        })
    }

    async fn validate(&self, token: &str) -> Result<Identity> {
        self.verify_id_token(token).await.map(|(identity, _)| identity)
    }

    fn logout_url(&self, post_logout_path: &str) -> Option<String> {
        let endpoint = self.resolved.get()?.metadata.end_session_endpoint.as_deref()?;
        let mut url = Url::parse(endpoint).ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("post_logout_redirect_uri", post_logout_path);
        Some(url.to_string())
    }
}
