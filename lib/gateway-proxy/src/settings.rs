//! Per-deployment gateway settings
//!
//! Everything here is fixed for the life of the process. Routing and provider
//! selection live in the reloadable snapshot instead.

use gateway_auth::CookieNames;
use hyper::header::HeaderName;
use std::str::FromStr;
use std::time::Duration;

/// Paths served by the gateway itself, never matched against routes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReservedPaths {
    pub login: String,
    pub callback: String,
    pub logout: String,
    pub info: String,
    pub error: String,
    pub healthz: String,
    pub readyz: String,
    pub metrics: String,
}

impl Default for ReservedPaths {
    fn default() -> Self {
        Self {
            login: "/auth/login".to_string(),
            callback: "/auth/callback".to_string(),
            logout: "/auth/logout".to_string(),
            info: "/auth/info".to_string(),
            error: "/auth/error".to_string(),
            healthz: "/healthz".to_string(),
            readyz: "/readyz".to_string(),
            metrics: "/metrics".to_string(),
        }
    }
}

impl ReservedPaths {
    /// Whether `path` is one of the auth-flow handlers
    pub fn is_auth_path(&self, path: &str) -> bool {
        [&self.login, &self.callback, &self.logout, &self.info, &self.error]
            .iter()
            .any(|p| p.as_str() == path)
    }
}

/// Header names used to pass the verified identity upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityHeaders {
    pub user: HeaderName,
    pub user_id: HeaderName,
    pub groups: HeaderName,
    pub email: HeaderName,
}

impl Default for IdentityHeaders {
    fn default() -> Self {
        Self {
            user: HeaderName::from_static("x-forwarded-user"),
            user_id: HeaderName::from_static("x-forwarded-user-id"),
            groups: HeaderName::from_static("x-forwarded-groups"),
            email: HeaderName::from_static("x-forwarded-email"),
        }
    }
}

impl IdentityHeaders {
    pub fn from_names(user: &str, user_id: &str, groups: &str, email: &str) -> anyhow::Result<Self> {
        Ok(Self {
            user: HeaderName::from_str(user)?,
            user_id: HeaderName::from_str(user_id)?,
            groups: HeaderName::from_str(groups)?,
            email: HeaderName::from_str(email)?,
        })
    }

    pub fn all(&self) -> [&HeaderName; 4] {
        [&self.user, &self.user_id, &self.groups, &self.email]
    }
}

/// How the verified credential is passed upstream in `Authorization`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpstreamAuthMode {
    /// Leave `Authorization` as the client sent it
    #[default]
    None,
    /// `Authorization: <token>`
    Raw,
    /// `Authorization: Bearer <token>`
    Bearer,
}

impl FromStr for UpstreamAuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => Ok(UpstreamAuthMode::None),
            "raw" => Ok(UpstreamAuthMode::Raw),
            "bearer" => Ok(UpstreamAuthMode::Bearer),
            other => Err(anyhow::anyhow!(
                "invalid upstream auth mode {:?}, expected none, raw or bearer",
                other
            )),
        }
    }
}

/// Connection parameters for upstream calls
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    /// Bound on sending the request and receiving the complete response
    pub request_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// Largest request or response body buffered through the gateway
    pub max_body_bytes: usize,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 32,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GatewaySettings {
    /// Externally visible base URL, used for OAuth redirects
    pub public_base_url: String,
    /// Whether routes without `authRequired` are protected
    pub auth_default: bool,
    /// Set when the listener terminates TLS; drives cookie `Secure`
    pub tls: bool,
    /// Upper bound on the session cookie lifetime
    pub session_max_age: Duration,
    pub paths: ReservedPaths,
    pub cookies: CookieNames,
    pub identity_headers: IdentityHeaders,
    pub upstream_auth: UpstreamAuthMode,
    pub upstream: UpstreamSettings,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            public_base_url: "http://localhost:8080".to_string(),
            auth_default: false,
            tls: false,
            session_max_age: Duration::from_secs(3600),
            paths: ReservedPaths::default(),
            cookies: CookieNames::default(),
            identity_headers: IdentityHeaders::default(),
            upstream_auth: UpstreamAuthMode::None,
            upstream: UpstreamSettings::default(),
        }
    }
}

impl GatewaySettings {
    /// Absolute URL for a local path under the public base URL
    pub fn absolute_url(&self, path: &str) -> String {
        let base = self.public_base_url.trim_end_matches('/');
        format!("{}{}", base, path)
    }

    /// Absolute URL of the OAuth callback handler
    pub fn callback_url(&self) -> String {
        self.absolute_url(&self.paths.callback)
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }
}
