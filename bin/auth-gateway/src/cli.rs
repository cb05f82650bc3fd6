//! Process flags and their mapping onto gateway settings

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gateway_core::{OidcConfig, ProviderConfig};
use gateway_proxy::{GatewaySettings, IdentityHeaders, UpstreamAuthMode, UpstreamSettings, UpstreamTls};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Authenticating reverse proxy
#[derive(Debug, Parser)]
#[command(name = "auth-gateway", version)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// TLS certificate chain (PEM); enables HTTPS together with --tls-key
    #[arg(long, env = "GATEWAY_TLS_CERT", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, env = "GATEWAY_TLS_KEY", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// Routing and provider configuration file
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "/etc/auth-gateway/config.yaml")]
    pub config: PathBuf,

    /// Externally visible base URL, used to build the OAuth callback URL
    #[arg(long, env = "GATEWAY_PUBLIC_URL", default_value = "http://localhost:8080")]
    pub public_url: String,

    /// Protect routes that do not set authRequired
    #[arg(long, env = "GATEWAY_AUTH_DEFAULT", default_value_t = false)]
    pub auth_default: bool,

    /// Upper bound on the session cookie lifetime, in seconds
    #[arg(long, env = "GATEWAY_SESSION_MAX_AGE", default_value_t = 3600)]
    pub session_max_age: u64,

    #[arg(long, env = "GATEWAY_USER_HEADER", default_value = "X-Forwarded-User")]
    pub user_header: String,

    #[arg(long, env = "GATEWAY_USER_ID_HEADER", default_value = "X-Forwarded-User-ID")]
    pub user_id_header: String,

    #[arg(long, env = "GATEWAY_GROUPS_HEADER", default_value = "X-Forwarded-Groups")]
    pub groups_header: String,

    #[arg(long, env = "GATEWAY_EMAIL_HEADER", default_value = "X-Forwarded-Email")]
    pub email_header: String,

    /// How the verified token is passed upstream: none, raw or bearer
    #[arg(long, env = "GATEWAY_UPSTREAM_AUTH", default_value = "none")]
    pub upstream_auth: UpstreamAuthMode,

    /// Upstream connect timeout, in seconds
    #[arg(long, env = "GATEWAY_UPSTREAM_CONNECT_TIMEOUT", default_value_t = 10)]
    pub upstream_connect_timeout: u64,

    /// Time allowed for an upstream to return its complete response, in seconds
    #[arg(long, env = "GATEWAY_UPSTREAM_TIMEOUT", default_value_t = 30)]
    pub upstream_timeout: u64,

    /// Idle pooled connections are closed after this many seconds
    #[arg(long, env = "GATEWAY_UPSTREAM_IDLE_TIMEOUT", default_value_t = 90)]
    pub upstream_idle_timeout: u64,

    #[arg(long, env = "GATEWAY_UPSTREAM_MAX_IDLE", default_value_t = 32)]
    pub upstream_max_idle_per_host: usize,

    /// Largest request or response body passed through, in bytes
    #[arg(long, env = "GATEWAY_MAX_BODY_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub max_body_bytes: usize,

    /// Extra CA bundle (PEM) trusted for HTTPS upstreams
    #[arg(long, env = "GATEWAY_UPSTREAM_CA")]
    pub upstream_ca: Option<PathBuf>,

    /// Client certificate (PEM) presented to HTTPS upstreams
    #[arg(long, env = "GATEWAY_UPSTREAM_CLIENT_CERT", requires = "upstream_client_key")]
    pub upstream_client_cert: Option<PathBuf>,

    #[arg(long, env = "GATEWAY_UPSTREAM_CLIENT_KEY", requires = "upstream_client_cert")]
    pub upstream_client_key: Option<PathBuf>,

    /// OIDC issuer used when the config file has no provider block
    #[arg(long, env = "OIDC_ISSUER_URL")]
    pub oidc_issuer_url: Option<String>,

    #[arg(long, env = "OIDC_CLIENT_ID")]
    pub oidc_client_id: Option<String>,

    #[arg(long, env = "OIDC_CLIENT_SECRET", hide_env_values = true)]
    pub oidc_client_secret: Option<String>,

    /// Bound on each identity provider call, in seconds
    #[arg(long, env = "GATEWAY_PROVIDER_TIMEOUT", default_value_t = 10)]
    pub provider_timeout: u64,

    #[arg(long, env = "GATEWAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn settings(&self) -> Result<GatewaySettings> {
        let identity_headers = IdentityHeaders::from_names(
            &self.user_header,
            &self.user_id_header,
            &self.groups_header,
            &self.email_header,
        )
        .context("invalid identity header name")?;

        Ok(GatewaySettings {
            public_base_url: self.public_url.clone(),
            auth_default: self.auth_default,
            tls: self.tls_enabled(),
            session_max_age: Duration::from_secs(self.session_max_age),
            identity_headers,
            upstream_auth: self.upstream_auth,
            upstream: UpstreamSettings {
                connect_timeout: Duration::from_secs(self.upstream_connect_timeout),
                request_timeout: Duration::from_secs(self.upstream_timeout),
                pool_idle_timeout: Duration::from_secs(self.upstream_idle_timeout),
                pool_max_idle_per_host: self.upstream_max_idle_per_host,
                max_body_bytes: self.max_body_bytes,
            },
            ..Default::default()
        })
    }

    pub fn upstream_tls(&self) -> Result<UpstreamTls> {
        let ca_pem = self
            .upstream_ca
            .as_ref()
            .map(|path| {
                std::fs::read(path)
                    .with_context(|| format!("Failed to read upstream CA from {}", path.display()))
            })
            .transpose()?;

        let client_cert_pem = match (&self.upstream_client_cert, &self.upstream_client_key) {
            (Some(cert), Some(key)) => Some((
                std::fs::read(cert)
                    .with_context(|| format!("Failed to read client certificate from {}", cert.display()))?,
                std::fs::read(key)
                    .with_context(|| format!("Failed to read client key from {}", key.display()))?,
            )),
            _ => None,
        };

        Ok(UpstreamTls {
            ca_pem,
            client_cert_pem,
        })
    }

    /// OIDC provider from flags, used when the file has no provider block
    pub fn fallback_provider(&self) -> Option<ProviderConfig> {
        let issuer_url = self.oidc_issuer_url.clone().filter(|s| !s.is_empty())?;
        Some(ProviderConfig {
            provider_type: "oidc".to_string(),
            oidc: Some(OidcConfig {
                issuer_url,
                client_id: self.oidc_client_id.clone().unwrap_or_default(),
                client_secret: self.oidc_client_secret.clone().unwrap_or_default(),
            }),
            ..Default::default()
        })
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout)
    }
}
