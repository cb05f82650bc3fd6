//! Routing and provider configuration file
//!
//! The file is produced by an operator and mounted into the pod, usually as a
//! ConfigMap volume. Its shape:
//!
//! ```yaml
//! provider:
//!   type: oidc | openshift | static | disabled
//!   oidc: {issuerUrl, clientId, clientSecret}
//!   openshift: {clusterUrl, clientId, clientSecret, caBundle, scope}
//!   static: {username, email, groups, subject}
//! routes:
//!   - path: /service-a
//!     upstream: http://service-a.ns.svc:8080
//!     authRequired: true
//! ```

use crate::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Top-level configuration document
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// One routing rule as written in the file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(rename = "path")]
    pub path_prefix: String,
    pub upstream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,
}

/// Provider block as written in the file
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    #[serde(rename = "type", default)]
    pub provider_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oidc: Option<OidcConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openshift: Option<OpenShiftConfig>,
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub fixed: Option<StaticIdentityConfig>,
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    pub issuer_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl OidcConfig {
    pub fn is_complete(&self) -> bool {
        !self.issuer_url.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

impl fmt::Debug for OidcConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcConfig")
            .field("issuer_url", &self.issuer_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenShiftConfig {
    pub cluster_url: String,
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    /// PEM bundle used to verify the cluster API and OAuth server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    /// Defaults to `user:info`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl OpenShiftConfig {
    pub fn is_complete(&self) -> bool {
        !self.cluster_url.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}

impl fmt::Debug for OpenShiftConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenShiftConfig")
            .field("cluster_url", &self.cluster_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("ca_bundle", &self.ca_bundle.as_ref().map(|b| b.len()))
            .field("scope", &self.scope)
            .finish()
    }
}

/// Fixed identity asserted for every caller
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticIdentityConfig {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

/// Resolved provider selection: exactly one variant's payload
#[derive(Clone, Debug, Default, PartialEq)]
pub enum ProviderSpec {
    #[default]
    Disabled,
    Oidc(OidcConfig),
    ClusterOAuth(OpenShiftConfig),
    Static(StaticIdentityConfig),
}

impl ProviderSpec {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderSpec::Disabled => "disabled",
            ProviderSpec::Oidc(_) => "oidc",
            ProviderSpec::ClusterOAuth(_) => "openshift",
            ProviderSpec::Static(_) => "static",
        }
    }
}

impl ProviderConfig {
    /// Resolve the tagged block into a single provider variant.
    ///
    /// An explicit `disabled` (or `none`) tag always wins. Otherwise
    /// cluster-OAuth wins whenever both an `openshift` and an `oidc` payload are
    /// populated, whatever the tag says. A missing tag is inferred from the only
    /// populated payload. An inconsistent or incomplete block resolves to
    /// [`ProviderSpec::Disabled`].
    pub fn resolve(&self) -> ProviderSpec {
        let tag = self.provider_type.trim().to_ascii_lowercase();
        if matches!(tag.as_str(), "disabled" | "none") {
            return ProviderSpec::Disabled;
        }

        if let (Some(openshift), Some(_)) = (&self.openshift, &self.oidc) {
            warn!(
                tag = %self.provider_type,
                "Both openshift and oidc provider blocks configured, openshift takes precedence"
            );
            return Self::cluster_oauth(openshift);
        }

        let tag = if tag.is_empty() {
            match (&self.openshift, &self.oidc, &self.fixed) {
                (Some(_), _, _) => "openshift".to_string(),
                (_, Some(_), _) => "oidc".to_string(),
                (_, _, Some(_)) => "static".to_string(),
                _ => "disabled".to_string(),
            }
        } else {
            tag
        };

        match tag.as_str() {
            "oidc" => match &self.oidc {
                Some(oidc) if oidc.is_complete() => ProviderSpec::Oidc(oidc.clone()),
                Some(_) => {
                    warn!("OIDC provider block is incomplete, authentication disabled");
                    ProviderSpec::Disabled
                }
                None => {
                    warn!("Provider type is oidc but no oidc block present, authentication disabled");
                    ProviderSpec::Disabled
                }
            },
            "openshift" => match &self.openshift {
                Some(openshift) => Self::cluster_oauth(openshift),
                None => {
                    warn!("Provider type is openshift but no openshift block present, authentication disabled");
                    ProviderSpec::Disabled
                }
            },
            "static" => match &self.fixed {
                Some(fixed) if !fixed.username.is_empty() => ProviderSpec::Static(fixed.clone()),
                _ => {
                    warn!("Static provider requires a username, authentication disabled");
                    ProviderSpec::Disabled
                }
            },
            "disabled" => ProviderSpec::Disabled,
            other => {
                warn!(provider_type = %other, "Unknown provider type, authentication disabled");
                ProviderSpec::Disabled
            }
        }
    }

    fn cluster_oauth(config: &OpenShiftConfig) -> ProviderSpec {
        if config.is_complete() {
            ProviderSpec::ClusterOAuth(config.clone())
        } else {
            warn!("OpenShift provider block is incomplete, authentication disabled");
            ProviderSpec::Disabled
        }
    }
}

impl GatewayConfig {
    /// Parse a configuration document
    pub fn from_yaml(raw: &[u8]) -> Result<Self> {
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(GatewayError::Config("configuration file is empty".to_string()));
        }
        Ok(serde_yaml::from_slice(raw)?)
    }
}

/// Raw bytes read from the config file plus their content hash
#[derive(Clone, Debug)]
pub struct ConfigContent {
    pub resolved_path: PathBuf,
    pub bytes: Vec<u8>,
    pub hash: String,
}

impl ConfigContent {
    pub fn parse(&self) -> Result<GatewayConfig> {
        GatewayConfig::from_yaml(&self.bytes)
    }
}

/// Hex-encoded SHA-256 of the given bytes
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Location of the config file on disk
///
/// ConfigMap volumes swap a `..data` symlink atomically, so every read resolves
/// the link first to observe the current generation of the file.
#[derive(Clone, Debug)]
pub struct ConfigSource {
    path: PathBuf,
}

impl ConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve symlinks and read the current file content
    pub async fn read(&self) -> Result<ConfigContent> {
        let resolved_path = tokio::fs::canonicalize(&self.path).await.map_err(|e| {
            GatewayError::Config(format!("failed to resolve {}: {}", self.path.display(), e))
        })?;
        let bytes = tokio::fs::read(&resolved_path).await.map_err(|e| {
            GatewayError::Config(format!("failed to read {}: {}", resolved_path.display(), e))
        })?;
        let hash = content_hash(&bytes);

        Ok(ConfigContent {
            resolved_path,
            bytes,
            hash,
        })
    }
}
