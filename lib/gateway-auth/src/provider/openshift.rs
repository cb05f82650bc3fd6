//! OpenShift cluster OAuth provider
//!
//! Tokens issued by the cluster OAuth server are opaque, so every validation is
//! a call to the user API (`users/~`). Group membership comes from listing
//! groups and is best effort: a failing lookup yields an identity without
//! groups rather than a rejected request.

use super::{http_client, unavailable, AuthProvider, LoginOutcome, ProviderContext};
use async_trait::async_trait;
use gateway_core::{GatewayError, Identity, OpenShiftConfig, Result};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_SCOPE: &str = "user:info";
const USER_PATH: &str = "/apis/user.openshift.io/v1/users/~";
const GROUPS_PATH: &str = "/apis/user.openshift.io/v1/groups";
const GROUP_CACHE_CAPACITY: usize = 1024;
const GROUP_CACHE_TTL: Duration = Duration::from_secs(60);

/// OAuth endpoints advertised by the cluster
#[derive(Clone, Debug, Deserialize)]
pub struct OpenShiftEndpoints {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct User {
    metadata: ObjectMeta,
    #[serde(default)]
    groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Group {
    metadata: ObjectMeta,
    #[serde(default)]
    users: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct GroupList {
    #[serde(default)]
    items: Vec<Group>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct OpenShiftProvider {
    config: OpenShiftConfig,
    cluster_url: String,
    scope: String,
    redirect_uri: String,
    http: reqwest::Client,
    endpoints: OnceCell<OpenShiftEndpoints>,
    group_cache: Mutex<LruCache<String, (Instant, Vec<String>)>>,
}

impl OpenShiftProvider {
    pub fn new(config: OpenShiftConfig, ctx: &ProviderContext) -> Result<Self> {
        Self::build(config, ctx, OnceCell::new())
    }

    /// Create a provider with known OAuth endpoints, skipping discovery
    pub fn with_endpoints(
        config: OpenShiftConfig,
        ctx: &ProviderContext,
        endpoints: OpenShiftEndpoints,
    ) -> Result<Self> {
        Self::build(config, ctx, OnceCell::new_with(Some(endpoints)))
    }

    fn build(
        config: OpenShiftConfig,
        ctx: &ProviderContext,
        endpoints: OnceCell<OpenShiftEndpoints>,
    ) -> Result<Self> {
        Url::parse(&config.cluster_url)
            .map_err(|e| GatewayError::Config(format!("invalid cluster URL: {}", e)))?;
        let http = http_client(ctx.request_timeout, config.ca_bundle.as_deref())?;
        let capacity = NonZeroUsize::new(GROUP_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            cluster_url: config.cluster_url.trim_end_matches('/').to_string(),
            scope: config
                .scope
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            redirect_uri: ctx.redirect_uri.clone(),
            http,
            endpoints,
            group_cache: Mutex::new(LruCache::new(capacity)),
            config,
        })
    }

    async fn endpoints(&self) -> Result<&OpenShiftEndpoints> {
        self.endpoints.get_or_try_init(|| self.discover()).await
    }

    async fn discover(&self) -> Result<OpenShiftEndpoints> {
        let url = format!("{}/.well-known/oauth-authorization-server", self.cluster_url);
        debug!(url = %url, "Discovering cluster OAuth endpoints");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| unavailable("cluster OAuth discovery failed", e))?;
        if !response.status().is_success() {
            return Err(unavailable("cluster OAuth discovery returned", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| unavailable("cluster OAuth metadata is invalid", e))
    }

    async fn current_user(&self, token: &str) -> Result<User> {
        let response = self
            .http
            .get(format!("{}{}", self.cluster_url, USER_PATH))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| unavailable("user lookup failed", e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(GatewayError::InvalidCredential(format!(
                "cluster rejected token ({})",
                status
            )));
        }
        if !status.is_success() {
            return Err(unavailable("user lookup returned", status));
        }
        response
            .json()
            .await
            .map_err(|e| unavailable("user object is invalid", e))
    }

    async fn groups_for(&self, token: &str, username: &str) -> Vec<String> {
        let cached = self
            .group_cache
            .lock()
            .get(username)
            .filter(|(fetched_at, _)| fetched_at.elapsed() < GROUP_CACHE_TTL)
            .map(|(_, groups)| groups.clone());
        if let Some(groups) = cached {
            return groups;
        }

        match self.list_groups(token).await {
            Ok(list) => {
                let groups = filter_groups(list, username);
                self.group_cache
                    .lock()
                    .put(username.to_string(), (Instant::now(), groups.clone()));
                groups
            }
            Err(e) => {
                warn!(user = %username, error = %e, "Failed to fetch user groups");
                Vec::new()
            }
        }
    }

    async fn list_groups(&self, token: &str) -> Result<GroupList> {
        let response = self
            .http
            .get(format!("{}{}", self.cluster_url, GROUPS_PATH))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| unavailable("group listing failed", e))?;
        if !response.status().is_success() {
            return Err(unavailable("group listing returned", response.status()));
        }
        response
            .json()
            .await
            .map_err(|e| unavailable("group list is invalid", e))
    }
}

/// Names of the groups whose member list contains `username`
fn filter_groups(list: GroupList, username: &str) -> Vec<String> {
    list.items
        .into_iter()
        .filter(|group| {
            group
                .users
                .as_ref()
                .is_some_and(|users| users.iter().any(|u| u == username))
        })
        .map(|group| group.metadata.name)
        .collect()
}

#[async_trait]
impl AuthProvider for OpenShiftProvider {
    fn name(&self) -> &'static str {
        "openshift"
    }

    fn is_enabled(&self) -> bool {
        self.config.is_complete()
    }

    async fn login_url(&self, state: &str, _post_login_path: &str) -> Result<Url> {
        let endpoints = self.endpoints().await?;
        let mut url = Url::parse(&endpoints.authorization_endpoint)
            .map_err(|e| unavailable("invalid authorization endpoint", e))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", &self.scope)
            .append_pair("state", state);
        Ok(url)
    }

    async fn complete_login(&self, code: &str) -> Result<LoginOutcome> {
        let endpoints = self.endpoints().await?;
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(&endpoints.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| unavailable("token request failed", e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(unavailable("token endpoint returned", status));
        }
        if !status.is_success() {
            return Err(GatewayError::InvalidCredential(format!(
                "token endpoint rejected the authorization code ({})",
                status
            )));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| unavailable("token response is invalid", e))?;
        let identity = self.validate(&tokens.access_token).await?;

        Ok(LoginOutcome {
            identity,
            session_token: tokens.access_token,
            expires_in: tokens.expires_in.map(Duration::from_secs),
        })
    }

    async fn validate(&self, token: &str) -> Result<Identity> {
        let user = self.current_user(token).await?;
        let mut groups = user.groups;
        groups.extend(self.groups_for(token, &user.metadata.name).await);

        Ok(Identity::new(user.metadata.name)
            .with_groups(groups)
            .with_subject(user.metadata.uid))
    }

    fn logout_url(&self, post_logout_path: &str) -> Option<String> {
        let mut url = Url::parse(&format!("{}/oauth/logout", self.cluster_url)).ok()?;
        if !post_logout_path.is_empty() {
            url.query_pairs_mut().append_pair("redirect_uri", post_logout_path);
        }
        Some(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(cluster_url: &str) -> OpenShiftConfig {
        OpenShiftConfig {
            cluster_url: cluster_url.to_string(),
            client_id: "gateway".to_string(),
            client_secret: "secret".to_string(),
            ca_bundle: None,
            scope: None,
        }
    }

    fn ctx() -> ProviderContext {
        ProviderContext::new("https://gateway.example.com/auth/callback")
            .with_timeout(Duration::from_secs(2))
    }

    /// Answer every connection with the same canned response
    async fn canned_server(status_line: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                        status_line,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_filter_groups() {
        let list: GroupList = serde_json::from_value(json!({
            "items": [
                {"metadata": {"name": "devs"}, "users": ["alice", "bob"]},
                {"metadata": {"name": "ops"}, "users": ["carol"]},
                {"metadata": {"name": "empty"}, "users": null},
                {"metadata": {"name": "admins"}, "users": ["alice"]},
            ]
        }))
        .unwrap();
        assert_eq!(filter_groups(list, "alice"), vec!["devs".to_string(), "admins".to_string()]);
    }

    #[tokio::test]
    async fn test_login_url_uses_default_scope() {
        let provider = OpenShiftProvider::with_endpoints(
            config("https://api.cluster.example.com:6443"),
            &ctx(),
            OpenShiftEndpoints {
                authorization_endpoint: "https://oauth.cluster.example.com/oauth/authorize".to_string(),
                token_endpoint: "https://oauth.cluster.example.com/oauth/token".to_string(),
            },
        )
        .unwrap();

        let url = provider.login_url("xyz", "/").await.unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("scope".to_string(), "user:info".to_string())));
        assert!(pairs.contains(&("state".to_string(), "xyz".to_string())));
    }

    #[test]
    fn test_logout_url() {
        let provider = OpenShiftProvider::new(config("https://api.cluster.example.com:6443/"), &ctx()).unwrap();
        let url = provider.logout_url("https://gateway.example.com/").unwrap();
        assert!(url.starts_with("https://api.cluster.example.com:6443/oauth/logout?redirect_uri="));
    }

    #[tokio::test]
    async fn test_discovery_failure_is_provider_unavailable() {
        let provider = OpenShiftProvider::new(config("http://127.0.0.1:9"), &ctx()).unwrap();
        assert!(matches!(
            provider.login_url("s", "/").await,
            Err(GatewayError::ProviderUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_rejected_token_is_invalid_credential() {
        let base = canned_server("401 Unauthorized", "{}".to_string()).await;
        let provider = OpenShiftProvider::new(config(&base), &ctx()).unwrap();
        assert!(matches!(
            provider.validate("token").await,
            Err(GatewayError::InvalidCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_merges_listed_groups() {
        // One body answers both users/~ and the group listing
        let body = json!({
            "metadata": {"name": "alice", "uid": "u-1"},
            "groups": ["system:authenticated"],
            "items": [{"metadata": {"name": "devs"}, "users": ["alice"]}],
        })
        .to_string();
        let base = canned_server("200 OK", body).await;
        let provider = OpenShiftProvider::new(config(&base), &ctx()).unwrap();

        let identity = provider.validate("token").await.unwrap();
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.subject.as_deref(), Some("u-1"));
        assert_eq!(
            identity.groups,
            vec!["system:authenticated".to_string(), "devs".to_string()]
        );
    }
}
