//! Upstream request forwarding
//!
//! Requests are sent through one pooled client whose connector speaks plain
//! HTTP and HTTPS, so routes may point at either. Bodies are buffered in both
//! directions up to a size limit, and the whole exchange, response body
//! included, runs under one deadline. Protocol upgrades (WebSocket) are the
//! exception: the `101` handshake is returned as soon as it arrives and the
//! caller joins the two upgraded connections.

use crate::settings::{GatewaySettings, IdentityHeaders, UpstreamAuthMode, UpstreamSettings};
use crate::upstream_tls::UpstreamTls;
use gateway_core::{GatewayError, Identity};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONNECTION, COOKIE, HOST, UPGRADE,
};
use hyper::http::request::Parts;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::tokio::TokioExecutor;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request inputs to [`RequestForwarder::forward`]
#[derive(Clone, Copy, Debug, Default)]
pub struct ForwardContext<'a> {
    pub peer: Option<SocketAddr>,
    pub identity: Option<&'a Identity>,
    /// Verified credential, passed upstream according to the auth mode
    pub credential: Option<&'a str>,
    pub request_id: Option<&'a str>,
}

pub struct RequestForwarder {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
    max_body_bytes: usize,
    identity_headers: IdentityHeaders,
    upstream_auth: UpstreamAuthMode,
    scheme: &'static str,
}

impl RequestForwarder {
    pub fn new(settings: &GatewaySettings, tls: &UpstreamTls) -> anyhow::Result<Self> {
        let UpstreamSettings {
            connect_timeout,
            request_timeout,
            pool_idle_timeout,
            pool_max_idle_per_host,
            max_body_bytes,
        } = settings.upstream.clone();

        let mut http = HttpConnector::new();
        http.set_connect_timeout(Some(connect_timeout));
        http.set_keepalive(Some(Duration::from_secs(30)));
        http.enforce_http(false);

        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls.client_config()?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(pool_idle_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build::<_, Full<Bytes>>(connector);

        Ok(Self {
            client,
            timeout: request_timeout,
            max_body_bytes,
            identity_headers: settings.identity_headers.clone(),
            upstream_auth: settings.upstream_auth,
            scheme: settings.scheme(),
        })
    }

    /// Send a request to `target_url` and buffer the response
    ///
    /// Not retried. A connect or protocol failure, or a response body over the
    /// size limit, is reported as [`GatewayError::Upstream`]; a missed deadline
    /// as [`GatewayError::UpstreamTimeout`]. For an upgrade request answered
    /// with `101 Switching Protocols` the response keeps its upgrade headers
    /// and its pending upgrade, see [`hyper::upgrade::on`].
    pub async fn forward(
        &self,
        target_url: &str,
        mut parts: Parts,
        body: Bytes,
        ctx: ForwardContext<'_>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let uri: Uri = target_url
            .parse()
            .map_err(|e| GatewayError::Upstream(format!("invalid target {}: {}", target_url, e)))?;
        debug!("Forwarding request to: {}", target_url);

        let upgrade = upgrade_protocol(&parts.headers);
        self.prepare_headers(&mut parts.headers, &ctx);
        if let Some(protocol) = &upgrade {
            parts.headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
            parts.headers.insert(UPGRADE, protocol.clone());
        }
        parts.uri = uri;
        let forwarded_request = Request::from_parts(parts, Full::new(body));

        let exchange = self.exchange(forwarded_request, upgrade.is_some());
        let response = match tokio_timeout(self.timeout, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(upstream = %target_url, error = %e, "Backend request error");
                return Err(e);
            }
            Err(_) => {
                warn!(upstream = %target_url, "Backend request timeout after {:?}", self.timeout);
                return Err(GatewayError::UpstreamTimeout(format!(
                    "no complete response from {} within {:?}",
                    target_url, self.timeout
                )));
            }
        };

        debug!(
            status = %response.status(),
            bytes = response.body().len(),
            "Backend responded"
        );
        Ok(response)
    }

    async fn exchange(
        &self,
        request: Request<Full<Bytes>>,
        upgrading: bool,
    ) -> Result<Response<Bytes>, GatewayError> {
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let (mut parts, incoming) = response.into_parts();
        if upgrading && parts.status == StatusCode::SWITCHING_PROTOCOLS {
            return Ok(Response::from_parts(parts, Bytes::new()));
        }

        let bytes = Limited::new(incoming, self.max_body_bytes)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    GatewayError::Upstream(format!(
                        "response body exceeds {} bytes",
                        self.max_body_bytes
                    ))
                } else {
                    GatewayError::Upstream(format!("failed to read response body: {}", e))
                }
            })?
            .to_bytes();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, bytes))
    }

    /// Rewrite inbound headers into what the upstream receives
    pub(crate) fn prepare_headers(&self, headers: &mut HeaderMap, ctx: &ForwardContext<'_>) {
        strip_hop_by_hop(headers);
        headers.remove(COOKIE);

        // Identity headers only ever come from the gateway
        for name in self.identity_headers.all() {
            headers.remove(name);
        }

        // The client derives Host from the target URI
        let original_host = headers.remove(HOST);
        if !headers.contains_key(X_FORWARDED_HOST) {
            if let Some(host) = original_host {
                headers.insert(X_FORWARDED_HOST, host);
            }
        }
        if !headers.contains_key(X_FORWARDED_PROTO) {
            headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(self.scheme));
        }
        if !headers.contains_key(X_FORWARDED_FOR) {
            if let Some(peer) = ctx.peer {
                if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
                    headers.insert(X_FORWARDED_FOR, value);
                }
            }
        }
        if let Some(request_id) = ctx.request_id {
            if let Ok(value) = HeaderValue::from_str(request_id) {
                headers.insert(X_REQUEST_ID, value);
            }
        }

        if let Some(identity) = ctx.identity {
            let subject = identity.subject.as_deref().unwrap_or(&identity.username);
            let groups = identity.groups_header();
            let values = [
                (&self.identity_headers.user, Some(identity.username.as_str())),
                (&self.identity_headers.user_id, Some(subject)),
                (&self.identity_headers.groups, Some(groups.as_str()).filter(|g| !g.is_empty())),
                (&self.identity_headers.email, identity.email.as_deref()),
            ];
            for (name, value) in values {
                let Some(value) = value else { continue };
                match HeaderValue::from_str(value) {
                    Ok(value) => {
                        headers.insert(name.clone(), value);
                    }
                    Err(_) => warn!(header = %name, "Identity value is not a valid header value"),
                }
            }
        }

        if let Some(credential) = ctx.credential {
            let value = match self.upstream_auth {
                UpstreamAuthMode::None => None,
                UpstreamAuthMode::Raw => HeaderValue::from_str(credential).ok(),
                UpstreamAuthMode::Bearer => HeaderValue::from_str(&format!("Bearer {}", credential)).ok(),
            };
            if let Some(mut value) = value {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
            }
        }
    }
}

/// Protocol named by an upgrade request (`Connection: upgrade` plus `Upgrade`)
pub(crate) fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if !requested {
        return None;
    }
    headers.get(UPGRADE).filter(|v| !v.is_empty()).cloned()
}

/// Check if header is hop-by-hop (should not be forwarded)
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove the fixed hop-by-hop set plus anything named in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }

    let fixed: Vec<HeaderName> = headers
        .keys()
        .filter(|k| is_hop_by_hop_header(k.as_str()))
        .cloned()
        .collect();
    for name in fixed {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(mode: UpstreamAuthMode) -> RequestForwarder {
        let settings = GatewaySettings {
            upstream_auth: mode,
            ..Default::default()
        };
        RequestForwarder::new(&settings, &UpstreamTls::default()).unwrap()
    }

    fn inbound() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("gateway.example.com"));
        headers.insert(COOKIE, HeaderValue::from_static("auth_token=secret"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, x-private"));
        headers.insert("x-private", HeaderValue::from_static("1"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-forwarded-user", HeaderValue::from_static("mallory"));
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers
    }

    #[test]
    fn test_hop_by_hop_headers() {
        assert!(is_hop_by_hop_header("connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(!is_hop_by_hop_header("content-type"));
        assert!(!is_hop_by_hop_header("authorization"));
    }

    #[test]
    fn test_upgrade_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        assert!(upgrade_protocol(&headers).is_none());

        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        assert_eq!(upgrade_protocol(&headers).unwrap(), "websocket");

        headers.remove(UPGRADE);
        assert!(upgrade_protocol(&headers).is_none());
    }

    #[tokio::test]
    async fn test_unauthenticated_headers() {
        let forwarder = forwarder(UpstreamAuthMode::None);
        let mut headers = inbound();
        let ctx = ForwardContext {
            peer: Some("10.1.2.3:5555".parse().unwrap()),
            request_id: Some("req-1"),
            ..Default::default()
        };
        forwarder.prepare_headers(&mut headers, &ctx);

        assert!(headers.get(COOKIE).is_none());
        assert!(headers.get(CONNECTION).is_none());
        assert!(headers.get("x-private").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get(HOST).is_none());
        assert!(headers.get("x-forwarded-user").is_none());
        assert_eq!(headers["accept"], "text/html");
        assert_eq!(headers[X_FORWARDED_HOST], "gateway.example.com");
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
        assert_eq!(headers[X_FORWARDED_FOR], "10.1.2.3");
        assert_eq!(headers[X_REQUEST_ID], "req-1");
    }

    #[tokio::test]
    async fn test_existing_forwarded_headers_are_kept() {
        let forwarder = forwarder(UpstreamAuthMode::None);
        let mut headers = inbound();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("192.0.2.1"));
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        let ctx = ForwardContext {
            peer: Some("10.1.2.3:5555".parse().unwrap()),
            ..Default::default()
        };
        forwarder.prepare_headers(&mut headers, &ctx);
        assert_eq!(headers[X_FORWARDED_FOR], "192.0.2.1");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
    }

    #[tokio::test]
    async fn test_identity_and_bearer_injection() {
        let forwarder = forwarder(UpstreamAuthMode::Bearer);
        let identity = Identity::new("alice")
            .with_email(Some("alice@example.com".to_string()))
            .with_subject(Some("u-1".to_string()))
            .with_groups(["devs", "admins"]);
        let mut headers = inbound();
        let ctx = ForwardContext {
            identity: Some(&identity),
            credential: Some("tok"),
            ..Default::default()
        };
        forwarder.prepare_headers(&mut headers, &ctx);

        assert_eq!(headers["x-forwarded-user"], "alice");
        assert_eq!(headers["x-forwarded-user-id"], "u-1");
        assert_eq!(headers["x-forwarded-groups"], "devs,admins");
        assert_eq!(headers["x-forwarded-email"], "alice@example.com");
        assert_eq!(headers[AUTHORIZATION], "Bearer tok");
    }

    #[tokio::test]
    async fn test_raw_and_passthrough_authorization() {
        let identity = Identity::new("bob");
        let ctx = ForwardContext {
            identity: Some(&identity),
            credential: Some("tok"),
            ..Default::default()
        };

        let mut headers = HeaderMap::new();
        forwarder(UpstreamAuthMode::Raw).prepare_headers(&mut headers, &ctx);
        assert_eq!(headers[AUTHORIZATION], "tok");
        assert_eq!(headers["x-forwarded-user-id"], "bob");
        assert!(headers.get("x-forwarded-groups").is_none());

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        forwarder(UpstreamAuthMode::None).prepare_headers(&mut headers, &ctx);
        assert_eq!(headers[AUTHORIZATION], "Basic abc");
    }
}
