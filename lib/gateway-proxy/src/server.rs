//! Request entry point
//!
//! [`Gateway::handle`] is the only thing the listener calls. It reads the live
//! snapshot once per request, so a reload landing mid-request never changes
//! the route or provider that request is using.

use crate::forwarder::{upgrade_protocol, ForwardContext, RequestForwarder};
use crate::gate::{AuthGate, GateOutcome};
use crate::metrics::{AuthDecision, GatewayMetrics, MetricsMiddleware};
use crate::middleware::{AccessLogMiddleware, MiddlewareChain, MiddlewareContext, REQUEST_ID_HEADER};
use crate::response::{text, GatewayBody};
use crate::settings::GatewaySettings;
use gateway_core::GatewayError;
use gateway_routing::LiveSnapshot;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Gateway {
    settings: Arc<GatewaySettings>,
    live: Arc<LiveSnapshot>,
    gate: AuthGate,
    forwarder: RequestForwarder,
    metrics: GatewayMetrics,
    middleware: MiddlewareChain,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        live: Arc<LiveSnapshot>,
        forwarder: RequestForwarder,
        metrics: GatewayMetrics,
    ) -> Self {
        let settings = Arc::new(settings);
        let middleware = MiddlewareChain::new()
            .add(AccessLogMiddleware)
            .add(MetricsMiddleware::new(metrics.clone()));
        Self {
            gate: AuthGate::new(Arc::clone(&settings)),
            settings,
            live,
            forwarder,
            metrics,
            middleware,
        }
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn live(&self) -> &Arc<LiveSnapshot> {
        &self.live
    }

    /// Serve one request
    ///
    /// Never fails: every error becomes a status code. Dropping the returned
    /// future (client went away) abandons any in-flight provider or upstream
    /// call with it. Upgrade requests are tunnelled only when the connection
    /// was served with upgrades enabled.
    pub async fn handle<B>(&self, request: Request<B>, peer: Option<SocketAddr>) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let context = MiddlewareContext::new(parts.method.clone(), parts.uri.path(), &parts.headers);
        if let Err(e) = self.middleware.on_request(&context).await {
            debug!(error = %e, "Middleware request hook failed");
        }

        let mut response = self.dispatch(parts, body, peer, &context).await;

        if let Ok(value) = HeaderValue::from_str(&context.request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        if let Err(e) = self
            .middleware
            .on_response(&context, response.status().as_u16())
            .await
        {
            debug!(error = %e, "Middleware response hook failed");
        }
        response
    }

    async fn dispatch<B>(
        &self,
        mut parts: Parts,
        body: B,
        peer: Option<SocketAddr>,
        context: &MiddlewareContext,
    ) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let paths = &self.settings.paths;
        let path = parts.uri.path().to_string();

        if path == paths.healthz {
            return text(StatusCode::OK, "ok\n");
        }
        if path == paths.readyz {
            return self.readiness();
        }
        if path == paths.metrics {
            return self.metrics_response();
        }

        // One snapshot for the whole request
        let snapshot = self.live.get();
        let provider = snapshot.provider();

        if paths.is_auth_path(&path) {
            return self.gate.handle_auth_path(&parts, provider).await;
        }

        let Some(route) = snapshot.lookup(&path) else {
            debug!(path = %path, "No route");
            return text(StatusCode::NOT_FOUND, "Not Found\n");
        };
        context.set_metadata("route", route.prefix());

        let auth_required = route.effective_auth(self.settings.auth_default);
        let (identity, credential) = match self.gate.evaluate(&parts, auth_required, provider).await {
            GateOutcome::Skipped => {
                self.metrics.record_auth(AuthDecision::Skipped);
                (None, None)
            }
            GateOutcome::Authenticated {
                identity,
                credential,
            } => {
                self.metrics.record_auth(AuthDecision::Authenticated);
                context.set_metadata("user", identity.username.clone());
                (Some(identity), Some(credential))
            }
            GateOutcome::Respond(decision, response) => {
                self.metrics.record_auth(decision);
                return response;
            }
        };

        let limit = self.settings.upstream.max_body_bytes;
        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                let error = GatewayError::BodyTooLarge(format!("request body exceeds {} bytes", limit));
                debug!(error = %error, "Rejected request body");
                return text(status_of(&error), "Request body too large\n");
            }
            Err(e) => {
                debug!(error = %e, "Failed to read request body");
                return text(StatusCode::BAD_REQUEST, "Failed to read request body\n");
            }
        };

        let client_upgrade = upgrade_protocol(&parts.headers)
            .and_then(|_| parts.extensions.remove::<OnUpgrade>());

        let target = route.target_url(&path, parts.uri.query());
        let ctx = ForwardContext {
            peer,
            identity: identity.as_ref(),
            credential: credential.as_deref(),
            request_id: Some(&context.request_id),
        };
        let mut response = match self.forwarder.forward(&target, parts, body, ctx).await {
            Ok(response) => response,
            Err(e) => return self.upstream_failure(&e),
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            let Some(client_upgrade) = client_upgrade else {
                warn!(upstream = %target, "Backend switched protocols but the client connection cannot upgrade");
                return self.upstream_failure(&GatewayError::Upstream("upgrade unavailable".to_string()));
            };
            let upstream_upgrade = hyper::upgrade::on(&mut response);
            tokio::spawn(tunnel(client_upgrade, upstream_upgrade));
        }
        response.map(Full::new)
    }

    fn upstream_failure(&self, error: &GatewayError) -> Response<GatewayBody> {
        let (kind, message) = match error {
            GatewayError::UpstreamTimeout(_) => ("timeout", "Backend service request timeout\n"),
            _ => ("connect", "Error communicating with backend service\n"),
        };
        self.metrics.record_upstream_error(kind);
        text(status_of(error), message)
    }

    fn readiness(&self) -> Response<GatewayBody> {
        let generation = self.live.generation();
        if generation == 0 {
            text(StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
        } else {
            text(StatusCode::OK, format!("ready generation={}\n", generation))
        }
    }

    fn metrics_response(&self) -> Response<GatewayBody> {
        match self.metrics.gather() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                warn!(error = %e, "Failed to encode metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error\n")
            }
        }
    }
}

fn status_of(error: &GatewayError) -> StatusCode {
    StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::BAD_GATEWAY)
}

/// Copy bytes both ways between the upgraded client and backend connections
async fn tunnel(client: OnUpgrade, upstream: OnUpgrade) {
    let (client, upstream) = match tokio::try_join!(client, upstream) {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, "Connection upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut upstream = TokioIo::new(upstream);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((from_client, from_upstream)) => {
            debug!(from_client, from_upstream, "Upgraded connection closed")
        }
        Err(e) => debug!(error = %e, "Upgraded connection ended with error"),
    }
}
