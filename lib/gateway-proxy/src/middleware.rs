//! Request/response hooks run around every gateway request

use anyhow::Result;
use hyper::header::HeaderMap;
use hyper::Method;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, span, Instrument, Level};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
const TRACEPARENT_HEADER: &str = "traceparent";

/// Context passed through the middleware chain
#[derive(Clone)]
pub struct MiddlewareContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
    pub started: Instant,
    /// Values middleware and handlers attach for later hooks
    pub metadata: Arc<Mutex<HashMap<&'static str, String>>>,
}

impl MiddlewareContext {
    pub fn new(method: Method, path: impl Into<String>, headers: &HeaderMap) -> Self {
        Self {
            request_id: request_id_from(headers),
            method,
            path: path.into(),
            started: Instant::now(),
            metadata: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn get_metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().get(key).cloned()
    }

    pub fn set_metadata(&self, key: &'static str, value: impl Into<String>) {
        self.metadata.lock().insert(key, value.into());
    }
}

/// Reuse the caller's request id, or the trace id of a W3C `traceparent`,
/// otherwise mint a fresh one
pub fn request_id_from(headers: &HeaderMap) -> String {
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
    {
        return id.to_string();
    }

    // version-trace_id-span_id-trace_flags
    if let Some(trace_id) = headers
        .get(TRACEPARENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split('-').nth(1))
        .filter(|t| t.len() == 32 && t.bytes().all(|b| b.is_ascii_hexdigit()))
    {
        return trace_id.to_string();
    }

    generate_request_id()
}

/// Random 32 hex digits
pub fn generate_request_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str {
        "UnnamedMiddleware"
    }

    async fn on_request(&self, _context: &MiddlewareContext) -> Result<()> {
        Ok(())
    }

    async fn on_response(&self, _context: &MiddlewareContext, _status: u16) -> Result<()> {
        Ok(())
    }
}

/// Chain of middleware to execute in order
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        for mw in &self.middleware {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_request(context).instrument(span).await?;
        }
        Ok(())
    }

    /// Response hooks run in reverse order
    pub async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        for mw in self.middleware.iter().rev() {
            let span = span!(Level::DEBUG, "middleware", name = mw.name());
            mw.on_response(context, status).instrument(span).await?;
        }
        Ok(())
    }
}

/// One `info` line per completed request
pub struct AccessLogMiddleware;

#[async_trait::async_trait]
impl Middleware for AccessLogMiddleware {
    fn name(&self) -> &'static str {
        "AccessLogMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        debug!(
            request_id = %context.request_id,
            method = %context.method,
            path = %context.path,
            "Request started"
        );
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        let elapsed = context.started.elapsed();
        info!(
            request_id = %context.request_id,
            method = %context.method,
            path = %context.path,
            status = status,
            route = context.get_metadata("route").as_deref().unwrap_or("-"),
            user = context.get_metadata("user").as_deref().unwrap_or("-"),
            duration_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
        Ok(())
    }
}
