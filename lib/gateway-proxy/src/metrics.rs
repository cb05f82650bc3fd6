//! Prometheus metrics for the gateway

use crate::middleware::{Middleware, MiddlewareContext};
use anyhow::Result;
use gateway_routing::{ReloadOutcome, ReloadReason};
use prometheus::{
    CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Auth decisions recorded by the gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthDecision {
    Skipped,
    Authenticated,
    Redirected,
    Rejected,
    Unavailable,
}

impl AuthDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthDecision::Skipped => "skipped",
            AuthDecision::Authenticated => "authenticated",
            AuthDecision::Redirected => "redirected",
            AuthDecision::Rejected => "rejected",
            AuthDecision::Unavailable => "unavailable",
        }
    }
}

/// Collectors registered on a gateway-owned registry
#[derive(Clone)]
pub struct GatewayMetrics {
    pub http_requests_total: CounterVec,
    pub http_responses_total: CounterVec,
    pub http_request_duration_seconds: HistogramVec,
    pub auth_decisions_total: CounterVec,
    pub upstream_errors_total: CounterVec,
    pub config_reloads_total: CounterVec,
    pub routing_generation: IntGauge,
    pub routes: IntGauge,
    registry: Arc<Registry>,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let http_requests_total = CounterVec::new(
            Opts::new("gateway_http_requests_total", "Total HTTP requests"),
            &["method"],
        )?;
        let http_responses_total = CounterVec::new(
            Opts::new("gateway_http_responses_total", "Total HTTP responses by status"),
            &["status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "gateway_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["method"],
        )?;
        let auth_decisions_total = CounterVec::new(
            Opts::new("gateway_auth_decisions_total", "Auth gate decisions by outcome"),
            &["outcome"],
        )?;
        let upstream_errors_total = CounterVec::new(
            Opts::new("gateway_upstream_errors_total", "Failed upstream calls by kind"),
            &["kind"],
        )?;
        let config_reloads_total = CounterVec::new(
            Opts::new("gateway_config_reloads_total", "Config reload attempts"),
            &["reason", "result"],
        )?;
        let routing_generation = IntGauge::new(
            "gateway_routing_generation",
            "Generation of the live routing snapshot",
        )?;
        let routes = IntGauge::new("gateway_routes", "Routes in the live snapshot")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_responses_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(auth_decisions_total.clone()))?;
        registry.register(Box::new(upstream_errors_total.clone()))?;
        registry.register(Box::new(config_reloads_total.clone()))?;
        registry.register(Box::new(routing_generation.clone()))?;
        registry.register(Box::new(routes.clone()))?;

        Ok(Self {
            http_requests_total,
            http_responses_total,
            http_request_duration_seconds,
            auth_decisions_total,
            upstream_errors_total,
            config_reloads_total,
            routing_generation,
            routes,
            registry,
        })
    }

    pub fn record_auth(&self, decision: AuthDecision) {
        self.auth_decisions_total
            .with_label_values(&[decision.as_str()])
            .inc();
    }

    pub fn record_upstream_error(&self, kind: &str) {
        self.upstream_errors_total.with_label_values(&[kind]).inc();
    }

    /// Suitable for a reload hook
    pub fn record_reload(&self, reason: ReloadReason, result: &gateway_core::Result<ReloadOutcome>) {
        let label = match result {
            Ok(ReloadOutcome::Applied { generation, routes }) => {
                self.routing_generation.set(*generation as i64);
                self.routes.set(*routes as i64);
                "applied"
            }
            Ok(ReloadOutcome::Unchanged) => "unchanged",
            Err(_) => "failed",
        };
        self.config_reloads_total
            .with_label_values(&[reason.as_str(), label])
            .inc();
    }

    /// Prometheus text exposition
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Request counters and latency
pub struct MetricsMiddleware {
    metrics: GatewayMetrics,
}

impl MetricsMiddleware {
    pub fn new(metrics: GatewayMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait::async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "MetricsMiddleware"
    }

    async fn on_request(&self, context: &MiddlewareContext) -> Result<()> {
        self.metrics
            .http_requests_total
            .with_label_values(&[context.method.as_str()])
            .inc();
        Ok(())
    }

    async fn on_response(&self, context: &MiddlewareContext, status: u16) -> Result<()> {
        self.metrics
            .http_responses_total
            .with_label_values(&[&status.to_string()])
            .inc();
        self.metrics
            .http_request_duration_seconds
            .with_label_values(&[context.method.as_str()])
            .observe(context.started.elapsed().as_secs_f64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::GatewayError;
    use hyper::header::HeaderMap;
    use hyper::Method;

    #[test]
    fn test_reload_outcomes_are_counted() {
        let metrics = GatewayMetrics::new().unwrap();
        metrics.record_reload(
            ReloadReason::Startup,
            &Ok(ReloadOutcome::Applied { generation: 3, routes: 2 }),
        );
        metrics.record_reload(
            ReloadReason::Poll,
            &Err(GatewayError::Config("broken".to_string())),
        );
        assert_eq!(metrics.routing_generation.get(), 3);
        assert_eq!(metrics.routes.get(), 2);
        assert_eq!(
            metrics
                .config_reloads_total
                .with_label_values(&["poll", "failed"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_middleware_records_requests() {
        let metrics = GatewayMetrics::new().unwrap();
        let middleware = MetricsMiddleware::new(metrics.clone());
        let context = MiddlewareContext::new(Method::POST, "/x", &HeaderMap::new());
        middleware.on_request(&context).await.unwrap();
        middleware.on_response(&context, 502).await.unwrap();
        metrics.record_auth(AuthDecision::Redirected);

        let text = metrics.gather().unwrap();
        assert!(text.contains("gateway_http_requests_total{method=\"POST\"} 1"));
        assert!(text.contains("gateway_http_responses_total{status=\"502\"} 1"));
        assert!(text.contains("gateway_auth_decisions_total{outcome=\"redirected\"} 1"));
    }
}
