use anyhow::{Context, Result};
use clap::Parser;
use gateway_auth::ProviderContext;
use gateway_core::ConfigSource;
use gateway_proxy::{load_server_config, Gateway, GatewayMetrics, RequestForwarder};
use gateway_routing::{
    spawn_poller, spawn_watcher, LiveSnapshot, ReloadHook, ReloadOrchestrator, ReloadOutcome,
    ReloadReason, DEFAULT_POLL_INTERVAL,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Args, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!("Starting auth-gateway...");

    let settings = args.settings()?;
    let metrics = GatewayMetrics::new().context("Failed to create metrics registry")?;

    // TLS material is only fatal when TLS was asked for
    let tls_acceptor = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(TlsAcceptor::from(load_server_config(cert, key)?)),
        _ => {
            warn!("TLS not configured - serving plain HTTP");
            None
        }
    };

    let live = Arc::new(LiveSnapshot::default());
    let provider_ctx = ProviderContext::new(settings.callback_url()).with_timeout(args.provider_timeout());
    let hook: ReloadHook = {
        let metrics = metrics.clone();
        Arc::new(
            move |reason: ReloadReason, result: &gateway_core::Result<ReloadOutcome>| {
                metrics.record_reload(reason, result)
            },
        )
    };
    let orchestrator = Arc::new(
        ReloadOrchestrator::new(ConfigSource::new(&args.config), Arc::clone(&live), provider_ctx)
            .with_fallback_provider(args.fallback_provider())
            .with_hook(hook),
    );

    let snapshot = orchestrator
        .bootstrap()
        .await
        .with_context(|| format!("Failed to load initial configuration from {}", args.config.display()))?;
    info!(
        routes = snapshot.routes().len(),
        provider = snapshot.provider().name(),
        "Initial configuration loaded"
    );

    let cancel = CancellationToken::new();
    let watcher = spawn_watcher(Arc::clone(&orchestrator), cancel.clone())?;
    let poller = spawn_poller(Arc::clone(&orchestrator), DEFAULT_POLL_INTERVAL, cancel.clone());

    let forwarder = RequestForwarder::new(&settings, &args.upstream_tls()?)?;
    let gateway = Arc::new(Gateway::new(settings, live, forwarder, metrics));

    let listener = TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen_addr))?;
    info!(
        "{} server listening on {}",
        if tls_acceptor.is_some() { "HTTPS" } else { "HTTP" },
        args.listen_addr
    );

    tokio::select! {
        _ = accept_loop(listener, gateway, tls_acceptor) => {}
        _ = shutdown_signal() => info!("Shutdown signal received"),
    }

    cancel.cancel();
    for task in [watcher, poller] {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!("Background reload task did not stop in time");
        }
    }
    info!("auth-gateway stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Serve each accepted connection on its own task
async fn accept_loop(listener: TcpListener, gateway: Arc<Gateway>, tls_acceptor: Option<TlsAcceptor>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Error accepting connection: {}", e);
                continue;
            }
        };

        let gateway = Arc::clone(&gateway);
        let tls_acceptor = tls_acceptor.clone();
        tokio::task::spawn(async move {
            match tls_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve(tls_stream, peer_addr, gateway).await,
                    Err(e) => debug!("TLS error from {}: {}", peer_addr, e),
                },
                None => serve(stream, peer_addr, gateway).await,
            }
        });
    }
}

async fn serve<S>(stream: S, peer_addr: SocketAddr, gateway: Arc<Gateway>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req, Some(peer_addr)).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!("Error serving connection from {}: {}", peer_addr, e);
    }
}
