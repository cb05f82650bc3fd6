//! Reload orchestration
//!
//! Both reload triggers (filesystem events and the hash poller) funnel into
//! [`ReloadOrchestrator::reload`]. A reload:
//!
//! 1. Reads the config file through its symlinks and hashes the bytes
//! 2. Returns early when the hash equals the last one observed
//! 3. Parses the file and builds a complete snapshot off-lock, reusing the
//!    live provider instance when its specification did not change
//! 4. Swaps the live pointer
//!
//! Any failure before step 4 leaves the live snapshot untouched.

use crate::{LiveSnapshot, RoutingSnapshot};
use gateway_auth::{build_provider, ProviderContext};
use gateway_core::{ConfigSource, GatewayConfig, ProviderConfig, Result, RouteTable};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What asked for the reload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadReason {
    Startup,
    FileEvent,
    Poll,
    Manual,
}

impl ReloadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReloadReason::Startup => "startup",
            ReloadReason::FileEvent => "file_event",
            ReloadReason::Poll => "poll",
            ReloadReason::Manual => "manual",
        }
    }
}

impl fmt::Display for ReloadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new snapshot was published
    Applied { generation: u64, routes: usize },
    /// The file content matched the last observed hash
    Unchanged,
}

/// Callback invoked after every reload attempt
pub type ReloadHook = Arc<dyn Fn(ReloadReason, &Result<ReloadOutcome>) + Send + Sync>;

pub struct ReloadOrchestrator {
    source: ConfigSource,
    live: Arc<LiveSnapshot>,
    provider_ctx: ProviderContext,
    fallback_provider: Option<ProviderConfig>,
    /// Hash of the last bytes observed; the lock also serializes reloads
    last_hash: Mutex<Option<String>>,
    hook: Option<ReloadHook>,
}

impl ReloadOrchestrator {
    pub fn new(source: ConfigSource, live: Arc<LiveSnapshot>, provider_ctx: ProviderContext) -> Self {
        Self {
            source,
            live,
            provider_ctx,
            fallback_provider: None,
            last_hash: Mutex::new(None),
            hook: None,
        }
    }

    /// Provider used when the file carries no `provider` block
    pub fn with_fallback_provider(mut self, provider: Option<ProviderConfig>) -> Self {
        self.fallback_provider = provider;
        self
    }

    pub fn with_hook(mut self, hook: ReloadHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    pub fn live(&self) -> &Arc<LiveSnapshot> {
        &self.live
    }

    /// Load the initial configuration
    ///
    /// Unlike later reloads there is no previous snapshot to fall back to, so
    /// failure is returned to the caller as fatal.
    pub async fn bootstrap(&self) -> Result<Arc<RoutingSnapshot>> {
        self.reload(ReloadReason::Startup).await?;
        Ok(self.live.get())
    }

    /// Rebuild and publish the snapshot if the config file changed
    pub async fn reload(&self, reason: ReloadReason) -> Result<ReloadOutcome> {
        let result = self.try_reload(reason).await;
        match &result {
            Ok(ReloadOutcome::Applied { generation, routes }) => {
                info!(reason = %reason, generation, routes, "Routing configuration applied");
            }
            Ok(ReloadOutcome::Unchanged) => {
                debug!(reason = %reason, "Routing configuration unchanged");
            }
            Err(e) => {
                warn!(
                    reason = %reason,
                    path = %self.source.path().display(),
                    error = %e,
                    "Routing configuration reload failed, keeping current snapshot"
                );
            }
        }
        if let Some(hook) = &self.hook {
            hook(reason, &result);
        }
        result
    }

    async fn try_reload(&self, reason: ReloadReason) -> Result<ReloadOutcome> {
        let mut last_hash = self.last_hash.lock().await;

        let content = self.source.read().await?;
        if reason != ReloadReason::Startup && last_hash.as_deref() == Some(content.hash.as_str()) {
            return Ok(ReloadOutcome::Unchanged);
        }
        // Recorded before parsing so an unchanged broken file is not re-parsed every tick
        *last_hash = Some(content.hash.clone());

        let config = content.parse()?;
        let current = self.live.get();
        let snapshot = self.build_snapshot(config, content.hash, current.generation() + 1, &current);
        let outcome = ReloadOutcome::Applied {
            generation: snapshot.generation(),
            routes: snapshot.routes().len(),
        };

        self.live.swap(Arc::new(snapshot));
        Ok(outcome)
    }

    fn build_snapshot(
        &self,
        config: GatewayConfig,
        hash: String,
        generation: u64,
        current: &RoutingSnapshot,
    ) -> RoutingSnapshot {
        let spec = config
            .provider
            .as_ref()
            .or(self.fallback_provider.as_ref())
            .map(ProviderConfig::resolve)
            .unwrap_or_default();

        let provider = if &spec == current.provider_spec() {
            debug!(provider = spec.name(), "Provider configuration unchanged, reusing instance");
            Arc::clone(current.provider())
        } else {
            build_provider(&spec, &self.provider_ctx)
        };

        RoutingSnapshot::new(
            RouteTable::from_config(&config.routes),
            spec,
            provider,
            generation,
            Some(hash),
        )
    }
}
