use crate::{ReloadOrchestrator, ReloadReason};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Periodically re-read the config file, reloading when its hash changes
///
/// Bounds staleness when filesystem notifications are delayed or lost on
/// mounted volumes. Unchanged content is a cheap no-op in the orchestrator.
pub fn spawn_poller(
    orchestrator: Arc<ReloadOrchestrator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately and bootstrap already loaded the file
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let _ = orchestrator.reload(ReloadReason::Poll).await;
                }
            }
        }
        info!("Config poller stopped");
    })
}
