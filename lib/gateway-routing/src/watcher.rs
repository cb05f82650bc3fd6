//! Filesystem-event reload trigger
//!
//! ConfigMap volumes replace content by atomically re-pointing a `..data`
//! symlink, so a watch on the file itself misses the swap. The watch is placed
//! on the containing directory instead and any event touching the config file
//! name or a `..data` entry counts.

use crate::{ReloadOrchestrator, ReloadReason};
use gateway_core::{GatewayError, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Quiet period that collapses a burst of events into one reload
pub const DEBOUNCE: Duration = Duration::from_millis(500);

const CONFIGMAP_DATA_DIR: &str = "..data";

/// Start watching the config file's directory
///
/// The returned task owns the OS watcher and runs until `cancel` fires.
pub fn spawn_watcher(
    orchestrator: Arc<ReloadOrchestrator>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let config_path = orchestrator.source().path().to_path_buf();
    let file_name = config_path
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| GatewayError::Config(format!("{} has no file name", config_path.display())))?;
    let watch_dir = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => Path::new(".").to_path_buf(),
    };

    let (event_tx, event_rx) = mpsc::channel(32);
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<Event>| match result {
            Ok(event) if is_relevant(&event, &file_name) => {
                // A full channel already guarantees a pending reload
                let _ = event_tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Config watcher error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| GatewayError::Config(format!("failed to create config watcher: {}", e)))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| GatewayError::Config(format!("failed to watch {}: {}", watch_dir.display(), e)))?;
    info!(dir = %watch_dir.display(), "Watching config directory");

    Ok(tokio::spawn(run(watcher, orchestrator, event_rx, cancel)))
}

async fn run(
    _watcher: RecommendedWatcher,
    orchestrator: Arc<ReloadOrchestrator>,
    mut events: mpsc::Receiver<()>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => {
                if received.is_none() {
                    break;
                }
                if !debounce(&mut events, &cancel).await {
                    break;
                }
                let _ = orchestrator.reload(ReloadReason::FileEvent).await;
            }
        }
    }
    info!("Config watcher stopped");
}

/// Wait until no event arrived for [`DEBOUNCE`]; `false` when cancelled
async fn debounce(events: &mut mpsc::Receiver<()>, cancel: &CancellationToken) -> bool {
    let deadline = sleep(DEBOUNCE);
    tokio::pin!(deadline);
    let mut collapsed = 0usize;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = &mut deadline => break,
            Some(()) = events.recv() => {
                collapsed += 1;
                deadline.as_mut().reset(Instant::now() + DEBOUNCE);
            }
        }
    }
    if collapsed > 0 {
        debug!(collapsed, "Collapsed config file events");
    }
    true
}

fn is_relevant(event: &Event, file_name: &OsString) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    );
    kind_matches
        && event.paths.iter().any(|path| {
            path.file_name().is_some_and(|name| {
                name == file_name.as_os_str() || name.to_string_lossy().starts_with(CONFIGMAP_DATA_DIR)
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{AccessKind, CreateKind, ModifyKind};
    use std::path::PathBuf;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_relevant_events() {
        let name = OsString::from("config.yaml");
        assert!(is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/gateway/config.yaml"),
            &name
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::Any), "/etc/gateway/..data"),
            &name
        ));
        assert!(is_relevant(
            &event(EventKind::Create(CreateKind::Any), "/etc/gateway/..data_tmp"),
            &name
        ));
    }

    #[test]
    fn test_irrelevant_events() {
        let name = OsString::from("config.yaml");
        assert!(!is_relevant(
            &event(EventKind::Modify(ModifyKind::Any), "/etc/gateway/other.yaml"),
            &name
        ));
        assert!(!is_relevant(
            &event(EventKind::Access(AccessKind::Any), "/etc/gateway/config.yaml"),
            &name
        ));
    }
}
