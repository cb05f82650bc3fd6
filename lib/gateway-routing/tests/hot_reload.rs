use gateway_auth::ProviderContext;
use gateway_core::ConfigSource;
use gateway_routing::{spawn_poller, spawn_watcher, LiveSnapshot, ReloadOrchestrator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn routes(prefix: &str) -> String {
    format!("routes:\n  - path: {}\n    upstream: http://backend:9000\n", prefix)
}

async fn bootstrapped(path: &Path) -> Arc<ReloadOrchestrator> {
    let orchestrator = Arc::new(ReloadOrchestrator::new(
        ConfigSource::new(path),
        Arc::new(LiveSnapshot::default()),
        ProviderContext::new("http://localhost:8080/auth/callback"),
    ));
    orchestrator.bootstrap().await.unwrap();
    orchestrator
}

/// Wait up to five seconds for the live snapshot to route `path`
async fn eventually_routes(orchestrator: &ReloadOrchestrator, path: &str) -> bool {
    for _ in 0..100 {
        if orchestrator.live().get().lookup(path).is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_poller_picks_up_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, routes("/first")).unwrap();
    let orchestrator = bootstrapped(&path).await;

    let cancel = CancellationToken::new();
    let poller = spawn_poller(Arc::clone(&orchestrator), Duration::from_millis(50), cancel.clone());

    std::fs::write(&path, routes("/second")).unwrap();
    assert!(eventually_routes(&orchestrator, "/second/x").await);
    assert!(orchestrator.live().get().lookup("/first/x").is_none());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), poller).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_poller_keeps_last_good_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, routes("/stable")).unwrap();
    let orchestrator = bootstrapped(&path).await;

    let cancel = CancellationToken::new();
    let poller = spawn_poller(Arc::clone(&orchestrator), Duration::from_millis(50), cancel.clone());

    std::fs::write(&path, "routes: [oops").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let live = orchestrator.live().get();
    assert_eq!(live.generation(), 1);
    assert!(live.lookup("/stable/x").is_some());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), poller).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_watcher_picks_up_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, routes("/before")).unwrap();
    let orchestrator = bootstrapped(&path).await;

    let cancel = CancellationToken::new();
    let watcher = spawn_watcher(Arc::clone(&orchestrator), cancel.clone()).unwrap();
    // Let the OS watch settle before mutating
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(&path, routes("/after")).unwrap();
    assert!(eventually_routes(&orchestrator, "/after/x").await);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), watcher).await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_configmap_style_symlink_swap() {
    use std::os::unix::fs::symlink;

    let dir = tempfile::tempdir().unwrap();
    let gen1 = dir.path().join("..2024_01");
    let gen2 = dir.path().join("..2024_02");
    std::fs::create_dir(&gen1).unwrap();
    std::fs::create_dir(&gen2).unwrap();
    std::fs::write(gen1.join("config.yaml"), routes("/v1")).unwrap();
    std::fs::write(gen2.join("config.yaml"), routes("/v2")).unwrap();

    let data = dir.path().join("..data");
    symlink(&gen1, &data).unwrap();
    let path = dir.path().join("config.yaml");
    symlink(data.join("config.yaml"), &path).unwrap();

    let orchestrator = bootstrapped(&path).await;
    assert!(orchestrator.live().get().lookup("/v1/x").is_some());

    let cancel = CancellationToken::new();
    let poller = spawn_poller(Arc::clone(&orchestrator), Duration::from_millis(50), cancel.clone());

    // Atomic swap the way the kubelet does it
    let tmp = dir.path().join("..data_tmp");
    symlink(&gen2, &tmp).unwrap();
    std::fs::rename(&tmp, &data).unwrap();

    assert!(eventually_routes(&orchestrator, "/v2/x").await);
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), poller).await.unwrap().unwrap();
}
