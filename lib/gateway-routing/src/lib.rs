//! Hot-reloadable routing state
//!
//! A [`RoutingSnapshot`] is published through a [`LiveSnapshot`] handle. The
//! [`ReloadOrchestrator`] rebuilds it whenever the config file changes, driven
//! by a directory watcher and a content-hash poller that share one
//! cancellation token.

pub mod live;
pub mod poller;
pub mod reloader;
pub mod snapshot;
pub mod watcher;

pub use live::LiveSnapshot;
pub use poller::{spawn_poller, DEFAULT_POLL_INTERVAL};
pub use reloader::{ReloadHook, ReloadOrchestrator, ReloadOutcome, ReloadReason};
pub use snapshot::RoutingSnapshot;
pub use watcher::{spawn_watcher, DEBOUNCE};
