use crate::RoutingSnapshot;
use parking_lot::RwLock;
use std::sync::Arc;

/// Shared handle to the snapshot currently serving traffic
///
/// Readers clone the inner `Arc` under a read lock and then work on their own
/// reference, so a request keeps a consistent view for its whole lifetime even
/// when a reload lands mid-flight. The write lock is held only for the pointer
/// swap.
pub struct LiveSnapshot {
    inner: RwLock<Arc<RoutingSnapshot>>,
}

impl Default for LiveSnapshot {
    fn default() -> Self {
        Self::new(RoutingSnapshot::empty())
    }
}

impl LiveSnapshot {
    pub fn new(snapshot: RoutingSnapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn get(&self) -> Arc<RoutingSnapshot> {
        Arc::clone(&self.inner.read())
    }

    /// Publish a fully built snapshot, returning the one it replaced
    pub fn swap(&self, snapshot: Arc<RoutingSnapshot>) -> Arc<RoutingSnapshot> {
        std::mem::replace(&mut *self.inner.write(), snapshot)
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation()
    }
}
