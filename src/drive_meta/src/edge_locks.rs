use std::sync::Arc;

use dashmap::DashMap;
use drive_lib::ObjectId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// A directory entry slot: (parent id, child name).
pub(crate) type EdgeKey = (ObjectId, String);

/// Per-edge async mutexes serializing mutations of one (parent, name) slot.
/// Entries are created on demand and dropped once no guard references them.
#[derive(Default)]
pub(crate) struct EdgeLocks {
    locks: Arc<DashMap<EdgeKey, Arc<Mutex<()>>>>,
}

pub(crate) struct EdgeGuard {
    key: EdgeKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<EdgeKey, Arc<Mutex<()>>>>,
}

impl EdgeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: EdgeKey) -> EdgeGuard {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let guard = mutex.lock_owned().await;
        EdgeGuard {
            key,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Lock two edges in a fixed order so concurrent renames cannot deadlock.
    /// Returns a single guard when both keys are the same slot.
    pub async fn lock_pair(&self, a: EdgeKey, b: EdgeKey) -> (EdgeGuard, Option<EdgeGuard>) {
        if a == b {
            return (self.lock(a).await, None);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let g1 = self.lock(first).await;
        let g2 = self.lock(second).await;
        (g1, Some(g2))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for EdgeGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Our own clone lives in the map; anything above 1 is a waiter.
        self.locks
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}
