//! Per-container mutual exclusion.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily created async lock per container id.
///
/// The outer map lock is only held to look up or insert an entry, never
/// across an await.
#[derive(Default)]
pub struct ContainerLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ContainerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `container_id`.
    pub async fn acquire(&self, container_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock();
            Arc::clone(map.entry(container_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn is_locked(&self, container_id: &str) -> bool {
        self.locks.lock().get(container_id).is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
