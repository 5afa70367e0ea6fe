//! Per-item serialization of sync actions

use std::sync::Arc;

use dashmap::DashMap;
use hydrasync_core::domain::SyncPath;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Path-keyed async mutexes
///
/// Monitors and the walker take the lock of an item for the whole of its
/// sync action. Different items never contend.
#[derive(Default)]
pub struct PathLocks {
    locks: DashMap<SyncPath, Arc<Mutex<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, path: &SyncPath) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        mutex.lock_owned().await
    }

    /// Forget mutexes nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
