//! Shared state handed to every sync component

use std::sync::Arc;

use hydrasync_conflict::{ConflictDetector, ConflictRegistry, FingerprintStore};
use hydrasync_core::config::Config;
use hydrasync_core::domain::{
    Conflict, Item, ItemKind, LocalEntry, PathMapper, RemoteLocator, SyncPath,
};
use hydrasync_core::ports::{IMaterializer, IRemoteStore};
use tracing::warn;

use crate::filter::NoiseFilter;
use crate::path_locks::PathLocks;
use crate::suppressor::LoopSuppressor;
use crate::SyncError;

pub struct SyncContext {
    pub remote: Arc<dyn IRemoteStore>,
    pub materializer: Arc<dyn IMaterializer>,
    pub mapper: PathMapper,
    pub fingerprints: Arc<FingerprintStore>,
    pub detector: ConflictDetector,
    pub conflicts: ConflictRegistry,
    pub suppressor: LoopSuppressor,
    pub path_locks: PathLocks,
    pub filter: NoiseFilter,
}

impl SyncContext {
    pub fn new(
        config: &Config,
        remote: Arc<dyn IRemoteStore>,
        materializer: Arc<dyn IMaterializer>,
    ) -> Result<Self, SyncError> {
        let mapper = config.path_mapper()?;
        let fingerprints = Arc::new(FingerprintStore::new(materializer.clone()));
        Ok(Self {
            remote,
            materializer,
            mapper,
            detector: ConflictDetector::new(fingerprints.clone()),
            conflicts: ConflictRegistry::new(fingerprints.clone()),
            fingerprints,
            suppressor: LoopSuppressor::new(config.sync.suppression_grace()),
            path_locks: PathLocks::new(),
            filter: NoiseFilter::new(config.filters.exclude_patterns.as_slice()),
        })
    }

    pub fn local_root(&self) -> &SyncPath {
        self.mapper.local_root()
    }

    /// Current local item at `path`, or None if nothing exists there
    pub async fn load_item(&self, path: &SyncPath) -> Result<Option<Item>, SyncError> {
        match self.materializer.stat(path).await? {
            Some(entry) => Ok(Some(self.item_from_entry(entry).await?)),
            None => Ok(None),
        }
    }

    pub async fn item_from_entry(&self, entry: LocalEntry) -> Result<Item, SyncError> {
        let blob = self.fingerprints.load_blob(&entry.path).await?;
        Ok(Item::from_entry(entry, blob))
    }

    pub fn to_remote(&self, path: &SyncPath, kind: ItemKind) -> Result<RemoteLocator, SyncError> {
        Ok(self.mapper.to_remote(path.as_path(), kind)?)
    }

    /// Mark an item conflicted; a failure to persist the flag is logged
    pub async fn flag_conflict(&self, conflict: Conflict) {
        let path = conflict.path().clone();
        if let Err(e) = self.conflicts.flag(conflict).await {
            warn!(path = %path, error = %e, "Failed to persist conflict flag");
        }
    }
}
