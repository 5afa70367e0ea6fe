//! Per-item fingerprint persistence
//!
//! The fingerprint of the last successful sync lives in the placeholder
//! custom blob, next to the original path, the lock record and the
//! conflict flag. All blob read-modify-write cycles go through
//! [`FingerprintStore::update_blob`], serialized per item, so concurrent
//! writers never drop each other's fields.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hydrasync_core::domain::{Fingerprint, PlaceholderBlob, RemoteDescriptor, SyncPath};
use hydrasync_core::ports::IMaterializer;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ConflictError;

pub struct FingerprintStore {
    materializer: Arc<dyn IMaterializer>,
    write_guards: DashMap<SyncPath, Arc<Mutex<()>>>,
}

impl FingerprintStore {
    pub fn new(materializer: Arc<dyn IMaterializer>) -> Self {
        Self {
            materializer,
            write_guards: DashMap::new(),
        }
    }

    pub fn materializer(&self) -> &Arc<dyn IMaterializer> {
        &self.materializer
    }

    /// Read and decode the item's blob
    pub async fn load_blob(&self, path: &SyncPath) -> Result<PlaceholderBlob, ConflictError> {
        let bytes = self.materializer.get_custom_blob(path).await?;
        PlaceholderBlob::decode(&bytes).map_err(|source| ConflictError::Blob {
            path: path.clone(),
            source,
        })
    }

    /// Apply `f` to the item's blob and persist the result
    pub async fn update_blob<F>(&self, path: &SyncPath, f: F) -> Result<PlaceholderBlob, ConflictError>
    where
        F: FnOnce(&mut PlaceholderBlob) + Send,
    {
        let guard = self
            .write_guards
            .entry(path.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let result = {
            let _held = guard.lock().await;
            self.rewrite_blob(path, f).await
        };
        drop(guard);
        self.write_guards
            .remove_if(path, |_, m| Arc::strong_count(m) == 1);
        result
    }

    async fn rewrite_blob<F>(&self, path: &SyncPath, f: F) -> Result<PlaceholderBlob, ConflictError>
    where
        F: FnOnce(&mut PlaceholderBlob) + Send,
    {
        let mut blob = self.load_blob(path).await?;
        f(&mut blob);
        let bytes = blob.encode().map_err(|source| ConflictError::Blob {
            path: path.clone(),
            source,
        })?;
        self.materializer.set_custom_blob(path, &bytes).await?;
        Ok(blob)
    }

    /// Items with a blob update in flight
    pub fn pending_updates(&self) -> usize {
        self.write_guards.len()
    }

    pub async fn get_fingerprint(&self, path: &SyncPath) -> Result<Option<Fingerprint>, ConflictError> {
        Ok(self.load_blob(path).await?.fingerprint)
    }

    pub async fn set_fingerprint(&self, path: &SyncPath, fp: Fingerprint) -> Result<(), ConflictError> {
        debug!(path = %path, fingerprint = %fp, "Storing fingerprint");
        self.update_blob(path, |blob| blob.fingerprint = Some(fp))
            .await
            .map(|_| ())
    }

    /// True if the stored fingerprint equals the remote's current one
    ///
    /// An item without a stored fingerprint never matches.
    pub async fn matches(
        &self,
        path: &SyncPath,
        remote: &RemoteDescriptor,
    ) -> Result<bool, ConflictError> {
        let stored = self.get_fingerprint(path).await?;
        Ok(stored.is_some_and(|fp| fp == remote.effective_fingerprint()))
    }

    /// Persist the fingerprint resulting from a successful write
    ///
    /// Uses the value returned by the store, or one synthesized from the
    /// remote modification time when the store issued none.
    pub async fn record_write(
        &self,
        path: &SyncPath,
        returned: Option<Fingerprint>,
        remote_modified: DateTime<Utc>,
    ) -> Result<Fingerprint, ConflictError> {
        let fp = resolve_written(returned, remote_modified);
        self.set_fingerprint(path, fp.clone()).await?;
        Ok(fp)
    }
}

/// Fingerprint to store after a write
pub fn resolve_written(returned: Option<Fingerprint>, remote_modified: DateTime<Utc>) -> Fingerprint {
    returned.unwrap_or_else(|| Fingerprint::synthesized(remote_modified))
}
