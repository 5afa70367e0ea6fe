//! Registry of flagged conflicts
//!
//! Flagging a conflict records it in memory and marks the item itself:
//! the blob `conflicted` field is set and the item is taken out of sync, so
//! the flag survives a restart. Walker and monitors skip flagged items
//! until [`ConflictRegistry::resolve_conflict`] is called.

use std::sync::Arc;

use dashmap::DashMap;
use hydrasync_core::domain::{Conflict, ConflictReason, Fingerprint, SyncPath};
use tracing::{info, warn};

use crate::error::ConflictError;
use crate::fingerprint::FingerprintStore;

pub struct ConflictRegistry {
    fingerprints: Arc<FingerprintStore>,
    conflicts: DashMap<SyncPath, Conflict>,
}

impl ConflictRegistry {
    pub fn new(fingerprints: Arc<FingerprintStore>) -> Self {
        Self {
            fingerprints,
            conflicts: DashMap::new(),
        }
    }

    /// Record a conflict and mark the item
    #[tracing::instrument(skip(self, conflict), fields(path = %conflict.path()))]
    pub async fn flag(&self, conflict: Conflict) -> Result<(), ConflictError> {
        let path = conflict.path().clone();
        self.fingerprints
            .update_blob(&path, |blob| blob.conflicted = true)
            .await?;
        if let Err(e) = self.fingerprints.materializer().set_in_sync(&path, false).await {
            warn!(path = %path, error = %e, "Failed to clear in-sync flag on conflicted item");
        }
        info!(reason = %conflict.reason(), "Conflict flagged");
        self.conflicts.insert(path, conflict);
        Ok(())
    }

    /// Re-register a conflict found persisted on an item
    ///
    /// Used after a restart, when the blob carries the flag but the
    /// in-memory registry is empty. Returns true if it was newly adopted.
    pub fn adopt(&self, path: &SyncPath, stored: Option<Fingerprint>) -> bool {
        if self.conflicts.contains_key(path) {
            return false;
        }
        self.conflicts.insert(
            path.clone(),
            Conflict::new(path.clone(), ConflictReason::RemoteModified, stored, None),
        );
        true
    }

    pub fn is_flagged(&self, path: &SyncPath) -> bool {
        self.conflicts.contains_key(path)
    }

    pub fn get(&self, path: &SyncPath) -> Option<Conflict> {
        self.conflicts.get(path).map(|c| c.value().clone())
    }

    /// All pending conflicts, oldest first
    pub fn list(&self) -> Vec<Conflict> {
        let mut all: Vec<Conflict> = self.conflicts.iter().map(|c| c.value().clone()).collect();
        all.sort_by_key(|c| c.detected_at());
        all
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Clear a conflict after external resolution
    ///
    /// `accepted` is the remote version the resolution was made against;
    /// when None, the remote version seen at detection time is used. It
    /// becomes the item's base, so the next outbound update of the resolved
    /// content passes the fingerprint guard. A conflict on a deleted remote
    /// clears the base, making the next outbound write a create. The item
    /// stays out of sync until that write succeeds.
    #[tracing::instrument(skip(self, accepted), fields(path = %path))]
    pub async fn resolve_conflict(
        &self,
        path: &SyncPath,
        accepted: Option<Fingerprint>,
    ) -> Result<Conflict, ConflictError> {
        let conflict = self
            .get(path)
            .ok_or_else(|| ConflictError::NotFound(path.clone()))?;

        let base = match conflict.reason() {
            ConflictReason::RemoteModified => accepted
                .or_else(|| conflict.remote_fingerprint().cloned())
                .or_else(|| conflict.local_fingerprint().cloned()),
            ConflictReason::RemoteDeleted => None,
        };
        self.fingerprints
            .update_blob(path, |blob| {
                blob.conflicted = false;
                blob.fingerprint = base;
            })
            .await?;

        self.conflicts.remove(path);
        info!("Conflict resolved");
        Ok(conflict)
    }

    /// Drop a conflict without touching the item (item deleted locally)
    pub fn forget(&self, path: &SyncPath) -> Option<Conflict> {
        self.conflicts.remove(path).map(|(_, c)| c)
    }
}
