//! Conflict detection logic
//!
//! Fingerprints act as an optimistic-concurrency guard. Before an outbound
//! update the stored fingerprint must equal the remote's current one;
//! before an inbound pull, an item with unsynced local edits must not be
//! overwritten.

use std::sync::Arc;

use hydrasync_core::domain::{Conflict, ConflictReason, Item, RemoteDescriptor, SyncPath};
use tracing::{debug, info};

use crate::error::ConflictError;
use crate::fingerprint::FingerprintStore;

/// Result of conflict detection check
#[derive(Debug, Clone)]
pub enum DetectionResult {
    /// No conflict: safe to apply the change
    NoConflict,
    /// Nothing to do: the remote has not changed since the last sync
    Unchanged,
    /// Conflict detected: both versions changed
    Conflicted(Box<Conflict>),
}

pub struct ConflictDetector {
    fingerprints: Arc<FingerprintStore>,
}

impl ConflictDetector {
    pub fn new(fingerprints: Arc<FingerprintStore>) -> Self {
        Self { fingerprints }
    }

    /// Guard an outbound update (not a create)
    ///
    /// # Errors
    /// `ConflictError::RemoteModified` when the stored fingerprint differs
    /// from the remote's current one; the caller must not write.
    pub async fn check_local_update(
        &self,
        path: &SyncPath,
        remote: &RemoteDescriptor,
    ) -> Result<(), ConflictError> {
        let blob = self.fingerprints.load_blob(path).await?;
        if blob.conflicted {
            return Err(ConflictError::Unresolved(path.clone()));
        }

        let current = remote.effective_fingerprint();
        match &blob.fingerprint {
            Some(stored) if *stored == current => {
                debug!(path = %path, fingerprint = %stored, "Fingerprint matches, update allowed");
                Ok(())
            }
            stored => {
                info!(
                    path = %path,
                    stored = ?stored.as_ref().map(|f| f.as_str()),
                    remote = %current,
                    "Remote changed since last sync, rejecting local update"
                );
                Err(ConflictError::RemoteModified {
                    path: path.clone(),
                    stored: stored.clone(),
                    remote: Some(current),
                })
            }
        }
    }

    /// Decide whether a remote change may be pulled over the local item
    ///
    /// A conflict exists when:
    /// 1. The local item is not synchronized (local edits pending, or a
    ///    local file that was never uploaded), AND
    /// 2. The remote fingerprint differs from the stored one
    pub fn check_remote_update(item: &Item, remote: &RemoteDescriptor) -> DetectionResult {
        let state = item.state();
        let current = remote.effective_fingerprint();

        if state.stored_fingerprint() == Some(&current) {
            return DetectionResult::Unchanged;
        }
        if state.is_synchronized() {
            return DetectionResult::NoConflict;
        }

        info!(
            path = %state.path(),
            stored = ?state.stored_fingerprint().map(|f| f.as_str()),
            remote = %current,
            "Conflict detected: both local and remote versions changed"
        );
        DetectionResult::Conflicted(Box::new(Conflict::new(
            state.path().clone(),
            ConflictReason::RemoteModified,
            state.stored_fingerprint().cloned(),
            Some(current),
        )))
    }

    /// Build the conflict record for a rejected outbound update
    pub fn conflict_from_error(err: &ConflictError) -> Option<Conflict> {
        match err {
            ConflictError::RemoteModified {
                path,
                stored,
                remote,
            } => Some(Conflict::new(
                path.clone(),
                ConflictReason::RemoteModified,
                stored.clone(),
                remote.clone(),
            )),
            _ => None,
        }
    }
}
