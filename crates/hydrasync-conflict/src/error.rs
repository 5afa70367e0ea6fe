//! Error types for fingerprint persistence and conflict detection

use hydrasync_core::domain::{BlobError, Fingerprint, SyncPath};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConflictError {
    /// The remote object changed since the last successful sync
    #[error("remote modified since last sync: {path} (stored {stored:?}, remote {remote:?})")]
    RemoteModified {
        path: SyncPath,
        stored: Option<Fingerprint>,
        remote: Option<Fingerprint>,
    },

    /// The item carries a pending conflict and must be resolved first
    #[error("item has an unresolved conflict: {0}")]
    Unresolved(SyncPath),

    /// No conflict is registered for the path
    #[error("conflict not found: {0}")]
    NotFound(SyncPath),

    /// Placeholder blob could not be read or written
    #[error("placeholder blob error on {path}: {source}")]
    Blob {
        path: SyncPath,
        #[source]
        source: BlobError,
    },

    /// Materializer failure while reading or writing item state
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ConflictError {
    /// True for outcomes that flag the item as conflicted
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ConflictError::RemoteModified { .. } | ConflictError::Unresolved(_)
        )
    }
}
