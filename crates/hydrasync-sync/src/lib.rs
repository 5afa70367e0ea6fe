//! HydraSync Sync - Bidirectional placeholder synchronization
//!
//! Provides:
//! - Local and remote change monitors with loop suppression
//! - A resumable reconciliation walker
//! - Fingerprint-guarded outbound writes and conflict flagging
//! - Remote lock coordination (auto and manual)
//!
//! ## Modules
//!
//! - [`engine`] - `SyncEngine`, the entry point wiring monitors and walker
//! - [`walker`] - Full-tree reconciliation over an explicit worklist
//! - [`reconciler`] - Pass runner publishing the engine state
//! - [`local_monitor`] / [`remote_monitor`] - Event-driven sync in each direction
//! - [`outbound`] / [`inbound`] - Per-item sync actions
//! - [`suppressor`] - Correlation-based echo suppression
//! - [`locks`] - Lock coordinator state machine
//! - [`watcher`] - `notify`-backed local file watcher

pub mod context;
pub mod engine;
pub mod filter;
pub mod inbound;
pub mod local_monitor;
pub mod locks;
pub mod outbound;
pub mod path_locks;
pub mod reconciler;
pub mod remote_monitor;
pub mod suppressor;
pub mod walker;
pub mod watcher;

use hydrasync_conflict::ConflictError;
use hydrasync_core::domain::errors::DomainError;
use hydrasync_core::ports::RemoteStoreError;
use thiserror::Error;

pub use context::SyncContext;
pub use engine::{SyncEngine, SyncState};
pub use walker::WalkReport;

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Path mapping failed; fatal to the single call
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] DomainError),

    /// Lock contention; the triggering operation continues unlocked
    #[error("Client lock failed on {path}: {reason}")]
    ClientLockFailed { path: String, reason: String },

    /// Fingerprint mismatch; the item is flagged and its sync halts
    #[error("Conflict on {0}")]
    Conflict(String),

    /// Remote object missing
    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// Transient remote failure; left for the next walker pass
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// Session expired; process-wide sync pauses
    #[error("Authentication required")]
    AuthenticationRequired,

    /// The engine is not running
    #[error("Sync engine is not running")]
    NotRunning,

    /// Local materializer or blob failure
    #[error("IO error: {0:#}")]
    Io(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors that stop the active cycle and disable the engine
    pub fn is_process_wide(&self) -> bool {
        matches!(self, SyncError::AuthenticationRequired)
    }

    /// Errors retried by a later cycle without user action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::ClientLockFailed { .. }
                | SyncError::NotFound(_)
                | SyncError::RemoteUnavailable(_)
                | SyncError::Io(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }
}

impl From<RemoteStoreError> for SyncError {
    fn from(err: RemoteStoreError) -> Self {
        match err {
            RemoteStoreError::NotFound(loc) => SyncError::NotFound(loc.to_string()),
            RemoteStoreError::PreconditionFailed { locator, .. } => {
                SyncError::Conflict(locator.to_string())
            }
            RemoteStoreError::Locked { locator, owner } => SyncError::ClientLockFailed {
                path: locator.to_string(),
                reason: format!("locked by {owner}"),
            },
            RemoteStoreError::Unavailable(msg) => SyncError::RemoteUnavailable(msg),
            RemoteStoreError::AuthenticationRequired => SyncError::AuthenticationRequired,
            RemoteStoreError::Other(e) => SyncError::RemoteUnavailable(format!("{e:#}")),
        }
    }
}

impl From<ConflictError> for SyncError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::RemoteModified { path, .. } | ConflictError::Unresolved(path) => {
                SyncError::Conflict(path.to_string())
            }
            ConflictError::NotFound(path) => {
                SyncError::Io(anyhow::anyhow!("no conflict registered for {path}"))
            }
            ConflictError::Blob { path, source } => {
                SyncError::Io(anyhow::Error::new(source).context(format!("blob of {path}")))
            }
            ConflictError::Storage(e) => SyncError::Io(e),
        }
    }
}
