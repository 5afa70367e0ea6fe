//! Remote store port (driven/secondary port)
//!
//! This module defines the interface the sync core uses to talk to the
//! remote document store. The wire protocol is an adapter concern.
//!
//! ## Design Notes
//!
//! - Unlike the materializer port, failures are classified in
//!   [`RemoteStoreError`]: the sync core must tell a failed precondition
//!   (conflict) from lock contention, an outage or an expired session.
//! - Every mutating call takes an [`OperationId`] that the store echoes on
//!   the resulting change notification.
//! - Descriptors returned here are snapshots valid for one operation only.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::change::RemoteNotification;
use crate::domain::lock::LockRecord;
use crate::domain::newtypes::{Fingerprint, LockToken, OperationId, RemoteLocator};
use crate::domain::remote::{ByteRange, ItemMetadata, RemoteDescriptor};

#[derive(Debug, Error)]
pub enum RemoteStoreError {
    #[error("remote item not found: {0}")]
    NotFound(RemoteLocator),

    /// The expected fingerprint no longer matches the remote object
    #[error("precondition failed on {locator}: remote fingerprint is {actual:?}")]
    PreconditionFailed {
        locator: RemoteLocator,
        actual: Option<Fingerprint>,
    },

    #[error("remote item is locked by {owner}: {locator}")]
    Locked { locator: RemoteLocator, owner: String },

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store requires authentication")]
    AuthenticationRequired,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RemoteResult<T> = Result<T, RemoteStoreError>;

#[async_trait]
pub trait IRemoteStore: Send + Sync {
    /// List the children of a folder locator, optionally filtered by a
    /// glob-style name pattern
    async fn list(
        &self,
        folder: &RemoteLocator,
        pattern: Option<&str>,
    ) -> RemoteResult<Vec<RemoteDescriptor>>;

    async fn get(&self, locator: &RemoteLocator) -> RemoteResult<RemoteDescriptor>;

    async fn read(&self, locator: &RemoteLocator, range: ByteRange) -> RemoteResult<Vec<u8>>;

    /// Replace the content of an existing file
    ///
    /// With `expected` set, the store rejects the write with
    /// [`RemoteStoreError::PreconditionFailed`] if the object's current
    /// fingerprint differs. Returns the new fingerprint when the store
    /// issues one.
    async fn write(
        &self,
        locator: &RemoteLocator,
        content: &[u8],
        metadata: &ItemMetadata,
        expected: Option<&Fingerprint>,
        correlation: OperationId,
    ) -> RemoteResult<Option<Fingerprint>>;

    /// Create a new file or folder; `content` is ignored for folders
    async fn create(
        &self,
        locator: &RemoteLocator,
        metadata: &ItemMetadata,
        content: Option<&[u8]>,
        correlation: OperationId,
    ) -> RemoteResult<Option<Fingerprint>>;

    async fn delete(&self, locator: &RemoteLocator, correlation: OperationId) -> RemoteResult<()>;

    async fn move_item(
        &self,
        from: &RemoteLocator,
        to: &RemoteLocator,
        correlation: OperationId,
    ) -> RemoteResult<()>;

    /// Acquire an exclusive lock; contention yields [`RemoteStoreError::Locked`]
    async fn lock(&self, locator: &RemoteLocator) -> RemoteResult<LockRecord>;

    async fn unlock(&self, locator: &RemoteLocator, token: &LockToken) -> RemoteResult<()>;

    /// Stream of change notifications; dropping the receiver unsubscribes
    async fn subscribe_changes(&self) -> RemoteResult<mpsc::Receiver<RemoteNotification>>;
}
