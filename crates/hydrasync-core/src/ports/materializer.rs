//! Materialization layer port (driven/secondary port)
//!
//! The host layer that owns placeholder files: it creates and updates
//! placeholders, hydrates and dehydrates their content, and stores a small
//! per-item custom blob on behalf of the sync core.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because host errors are adapter-specific.
//! - Custom blobs are limited to [`PlaceholderBlob::MAX_SIZE`] bytes; the
//!   blob format itself belongs to the core (`domain::blob`).
//!
//! [`PlaceholderBlob::MAX_SIZE`]: crate::domain::blob::PlaceholderBlob::MAX_SIZE

use async_trait::async_trait;

use crate::domain::item::{LocalEntry, PinState};
use crate::domain::newtypes::SyncPath;
use crate::domain::remote::{ByteRange, RemoteDescriptor};

#[async_trait]
pub trait IMaterializer: Send + Sync {
    /// True for folders whose children have not been populated yet
    async fn is_offline(&self, path: &SyncPath) -> anyhow::Result<bool>;

    async fn is_placeholder(&self, path: &SyncPath) -> anyhow::Result<bool>;

    /// Turn an existing regular file or folder into a placeholder
    async fn convert_to_placeholder(&self, path: &SyncPath, blob: &[u8]) -> anyhow::Result<()>;

    /// Fetch content for `range`; the host pulls it from the provider
    async fn hydrate(&self, path: &SyncPath, range: ByteRange) -> anyhow::Result<()>;

    /// Discard cached content for `range`, keeping metadata
    async fn dehydrate(&self, path: &SyncPath, range: ByteRange) -> anyhow::Result<()>;

    async fn get_custom_blob(&self, path: &SyncPath) -> anyhow::Result<Vec<u8>>;

    async fn set_custom_blob(&self, path: &SyncPath, blob: &[u8]) -> anyhow::Result<()>;

    async fn list_children(&self, folder: &SyncPath) -> anyhow::Result<Vec<LocalEntry>>;

    /// Entry for `path`, or None if nothing exists there
    async fn stat(&self, path: &SyncPath) -> anyhow::Result<Option<LocalEntry>>;

    /// Create a placeholder for `descriptor` under `parent`
    ///
    /// Returns the path of the new placeholder.
    async fn create_placeholder(
        &self,
        parent: &SyncPath,
        descriptor: &RemoteDescriptor,
        blob: &[u8],
    ) -> anyhow::Result<SyncPath>;

    /// Refresh metadata from `descriptor`; with `content`, also replace the
    /// local content, otherwise any cached content is invalidated
    async fn update_placeholder(
        &self,
        path: &SyncPath,
        descriptor: &RemoteDescriptor,
        content: Option<&[u8]>,
    ) -> anyhow::Result<()>;

    async fn read_content(&self, path: &SyncPath) -> anyhow::Result<Vec<u8>>;

    /// Delete a file, or a folder with everything under it
    async fn delete(&self, path: &SyncPath) -> anyhow::Result<()>;

    async fn set_in_sync(&self, path: &SyncPath, in_sync: bool) -> anyhow::Result<()>;

    async fn pin_state(&self, path: &SyncPath) -> anyhow::Result<PinState>;
}
