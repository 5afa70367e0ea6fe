//! Folder-backed remote store (secondary/driven adapter)
//!
//! Implements [`IRemoteStore`] over a plain directory, so `hydrasyncd` can
//! keep its sync root in step with a second tree (another disk, a network
//! share). Locators are `file://` URLs below the store directory.
//!
//! ## Layout
//!
//! ```text
//! {store_dir}/
//!   docs/a.txt                  content, as any other client sees it
//!   .hydrasync-store/
//!     locks/{sha256(path)}      JSON lock records
//!     staging/{uuid}            in-flight writes, renamed into place
//! ```
//!
//! ## Design Decisions
//!
//! - **Fingerprints**: base64 SHA-256 of the content, cached per path while
//!   length and mtime are unchanged. Folders carry a fixed fingerprint.
//! - **Preconditions**: checked under a store-wide write guard. A plain
//!   directory has no compare-and-swap, so a foreign writer racing the
//!   check can still slip through.
//! - **Change feed**: a `notify` watcher on the store directory. Events on
//!   paths this store mutated within [`CORRELATION_WINDOW`] carry that
//!   mutation's [`OperationId`].

use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hydrasync_core::domain::{
    ByteRange, ChangeKind, Fingerprint, ItemAttributes, ItemKind, ItemMetadata, LockRecord,
    LockToken, OperationId, RemoteDescriptor, RemoteId, RemoteLocator, RemoteNotification,
};
use hydrasync_core::ports::{IRemoteStore, RemoteResult, RemoteStoreError};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;
use uuid::Uuid;

const META_DIR: &str = ".hydrasync-store";
const FOLDER_FINGERPRINT: &str = "folder";
const CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(15 * 60);

/// How long after a mutation change events on its paths are attributed to it
pub const CORRELATION_WINDOW: Duration = Duration::from_secs(2);

/// Lock file contents; the path lets folder deletes find nested locks
#[derive(Debug, Serialize, Deserialize)]
struct StoredLock {
    path: String,
    record: LockRecord,
}

/// Content digest valid while the file keeps this length and mtime
#[derive(Debug, Clone)]
struct Digest256 {
    len: u64,
    modified: Option<SystemTime>,
    fingerprint: Fingerprint,
}

type Subscriber = (RecommendedWatcher, mpsc::Sender<RemoteNotification>);

pub struct FolderRemoteStore {
    root: PathBuf,
    owner: String,
    lock_ttl: Duration,
    recent: Arc<DashMap<PathBuf, (OperationId, Instant)>>,
    digests: DashMap<PathBuf, Digest256>,
    write_guard: tokio::sync::Mutex<()>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl FolderRemoteStore {
    /// Open (creating if needed) a store rooted at `root`
    ///
    /// `owner` is recorded on every lock this store takes.
    pub fn new(root: &Path, owner: impl Into<String>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create store directory {}", root.display()))?;
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to resolve store directory {}", root.display()))?;
        for sub in ["locks", "staging"] {
            std::fs::create_dir_all(root.join(META_DIR).join(sub))
                .with_context(|| format!("Failed to prepare store metadata in {}", root.display()))?;
        }

        info!(root = %root.display(), "Folder-backed remote store opened");
        Ok(Self {
            root,
            owner: owner.into(),
            lock_ttl: DEFAULT_LOCK_TTL,
            recent: Arc::new(DashMap::new()),
            digests: DashMap::new(),
            write_guard: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Folder locator of the store root
    pub fn root_locator(&self) -> anyhow::Result<RemoteLocator> {
        let url = Url::from_directory_path(&self.root)
            .map_err(|()| anyhow::anyhow!("store root is not absolute: {}", self.root.display()))?;
        Ok(RemoteLocator::from_url(url)?)
    }

    // ------------------------------------------------------------------
    // Locator resolution
    // ------------------------------------------------------------------

    fn resolve(&self, locator: &RemoteLocator) -> RemoteResult<PathBuf> {
        let not_found = || RemoteStoreError::NotFound(locator.clone());
        let url = locator.as_url();
        if url.scheme() != "file" {
            return Err(not_found());
        }
        let path = url.to_file_path().map_err(|()| not_found())?;
        let relative = path.strip_prefix(&self.root).map_err(|_| not_found())?;
        let mut components = relative.components();
        if !components.clone().all(|c| matches!(c, Component::Normal(_))) {
            return Err(not_found());
        }
        if components.next().is_some_and(|c| c.as_os_str() == META_DIR) {
            return Err(not_found());
        }
        Ok(self.root.join(relative))
    }

    /// Path and metadata of an existing object whose kind matches the locator
    async fn node(&self, locator: &RemoteLocator) -> RemoteResult<(PathBuf, std::fs::Metadata)> {
        let path = self.resolve(locator)?;
        let meta = match tokio::fs::symlink_metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RemoteStoreError::NotFound(locator.clone()))
            }
            Err(e) => return Err(self.io_error(e, &path)),
        };
        if meta.is_dir() != locator.is_folder() || meta.file_type().is_symlink() {
            return Err(RemoteStoreError::NotFound(locator.clone()));
        }
        Ok((path, meta))
    }

    fn relative_key(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    fn io_error(&self, err: std::io::Error, path: &Path) -> RemoteStoreError {
        if !self.root.is_dir() {
            return RemoteStoreError::Unavailable(format!(
                "store directory {} is not reachable",
                self.root.display()
            ));
        }
        RemoteStoreError::Other(anyhow::Error::new(err).context(format!("accessing {}", path.display())))
    }

    // ------------------------------------------------------------------
    // Descriptors and fingerprints
    // ------------------------------------------------------------------

    async fn fingerprint_of(&self, path: &Path, meta: &std::fs::Metadata) -> RemoteResult<Fingerprint> {
        if meta.is_dir() {
            return folder_fingerprint();
        }
        let modified = meta.modified().ok();
        if let Some(cached) = self.digests.get(path) {
            if cached.len == meta.len() && cached.modified == modified {
                return Ok(cached.fingerprint.clone());
            }
        }
        let content = tokio::fs::read(path).await.map_err(|e| self.io_error(e, path))?;
        let fingerprint = content_fingerprint(&content)?;
        self.digests.insert(
            path.to_path_buf(),
            Digest256 {
                len: meta.len(),
                modified,
                fingerprint: fingerprint.clone(),
            },
        );
        Ok(fingerprint)
    }

    async fn describe(&self, path: &Path, meta: &std::fs::Metadata) -> RemoteResult<RemoteDescriptor> {
        let key = self.relative_key(path);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified_at = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        let kind = if meta.is_dir() { ItemKind::Folder } else { ItemKind::File };

        Ok(RemoteDescriptor {
            kind,
            size: if meta.is_dir() { 0 } else { meta.len() },
            created_at: meta.created().map(DateTime::<Utc>::from).unwrap_or(modified_at),
            modified_at,
            accessed_at: meta.accessed().map(DateTime::<Utc>::from).unwrap_or(modified_at),
            attributes: ItemAttributes {
                read_only: meta.permissions().readonly(),
                hidden: name.starts_with('.'),
            },
            fingerprint: Some(self.fingerprint_of(path, meta).await?),
            remote_id: RemoteId::new(format!("/{key}")).map_err(anyhow::Error::from)?,
            lock: self.read_lock(&key).await?.map(|stored| stored.record),
            name,
        })
    }

    // ------------------------------------------------------------------
    // Lock files
    // ------------------------------------------------------------------

    fn locks_dir(&self) -> PathBuf {
        self.root.join(META_DIR).join("locks")
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        self.locks_dir().join(format!("{:x}", hasher.finalize()))
    }

    async fn read_lock(&self, key: &str) -> RemoteResult<Option<StoredLock>> {
        let path = self.lock_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e, &path)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable lock file");
                Ok(None)
            }
        }
    }

    /// Drop the lock files of `key` and everything below it
    async fn clear_locks_under(&self, key: &str) -> RemoteResult<()> {
        let dir = self.locks_dir();
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| self.io_error(e, &dir))?;
        let nested = format!("{key}/");
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(e, &dir))? {
            let Ok(bytes) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            let Ok(stored) = serde_json::from_slice::<StoredLock>(&bytes) else {
                continue;
            };
            if stored.path == key || stored.path.starts_with(&nested) {
                let _ = tokio::fs::remove_file(entry.path()).await;
                debug!(path = %stored.path, "Cleared lock of removed item");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Mutation helpers
    // ------------------------------------------------------------------

    /// Attribute upcoming change events on `paths` to `op`
    fn note(&self, op: OperationId, paths: &[&Path]) {
        let now = Instant::now();
        self.recent.retain(|_, (_, at)| now.duration_since(*at) < CORRELATION_WINDOW);
        for path in paths {
            self.recent.insert(path.to_path_buf(), (op, now));
        }
    }

    /// Write `content` to staging, then rename it over `target`
    async fn replace_file(&self, target: &Path, content: &[u8], modified: DateTime<Utc>) -> RemoteResult<()> {
        let staging = self.root.join(META_DIR).join("staging").join(Uuid::new_v4().to_string());
        let body = content.to_vec();
        let destination = target.to_path_buf();
        let staged = staging.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let mut file = std::fs::File::create(&staged)?;
            file.write_all(&body)?;
            file.set_modified(SystemTime::from(modified))?;
            file.sync_all()?;
            drop(file);
            std::fs::rename(&staged, &destination)
        })
        .await
        .map_err(|e| RemoteStoreError::Other(anyhow::Error::new(e)))?
        .map_err(|e| {
            let _ = std::fs::remove_file(&staging);
            self.io_error(e, target)
        })?;
        self.digests.remove(target);
        Ok(())
    }

    async fn ensure_parent(&self, path: &Path, locator: &RemoteLocator) -> RemoteResult<()> {
        let parent_exists = match path.parent() {
            Some(parent) => tokio::fs::metadata(parent).await.is_ok_and(|m| m.is_dir()),
            None => false,
        };
        if parent_exists {
            Ok(())
        } else {
            Err(RemoteStoreError::NotFound(locator.parent().unwrap_or_else(|| locator.clone())))
        }
    }

    async fn existing_fingerprint(&self, path: &Path) -> RemoteResult<Option<Fingerprint>> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => Ok(Some(self.fingerprint_of(path, &meta).await?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e, path)),
        }
    }
}

#[async_trait]
impl IRemoteStore for FolderRemoteStore {
    #[instrument(skip(self), fields(folder = %folder))]
    async fn list(
        &self,
        folder: &RemoteLocator,
        pattern: Option<&str>,
    ) -> RemoteResult<Vec<RemoteDescriptor>> {
        let (dir, _) = self.node(folder).await?;
        let pattern = pattern
            .map(glob::Pattern::new)
            .transpose()
            .map_err(|e| RemoteStoreError::Other(anyhow::Error::new(e)))?;

        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| self.io_error(e, &dir))?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| self.io_error(e, &dir))? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                warn!(path = %entry.path().display(), "Skipping non UTF-8 name");
                continue;
            };
            if dir == self.root && name == META_DIR {
                continue;
            }
            if pattern.as_ref().is_some_and(|p| !p.matches(name)) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_dir() || meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_error(e, &entry.path())),
            };
            children.push(self.describe(&entry.path(), &meta).await?);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = children.len(), "Listed folder");
        Ok(children)
    }

    async fn get(&self, locator: &RemoteLocator) -> RemoteResult<RemoteDescriptor> {
        let (path, meta) = self.node(locator).await?;
        self.describe(&path, &meta).await
    }

    async fn read(&self, locator: &RemoteLocator, range: ByteRange) -> RemoteResult<Vec<u8>> {
        let (path, meta) = self.node(locator).await?;
        if meta.is_dir() {
            return Err(RemoteStoreError::NotFound(locator.clone()));
        }
        let content = tokio::fs::read(&path).await.map_err(|e| self.io_error(e, &path))?;
        let (start, end) = range.bounds(content.len());
        Ok(content[start..end].to_vec())
    }

    #[instrument(skip(self, content, metadata, expected), fields(locator = %locator, bytes = content.len()))]
    async fn write(
        &self,
        locator: &RemoteLocator,
        content: &[u8],
        metadata: &ItemMetadata,
        expected: Option<&Fingerprint>,
        correlation: OperationId,
    ) -> RemoteResult<Option<Fingerprint>> {
        let _guard = self.write_guard.lock().await;
        let (path, meta) = self.node(locator).await?;
        if meta.is_dir() {
            return Err(RemoteStoreError::NotFound(locator.clone()));
        }
        let current = self.fingerprint_of(&path, &meta).await?;
        if let Some(expected) = expected {
            if expected != &current {
                debug!(expected = %expected, actual = %current, "Write precondition failed");
                return Err(RemoteStoreError::PreconditionFailed {
                    locator: locator.clone(),
                    actual: Some(current),
                });
            }
        }

        self.note(correlation, &[&path]);
        self.replace_file(&path, content, metadata.modified_at).await?;
        let fingerprint = content_fingerprint(content)?;
        debug!(fingerprint = %fingerprint, "Content replaced");
        Ok(Some(fingerprint))
    }

    #[instrument(skip(self, metadata, content), fields(locator = %locator))]
    async fn create(
        &self,
        locator: &RemoteLocator,
        metadata: &ItemMetadata,
        content: Option<&[u8]>,
        correlation: OperationId,
    ) -> RemoteResult<Option<Fingerprint>> {
        let _guard = self.write_guard.lock().await;
        let path = self.resolve(locator)?;
        if let Some(actual) = self.existing_fingerprint(&path).await? {
            return Err(RemoteStoreError::PreconditionFailed {
                locator: locator.clone(),
                actual: Some(actual),
            });
        }
        self.ensure_parent(&path, locator).await?;

        self.note(correlation, &[&path]);
        if locator.is_folder() {
            tokio::fs::create_dir(&path).await.map_err(|e| self.io_error(e, &path))?;
            debug!("Folder created");
            return Ok(Some(folder_fingerprint()?));
        }
        let body = content.unwrap_or_default();
        self.replace_file(&path, body, metadata.modified_at).await?;
        debug!(bytes = body.len(), "File created");
        Ok(Some(content_fingerprint(body)?))
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn delete(&self, locator: &RemoteLocator, correlation: OperationId) -> RemoteResult<()> {
        let _guard = self.write_guard.lock().await;
        let (path, meta) = self.node(locator).await?;
        if path == self.root {
            return Err(RemoteStoreError::Other(anyhow::anyhow!("the store root cannot be deleted")));
        }

        self.note(correlation, &[&path]);
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.map_err(|e| self.io_error(e, &path))?;
        self.digests.retain(|p, _| !p.starts_with(&path));
        self.clear_locks_under(&self.relative_key(&path)).await?;
        debug!("Deleted");
        Ok(())
    }

    #[instrument(skip(self), fields(from = %from, to = %to))]
    async fn move_item(
        &self,
        from: &RemoteLocator,
        to: &RemoteLocator,
        correlation: OperationId,
    ) -> RemoteResult<()> {
        let _guard = self.write_guard.lock().await;
        let (source, _) = self.node(from).await?;
        if from.is_folder() != to.is_folder() {
            return Err(RemoteStoreError::Other(anyhow::anyhow!(
                "cannot move {from} to a locator of another kind"
            )));
        }
        let destination = self.resolve(to)?;
        if let Some(actual) = self.existing_fingerprint(&destination).await? {
            return Err(RemoteStoreError::PreconditionFailed {
                locator: to.clone(),
                actual: Some(actual),
            });
        }
        self.ensure_parent(&destination, to).await?;

        self.note(correlation, &[&source, &destination]);
        tokio::fs::rename(&source, &destination)
            .await
            .map_err(|e| self.io_error(e, &source))?;
        self.digests.retain(|p, _| !p.starts_with(&source));
        self.clear_locks_under(&self.relative_key(&source)).await?;
        debug!("Moved");
        Ok(())
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn lock(&self, locator: &RemoteLocator) -> RemoteResult<LockRecord> {
        let _guard = self.write_guard.lock().await;
        let (path, meta) = self.node(locator).await?;
        if meta.is_dir() {
            return Err(RemoteStoreError::Other(anyhow::anyhow!("folders cannot be locked: {locator}")));
        }
        let key = self.relative_key(&path);
        if let Some(stored) = self.read_lock(&key).await? {
            if !stored.record.is_expired() {
                return Err(RemoteStoreError::Locked {
                    locator: locator.clone(),
                    owner: stored.record.owner().to_string(),
                });
            }
        }

        let ttl = chrono::Duration::from_std(self.lock_ttl)
            .map_err(|e| RemoteStoreError::Other(anyhow::Error::new(e)))?;
        let record = LockRecord::new(LockToken::new(Uuid::new_v4().to_string()), &self.owner, true)
            .with_expiry(Utc::now() + ttl);
        let stored = StoredLock {
            path: key.clone(),
            record: record.clone(),
        };
        let bytes = serde_json::to_vec(&stored).map_err(|e| RemoteStoreError::Other(e.into()))?;
        let lock_path = self.lock_path(&key);
        tokio::fs::write(&lock_path, bytes)
            .await
            .map_err(|e| self.io_error(e, &lock_path))?;
        debug!(owner = %self.owner, "Lock acquired");
        Ok(record)
    }

    #[instrument(skip(self, token), fields(locator = %locator))]
    async fn unlock(&self, locator: &RemoteLocator, token: &LockToken) -> RemoteResult<()> {
        let _guard = self.write_guard.lock().await;
        let key = self.relative_key(&self.resolve(locator)?);
        match self.read_lock(&key).await? {
            Some(stored) if stored.record.token() == token => {
                let lock_path = self.lock_path(&key);
                match tokio::fs::remove_file(&lock_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(self.io_error(e, &lock_path)),
                }
                debug!("Lock released");
            }
            Some(_) => debug!("Lock held under another token, leaving it"),
            None => trace!("No lock to release"),
        }
        Ok(())
    }

    async fn subscribe_changes(&self) -> RemoteResult<mpsc::Receiver<RemoteNotification>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let root = self.root.clone();
        let recent = Arc::clone(&self.recent);
        let sender = tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    for notification in notifications_for(&root, &recent, &event) {
                        if sender.try_send(notification).is_err() {
                            trace!("Change subscriber gone or full, dropping notification");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Store watcher error"),
            },
            notify::Config::default(),
        )
        .map_err(|e| RemoteStoreError::Unavailable(format!("cannot watch store: {e}")))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| RemoteStoreError::Unavailable(format!("cannot watch store: {e}")))?;

        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.push((watcher, tx));
        info!(root = %self.root.display(), subscribers = subscribers.len(), "Store change feed subscribed");
        Ok(rx)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn folder_fingerprint() -> RemoteResult<Fingerprint> {
    Ok(Fingerprint::new(FOLDER_FINGERPRINT).map_err(anyhow::Error::from)?)
}

/// Base64 SHA-256 of `content`
pub fn content_fingerprint(content: &[u8]) -> RemoteResult<Fingerprint> {
    let digest = Sha256::digest(content);
    let encoded = base64::engine::general_purpose::STANDARD.encode(digest);
    Ok(Fingerprint::new(encoded).map_err(anyhow::Error::from)?)
}

/// Locator of a path inside the store, or None for metadata and foreign paths
fn locator_for(root: &Path, path: &Path) -> Option<RemoteLocator> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.components().next().is_some_and(|c| c.as_os_str() == META_DIR) {
        return None;
    }
    let url = if path.is_dir() {
        Url::from_directory_path(path).ok()?
    } else {
        Url::from_file_path(path).ok()?
    };
    RemoteLocator::from_url(url).ok()
}

/// Map one watcher event to notifications, attaching a recent correlation
fn notifications_for(
    root: &Path,
    recent: &DashMap<PathBuf, (OperationId, Instant)>,
    event: &notify::Event,
) -> Vec<RemoteNotification> {
    let paths = &event.paths;
    let kind = match &event.kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Remove(_) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => ChangeKind::Moved,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => ChangeKind::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) | EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            ChangeKind::Updated
        }
        _ => return Vec::new(),
    };

    let now = Instant::now();
    let correlation = paths.iter().find_map(|path| {
        path.ancestors().find_map(|candidate| {
            recent
                .get(candidate)
                .filter(|entry| now.duration_since(entry.1) < CORRELATION_WINDOW)
                .map(|entry| entry.0)
        })
    });

    let notifications = if kind == ChangeKind::Moved {
        match (locator_for(root, &paths[0]), locator_for(root, &paths[1])) {
            (Some(from), Some(to)) => vec![RemoteNotification::new(ChangeKind::Moved, from).with_new_locator(to)],
            (None, Some(to)) => vec![RemoteNotification::new(ChangeKind::Created, to)],
            (Some(from), None) => vec![RemoteNotification::new(ChangeKind::Deleted, from)],
            (None, None) => Vec::new(),
        }
    } else {
        paths
            .iter()
            .filter_map(|p| locator_for(root, p))
            .map(|locator| RemoteNotification::new(kind, locator))
            .collect()
    };

    match correlation {
        Some(op) => notifications.into_iter().map(|n| n.with_correlation(op)).collect(),
        None => notifications,
    }
}

// ============================================================================
// Unit tests
// ============================================================================
