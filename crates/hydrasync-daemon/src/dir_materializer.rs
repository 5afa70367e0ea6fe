//! Directory materializer (secondary/driven adapter)
//!
//! Implements [`IMaterializer`] over an ordinary directory. A plain
//! filesystem has no native placeholders, so the per-item state the sync
//! core relies on is kept in a JSON state file outside the synced tree:
//!
//! - A dehydrated file is an empty file; its remote size lives in the
//!   state record.
//! - When the materializer writes a file, or marks it in sync, it records
//!   the file's length and mtime. A file whose length or mtime has moved on
//!   since then was edited by the user: it is reported hydrated and out of
//!   sync.
//! - Records follow renames through the inode they were taken on, so a
//!   moved placeholder keeps its blob.
//!
//! Content is fetched from the [`IRemoteStore`] on hydration; partial
//! ranges hydrate the whole file.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hydrasync_core::domain::{
    ByteRange, ItemKind, LocalEntry, PathMapper, PinState, PlaceholderBlob, RemoteDescriptor,
    SyncPath,
};
use hydrasync_core::ports::{IMaterializer, IRemoteStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const STATE_FILE: &str = "items.json";

/// Length and mtime of a file as last written or accepted by the materializer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Stamp {
    len: u64,
    modified: Option<DateTime<Utc>>,
}

impl Stamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ItemRecord {
    kind: ItemKind,
    placeholder: bool,
    in_sync: bool,
    hydrated: bool,
    remote_size: u64,
    stamp: Option<Stamp>,
    inode: Option<u64>,
    /// Base64 custom blob
    #[serde(default, skip_serializing_if = "String::is_empty")]
    blob: String,
}

impl ItemRecord {
    /// State of an item the sync core has not touched yet
    fn unmanaged(meta: &std::fs::Metadata) -> Self {
        Self {
            kind: kind_of(meta),
            placeholder: false,
            in_sync: false,
            hydrated: true,
            remote_size: meta.len(),
            stamp: Some(Stamp::of(meta)),
            inode: inode_of(meta),
            blob: String::new(),
        }
    }

    /// Content changed behind the materializer's back
    fn is_changed(&self, meta: &std::fs::Metadata) -> bool {
        self.kind == ItemKind::File && self.stamp != Some(Stamp::of(meta))
    }

    fn restamp(&mut self, meta: &std::fs::Metadata) {
        self.stamp = Some(Stamp::of(meta));
        self.inode = inode_of(meta);
    }
}

type Records = BTreeMap<PathBuf, ItemRecord>;

pub struct DirMaterializer {
    root: SyncPath,
    state_file: PathBuf,
    source: Arc<dyn IRemoteStore>,
    mapper: PathMapper,
    default_pin: PinState,
    records: Mutex<Records>,
}

impl DirMaterializer {
    /// Materialize into `mapper.local_root()`, keeping state in `state_dir`
    ///
    /// The local root is created if missing. `state_dir` must lie outside it.
    pub fn new(state_dir: &Path, mapper: PathMapper, source: Arc<dyn IRemoteStore>) -> Result<Self> {
        let root = mapper.local_root().clone();
        anyhow::ensure!(
            !state_dir.starts_with(root.as_path()),
            "state directory {} is inside the sync root {}",
            state_dir.display(),
            root
        );
        std::fs::create_dir_all(root.as_path())
            .with_context(|| format!("Failed to create sync root {root}"))?;
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;

        let state_file = state_dir.join(STATE_FILE);
        let records: Records = match std::fs::read(&state_file) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Failed to parse {}", state_file.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => Records::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", state_file.display()))
            }
        };

        info!(root = %root, items = records.len(), "Directory materializer opened");
        Ok(Self {
            root,
            state_file,
            source,
            mapper,
            default_pin: PinState::Unspecified,
            records: Mutex::new(records),
        })
    }

    /// Pin state reported for every item
    ///
    /// `Pinned` mirrors the whole remote tree with content.
    #[must_use]
    pub fn with_default_pin(mut self, pin: PinState) -> Self {
        self.default_pin = pin;
        self
    }

    fn relative(&self, path: &SyncPath) -> Result<PathBuf> {
        Ok(path.relative_to(&self.root)?)
    }

    async fn persist(&self, records: &Records) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        let tmp = self.state_file.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.state_file)
            .await
            .with_context(|| format!("Failed to replace {}", self.state_file.display()))?;
        Ok(())
    }

    /// Key of the record describing `rel`, moving it over if it was renamed
    ///
    /// Returns whether the map changed.
    fn follow(&self, records: &mut Records, rel: &Path, meta: &std::fs::Metadata) -> bool {
        if records.contains_key(rel) {
            return false;
        }
        let Some(inode) = inode_of(meta) else {
            return false;
        };
        let kind = kind_of(meta);
        let Some(old) = records
            .iter()
            .find(|(key, rec)| {
                rec.inode == Some(inode)
                    && rec.kind == kind
                    && std::fs::symlink_metadata(self.root.as_path().join(key)).is_err()
            })
            .map(|(key, _)| key.clone())
        else {
            return false;
        };

        let moved: Vec<PathBuf> = records.keys().filter(|k| k.starts_with(&old)).cloned().collect();
        for key in moved {
            if let Some(rec) = records.remove(&key) {
                let suffix = key.strip_prefix(&old).unwrap_or(Path::new(""));
                records.insert(rel.join(suffix), rec);
            }
        }
        debug!(from = %old.display(), to = %rel.display(), "State record followed rename");
        true
    }

    async fn metadata(&self, path: &SyncPath) -> Result<Option<std::fs::Metadata>> {
        match tokio::fs::symlink_metadata(path.as_path()).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to stat {path}")),
        }
    }

    async fn require(&self, path: &SyncPath) -> Result<std::fs::Metadata> {
        match self.metadata(path).await? {
            Some(meta) => Ok(meta),
            None => bail!("no local item at {path}"),
        }
    }

    /// Apply `f` to the record of an existing item, creating one if needed
    async fn update<T>(
        &self,
        path: &SyncPath,
        f: impl FnOnce(&mut ItemRecord, &std::fs::Metadata) -> T,
    ) -> Result<T> {
        let meta = self.require(path).await?;
        let rel = self.relative(path)?;
        let mut records = self.records.lock().await;
        self.follow(&mut records, &rel, &meta);
        let record = records
            .entry(rel)
            .or_insert_with(|| ItemRecord::unmanaged(&meta));
        let out = f(record, &meta);
        self.persist(&records).await?;
        Ok(out)
    }

    async fn peek<T>(&self, path: &SyncPath, f: impl FnOnce(Option<&ItemRecord>, &std::fs::Metadata) -> T) -> Result<T> {
        let meta = self.require(path).await?;
        let rel = self.relative(path)?;
        let mut records = self.records.lock().await;
        if self.follow(&mut records, &rel, &meta) {
            self.persist(&records).await?;
        }
        Ok(f(records.get(&rel), &meta))
    }

    fn entry(&self, path: SyncPath, meta: &std::fs::Metadata, record: Option<&ItemRecord>) -> LocalEntry {
        let kind = kind_of(meta);
        let modified_at = meta.modified().ok().map(DateTime::<Utc>::from);
        let disk_size = if kind == ItemKind::File { meta.len() } else { 0 };
        let Some(rec) = record else {
            return LocalEntry {
                in_sync: path == self.root,
                path,
                kind,
                is_placeholder: false,
                hydrated: true,
                size: disk_size,
                modified_at,
            };
        };

        let changed = rec.is_changed(meta);
        let hydrated = rec.hydrated || changed;
        LocalEntry {
            path,
            kind,
            is_placeholder: rec.placeholder,
            in_sync: rec.in_sync && !changed,
            hydrated,
            size: if kind == ItemKind::File && !hydrated {
                rec.remote_size
            } else {
                disk_size
            },
            modified_at,
        }
    }

    /// Write `content` in place and record the result as the materializer's own
    async fn write_content(&self, path: &SyncPath, content: &[u8]) -> Result<()> {
        tokio::fs::write(path.as_path(), content)
            .await
            .with_context(|| format!("Failed to write {path}"))?;
        let remote_size = content.len() as u64;
        self.update(path, |rec, meta| {
            rec.hydrated = true;
            rec.remote_size = remote_size;
            rec.restamp(meta);
        })
        .await
    }
}

#[async_trait]
impl IMaterializer for DirMaterializer {
    async fn is_offline(&self, path: &SyncPath) -> Result<bool> {
        self.peek(path, |rec, meta| {
            meta.is_dir() && rec.is_some_and(|r| r.placeholder && !r.hydrated)
        })
        .await
    }

    async fn is_placeholder(&self, path: &SyncPath) -> Result<bool> {
        self.peek(path, |rec, _| rec.is_some_and(|r| r.placeholder)).await
    }

    #[instrument(skip(self, blob), fields(path = %path))]
    async fn convert_to_placeholder(&self, path: &SyncPath, blob: &[u8]) -> Result<()> {
        anyhow::ensure!(blob.len() <= PlaceholderBlob::MAX_SIZE, "blob of {path} exceeds {} bytes", PlaceholderBlob::MAX_SIZE);
        let encoded = base64::engine::general_purpose::STANDARD.encode(blob);
        self.update(path, |rec, meta| {
            rec.placeholder = true;
            rec.hydrated = true;
            rec.remote_size = meta.len();
            rec.blob = encoded;
            rec.restamp(meta);
        })
        .await?;
        debug!("Converted to placeholder");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn hydrate(&self, path: &SyncPath, range: ByteRange) -> Result<()> {
        let meta = self.require(path).await?;
        if meta.is_dir() {
            return self.update(path, |rec, _| rec.hydrated = true).await;
        }
        if !range.is_full() {
            debug!(offset = range.offset, length = ?range.length, "Hydrating whole file for partial range");
        }
        let locator = self.mapper.to_remote(path.as_path(), ItemKind::File)?;
        let content = self.source.read(&locator, ByteRange::FULL).await?;
        self.write_content(path, &content).await?;
        debug!(bytes = content.len(), "Hydrated");
        Ok(())
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn dehydrate(&self, path: &SyncPath, _range: ByteRange) -> Result<()> {
        let meta = self.require(path).await?;
        if meta.is_dir() {
            return self.update(path, |rec, _| rec.hydrated = false).await;
        }
        let size = meta.len();
        tokio::fs::File::create(path.as_path())
            .await
            .with_context(|| format!("Failed to truncate {path}"))?;
        self.update(path, |rec, meta| {
            rec.hydrated = false;
            rec.remote_size = size;
            rec.restamp(meta);
        })
        .await?;
        debug!(bytes = size, "Dehydrated");
        Ok(())
    }

    async fn get_custom_blob(&self, path: &SyncPath) -> Result<Vec<u8>> {
        let encoded = self
            .peek(path, |rec, _| rec.map(|r| r.blob.clone()).unwrap_or_default())
            .await?;
        Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
    }

    async fn set_custom_blob(&self, path: &SyncPath, blob: &[u8]) -> Result<()> {
        anyhow::ensure!(blob.len() <= PlaceholderBlob::MAX_SIZE, "blob of {path} exceeds {} bytes", PlaceholderBlob::MAX_SIZE);
        let encoded = base64::engine::general_purpose::STANDARD.encode(blob);
        self.update(path, |rec, _| rec.blob = encoded).await
    }

    async fn list_children(&self, folder: &SyncPath) -> Result<Vec<LocalEntry>> {
        let mut dir = tokio::fs::read_dir(folder.as_path())
            .await
            .with_context(|| format!("Failed to list {folder}"))?;
        let mut found = Vec::new();
        while let Some(child) = dir.next_entry().await? {
            let Some(name) = child.file_name().to_str().map(str::to_owned) else {
                debug!(path = %child.path().display(), "Skipping non UTF-8 name");
                continue;
            };
            let meta = match child.metadata().await {
                Ok(meta) if meta.is_dir() || meta.is_file() => meta,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", child.path().display())),
            };
            found.push((folder.join(&name)?, meta));
        }

        let mut records = self.records.lock().await;
        let mut moved = false;
        let mut entries = Vec::with_capacity(found.len());
        for (path, meta) in found {
            let rel = self.relative(&path)?;
            moved |= self.follow(&mut records, &rel, &meta);
            entries.push(self.entry(path, &meta, records.get(&rel)));
        }
        if moved {
            self.persist(&records).await?;
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn stat(&self, path: &SyncPath) -> Result<Option<LocalEntry>> {
        let Some(meta) = self.metadata(path).await? else {
            return Ok(None);
        };
        if !meta.is_dir() && !meta.is_file() {
            return Ok(None);
        }
        let rel = self.relative(path)?;
        let mut records = self.records.lock().await;
        if self.follow(&mut records, &rel, &meta) {
            self.persist(&records).await?;
        }
        Ok(Some(self.entry(path.clone(), &meta, records.get(&rel))))
    }

    #[instrument(skip(self, descriptor, blob), fields(parent = %parent, name = %descriptor.name))]
    async fn create_placeholder(
        &self,
        parent: &SyncPath,
        descriptor: &RemoteDescriptor,
        blob: &[u8],
    ) -> Result<SyncPath> {
        anyhow::ensure!(blob.len() <= PlaceholderBlob::MAX_SIZE, "blob exceeds {} bytes", PlaceholderBlob::MAX_SIZE);
        let path = parent.join(&descriptor.name)?;
        anyhow::ensure!(self.metadata(&path).await?.is_none(), "already exists: {path}");

        let created = match descriptor.kind {
            ItemKind::Folder => tokio::fs::create_dir(path.as_path()).await,
            ItemKind::File => tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path.as_path())
                .await
                .map(drop),
        };
        created.with_context(|| format!("Failed to create placeholder {path}"))?;

        let meta = self.require(&path).await?;
        let record = ItemRecord {
            kind: descriptor.kind,
            placeholder: true,
            in_sync: false,
            hydrated: false,
            remote_size: descriptor.size,
            stamp: Some(Stamp::of(&meta)),
            inode: inode_of(&meta),
            blob: base64::engine::general_purpose::STANDARD.encode(blob),
        };
        let mut records = self.records.lock().await;
        records.insert(self.relative(&path)?, record);
        self.persist(&records).await?;
        debug!(path = %path, "Placeholder created");
        Ok(path)
    }

    #[instrument(skip(self, descriptor, content), fields(path = %path))]
    async fn update_placeholder(
        &self,
        path: &SyncPath,
        descriptor: &RemoteDescriptor,
        content: Option<&[u8]>,
    ) -> Result<()> {
        let meta = self.require(path).await?;
        if meta.is_dir() {
            return Ok(());
        }
        match content {
            Some(body) => self.write_content(path, body).await,
            None => {
                tokio::fs::File::create(path.as_path())
                    .await
                    .with_context(|| format!("Failed to truncate {path}"))?;
                let remote_size = descriptor.size;
                self.update(path, |rec, meta| {
                    rec.hydrated = false;
                    rec.remote_size = remote_size;
                    rec.restamp(meta);
                })
                .await
            }
        }
    }

    async fn read_content(&self, path: &SyncPath) -> Result<Vec<u8>> {
        tokio::fs::read(path.as_path())
            .await
            .with_context(|| format!("Failed to read {path}"))
    }

    #[instrument(skip(self), fields(path = %path))]
    async fn delete(&self, path: &SyncPath) -> Result<()> {
        let meta = self.require(path).await?;
        let removed = if meta.is_dir() {
            tokio::fs::remove_dir_all(path.as_path()).await
        } else {
            tokio::fs::remove_file(path.as_path()).await
        };
        removed.with_context(|| format!("Failed to delete {path}"))?;

        let rel = self.relative(path)?;
        let mut records = self.records.lock().await;
        records.retain(|key, _| !key.starts_with(&rel));
        self.persist(&records).await?;
        debug!("Deleted");
        Ok(())
    }

    async fn set_in_sync(&self, path: &SyncPath, in_sync: bool) -> Result<()> {
        self.update(path, |rec, meta| {
            rec.in_sync = in_sync;
            if in_sync {
                rec.restamp(meta);
            }
        })
        .await
    }

    async fn pin_state(&self, path: &SyncPath) -> Result<PinState> {
        self.require(path).await?;
        Ok(self.default_pin)
    }
}

fn kind_of(meta: &std::fs::Metadata) -> ItemKind {
    if meta.is_dir() {
        ItemKind::Folder
    } else {
        ItemKind::File
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

// ============================================================================
// Unit tests
// ============================================================================
