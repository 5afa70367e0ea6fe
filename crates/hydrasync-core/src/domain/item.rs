//! Local item variants
//!
//! A local item is either a file or a folder. Both share an [`ItemState`]
//! record (path, placeholder and sync flags, decoded blob); behaviour that
//! only makes sense for one variant is expressed through the capability
//! traits [`Movable`], [`Deletable`] and [`Lockable`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blob::PlaceholderBlob;
use super::lock::LockRecord;
use super::newtypes::{Fingerprint, SyncPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Folder,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::File => write!(f, "file"),
            ItemKind::Folder => write!(f, "folder"),
        }
    }
}

/// User intent for keeping content local
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinState {
    #[default]
    Unspecified,
    /// Always keep content on this device
    Pinned,
    /// Free up space: content may be discarded
    Unpinned,
}

/// What the materialization layer reports for one local entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: SyncPath,
    pub kind: ItemKind,
    pub is_placeholder: bool,
    pub in_sync: bool,
    /// Content fully present (files) or children populated (folders)
    pub hydrated: bool,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// State shared by both item variants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemState {
    path: SyncPath,
    is_placeholder: bool,
    is_synchronized: bool,
    blob: PlaceholderBlob,
}

impl ItemState {
    pub fn new(path: SyncPath, is_placeholder: bool, is_synchronized: bool, blob: PlaceholderBlob) -> Self {
        Self {
            path,
            is_placeholder,
            is_synchronized,
            blob,
        }
    }

    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn is_placeholder(&self) -> bool {
        self.is_placeholder
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized
    }

    pub fn stored_fingerprint(&self) -> Option<&Fingerprint> {
        self.blob.fingerprint.as_ref()
    }

    pub fn blob(&self) -> &PlaceholderBlob {
        &self.blob
    }

    pub fn is_conflicted(&self) -> bool {
        self.blob.conflicted
    }

    /// Never synced: no placeholder identity and no stored fingerprint
    pub fn is_new(&self) -> bool {
        !self.is_placeholder || self.blob.fingerprint.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    state: ItemState,
    size: u64,
    hydrated: bool,
}

impl FileItem {
    pub fn new(state: ItemState, size: u64, hydrated: bool) -> Self {
        Self {
            state,
            size,
            hydrated,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderItem {
    state: ItemState,
    offline: bool,
}

impl FolderItem {
    pub fn new(state: ItemState, offline: bool) -> Self {
        Self { state, offline }
    }

    /// Children not yet populated locally
    pub fn is_offline(&self) -> bool {
        self.offline
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    File(FileItem),
    Folder(FolderItem),
}

impl Item {
    /// Build an item from a materializer entry and its decoded blob
    pub fn from_entry(entry: LocalEntry, blob: PlaceholderBlob) -> Self {
        let state = ItemState::new(entry.path, entry.is_placeholder, entry.in_sync, blob);
        match entry.kind {
            ItemKind::File => Item::File(FileItem::new(state, entry.size, entry.hydrated)),
            ItemKind::Folder => Item::Folder(FolderItem::new(state, !entry.hydrated)),
        }
    }

    pub fn state(&self) -> &ItemState {
        match self {
            Item::File(f) => &f.state,
            Item::Folder(d) => &d.state,
        }
    }

    pub fn kind(&self) -> ItemKind {
        match self {
            Item::File(_) => ItemKind::File,
            Item::Folder(_) => ItemKind::Folder,
        }
    }

    pub fn path(&self) -> &SyncPath {
        self.state().path()
    }

    pub fn as_lockable(&self) -> Option<&dyn Lockable> {
        match self {
            Item::File(f) => Some(f),
            Item::Folder(_) => None,
        }
    }

    pub fn as_movable(&self) -> &dyn Movable {
        match self {
            Item::File(f) => f,
            Item::Folder(d) => d,
        }
    }

    pub fn as_deletable(&self) -> &dyn Deletable {
        match self {
            Item::File(f) => f,
            Item::Folder(d) => d,
        }
    }
}

/// Scope of a delete propagated to the other side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteScope {
    Single,
    Recursive,
}

pub trait Movable {
    /// Whether the rename keeps the synchronized flag if the remote move
    /// succeeds
    fn keeps_sync_on_move(&self) -> bool;
}

pub trait Deletable {
    fn delete_scope(&self) -> DeleteScope;

    /// Local deletion propagated from the remote is allowed only for items
    /// that were synchronized, so unsynced local work is never discarded
    fn may_delete_from_remote(&self) -> bool;
}

pub trait Lockable {
    fn lock_record(&self) -> Option<&LockRecord>;

    fn is_locked(&self) -> bool {
        self.lock_record().is_some()
    }
}

impl Movable for FileItem {
    fn keeps_sync_on_move(&self) -> bool {
        self.state.is_synchronized
    }
}

impl Movable for FolderItem {
    fn keeps_sync_on_move(&self) -> bool {
        self.state.is_synchronized
    }
}

impl Deletable for FileItem {
    fn delete_scope(&self) -> DeleteScope {
        DeleteScope::Single
    }

    fn may_delete_from_remote(&self) -> bool {
        self.state.is_synchronized && !self.state.is_conflicted()
    }
}

impl Deletable for FolderItem {
    fn delete_scope(&self) -> DeleteScope {
        DeleteScope::Recursive
    }

    fn may_delete_from_remote(&self) -> bool {
        self.state.is_synchronized
    }
}

impl Lockable for FileItem {
    fn lock_record(&self) -> Option<&LockRecord> {
        self.state.blob.active_lock()
    }
}
