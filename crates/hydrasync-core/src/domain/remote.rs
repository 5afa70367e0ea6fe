//! Remote-side snapshots and write metadata

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::ItemKind;
use super::lock::LockRecord;
use super::newtypes::{Fingerprint, RemoteId};

/// File attributes carried alongside content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAttributes {
    pub read_only: bool,
    pub hidden: bool,
}

/// Immutable snapshot of a remote object, produced per remote-store call
///
/// Never cached beyond the operation that fetched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    pub name: String,
    pub kind: ItemKind,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub attributes: ItemAttributes,
    /// Server-issued change token, if the store provides one
    pub fingerprint: Option<Fingerprint>,
    pub remote_id: RemoteId,
    pub lock: Option<LockRecord>,
}

impl RemoteDescriptor {
    /// The store's fingerprint, or one synthesized from `modified_at`
    pub fn effective_fingerprint(&self) -> Fingerprint {
        self.fingerprint
            .clone()
            .unwrap_or_else(|| Fingerprint::synthesized(self.modified_at))
    }

    pub fn is_folder(&self) -> bool {
        self.kind == ItemKind::Folder
    }

    /// Lock held on the remote, ignoring expired records
    pub fn active_lock(&self) -> Option<&LockRecord> {
        self.lock.as_ref().filter(|l| !l.is_expired())
    }

    /// Metadata to write locally when materializing this descriptor
    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            kind: self.kind,
            size: self.size,
            created_at: self.created_at,
            modified_at: self.modified_at,
            attributes: self.attributes,
        }
    }
}

/// Metadata sent with an outbound create or write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub kind: ItemKind,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub attributes: ItemAttributes,
}

impl ItemMetadata {
    pub fn folder(now: DateTime<Utc>) -> Self {
        Self {
            kind: ItemKind::Folder,
            size: 0,
            created_at: now,
            modified_at: now,
            attributes: ItemAttributes::default(),
        }
    }
}

/// Byte range for partial reads and (de)hydration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    /// None means "to the end"
    pub length: Option<u64>,
}

impl ByteRange {
    /// The whole object
    pub const FULL: ByteRange = ByteRange {
        offset: 0,
        length: None,
    };

    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }

    pub fn is_full(&self) -> bool {
        self.offset == 0 && self.length.is_none()
    }

    /// Clamp the range to a buffer of `len` bytes, as index bounds
    pub fn bounds(&self, len: usize) -> (usize, usize) {
        let start = usize::try_from(self.offset).unwrap_or(usize::MAX).min(len);
        let end = match self.length {
            Some(l) => start
                .saturating_add(usize::try_from(l).unwrap_or(usize::MAX))
                .min(len),
            None => len,
        };
        (start, end)
    }
}
