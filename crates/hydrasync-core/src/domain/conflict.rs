//! Conflict domain entities
//!
//! A conflict is recorded when an outbound update finds that the remote
//! object changed since the last successful sync. Conflicts are flagged,
//! never merged; they stay pending until resolved externally.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ConflictId, Fingerprint, SyncPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Remote fingerprint differs from the stored one
    RemoteModified,
    /// Remote object disappeared while local edits were pending
    RemoteDeleted,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConflictReason::RemoteModified => "remote_modified",
            ConflictReason::RemoteDeleted => "remote_deleted",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    id: ConflictId,
    path: SyncPath,
    reason: ConflictReason,
    /// Fingerprint stored locally at the last successful sync
    local_fingerprint: Option<Fingerprint>,
    /// Fingerprint the remote reported when the conflict was detected
    remote_fingerprint: Option<Fingerprint>,
    detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        path: SyncPath,
        reason: ConflictReason,
        local_fingerprint: Option<Fingerprint>,
        remote_fingerprint: Option<Fingerprint>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            path,
            reason,
            local_fingerprint,
            remote_fingerprint,
            detected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ConflictId {
        self.id
    }

    pub fn path(&self) -> &SyncPath {
        &self.path
    }

    pub fn reason(&self) -> ConflictReason {
        self.reason
    }

    pub fn local_fingerprint(&self) -> Option<&Fingerprint> {
        self.local_fingerprint.as_ref()
    }

    pub fn remote_fingerprint(&self) -> Option<&Fingerprint> {
        self.remote_fingerprint.as_ref()
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path, self.reason)
    }
}
