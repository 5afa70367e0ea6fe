//! Change events consumed by the monitors

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::newtypes::{OperationId, RemoteLocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
    Moved,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Created => "created",
            ChangeKind::Updated => "updated",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Moved => "moved",
        };
        write!(f, "{s}")
    }
}

/// A single observed mutation, expressed in local-tree paths
///
/// Transient: each event is consumed once by the monitor that receives it.
/// Remote notifications are translated into this shape by the remote
/// monitor after path mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub kind: ChangeKind,
    pub path: PathBuf,
    /// Destination of a move
    pub new_path: Option<PathBuf>,
    /// Operation identifier echoed by the remote store
    pub correlation: Option<OperationId>,
}

impl ChangeEvent {
    pub fn local(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            origin: ChangeOrigin::Local,
            kind,
            path: path.into(),
            new_path: None,
            correlation: None,
        }
    }

    pub fn local_move(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            origin: ChangeOrigin::Local,
            kind: ChangeKind::Moved,
            path: from.into(),
            new_path: Some(to.into()),
            correlation: None,
        }
    }

    /// Every path this event touches
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.path).chain(self.new_path.iter())
    }
}

/// A change notification as delivered by the remote store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNotification {
    pub kind: ChangeKind,
    pub locator: RemoteLocator,
    pub new_locator: Option<RemoteLocator>,
    pub correlation: Option<OperationId>,
}

impl RemoteNotification {
    pub fn new(kind: ChangeKind, locator: RemoteLocator) -> Self {
        Self {
            kind,
            locator,
            new_locator: None,
            correlation: None,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, op: OperationId) -> Self {
        self.correlation = Some(op);
        self
    }

    #[must_use]
    pub fn with_new_locator(mut self, to: RemoteLocator) -> Self {
        self.new_locator = Some(to);
        self
    }
}
