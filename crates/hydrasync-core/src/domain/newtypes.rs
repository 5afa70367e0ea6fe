//! Domain newtypes with validation
//!
//! Strongly-typed wrappers for the identifiers and values that cross the
//! sync core: local paths, remote locators, fingerprints, remote IDs, lock
//! tokens and operation identifiers. Each newtype ensures data validity at
//! construction time.

use std::fmt::{self, Display, Formatter};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// Operation identifiers
// ============================================================================

/// Correlation identifier attached to an outbound remote write
///
/// The remote store echoes it back on the change notification caused by
/// that write, which lets the remote monitor recognise its own work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Create a new random OperationId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OperationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OperationId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid OperationId: {e}")))
    }
}

/// Unique identifier for a flagged conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConflictId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Opaque remote tokens
// ============================================================================

/// Opaque change token issued by the remote store, or synthesized locally
///
/// Two fingerprints are equal only if their textual form is equal. A
/// synthesized fingerprint carries the modification time it was derived
/// from and is weaker than a server-issued one: coarse timestamps or clock
/// skew can make two distinct contents compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    const SYNTHESIZED_PREFIX: &'static str = "mtime:";

    /// Create a new Fingerprint
    ///
    /// # Errors
    /// Returns `DomainError::InvalidFingerprint` if the value is empty
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::InvalidFingerprint(
                "Fingerprint cannot be empty".to_string(),
            ));
        }
        Ok(Self(value))
    }

    /// Derive a fingerprint from a last-write time
    #[must_use]
    pub fn synthesized(modified: DateTime<Utc>) -> Self {
        Self(format!(
            "{}{}",
            Self::SYNTHESIZED_PREFIX,
            modified.to_rfc3339_opts(SecondsFormat::Nanos, true)
        ))
    }

    /// True when the fingerprint was derived from a modification time
    #[must_use]
    pub fn is_synthesized(&self) -> bool {
        self.0.starts_with(Self::SYNTHESIZED_PREFIX)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Stable identifier of an object in the remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// # Errors
    /// Returns `DomainError::InvalidRemoteId` if the ID is empty or has
    /// surrounding whitespace
    pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
        let id = id.into();
        if id.is_empty() {
            return Err(DomainError::InvalidRemoteId(
                "Remote ID cannot be empty".to_string(),
            ));
        }
        if id.trim() != id {
            return Err(DomainError::InvalidRemoteId(format!(
                "Remote ID contains surrounding whitespace: {id:?}"
            )));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

/// Token returned by a remote lock acquisition, required to release it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(String);

impl LockToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LockToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Path types
// ============================================================================

/// A validated, normalized absolute local path
///
/// SyncPath ensures the path is:
/// - Absolute (starts with /)
/// - Normalized (no . or .. components)
/// - Within the sync root when validated against one
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Create a new SyncPath, validating it is absolute
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is not absolute or a
    /// `..` component climbs above `/`
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, DomainError> {
        let path = path.into();
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        // The path might not exist yet, so no fs::canonicalize()
        let normalized = Self::normalize_path(&path)?;
        Ok(Self(normalized))
    }

    /// Create a SyncPath validated against a sync root
    ///
    /// # Errors
    /// Returns error if the normalized path is not within the sync root
    pub fn new_within_root(
        path: impl Into<PathBuf>,
        sync_root: &SyncPath,
    ) -> Result<Self, DomainError> {
        let sync_path = Self::new(path)?;

        if !sync_path.is_within(sync_root) {
            return Err(DomainError::PathNotInSyncRoot(format!(
                "{} is not within sync root {}",
                sync_path.0.display(),
                sync_root.0.display()
            )));
        }

        Ok(sync_path)
    }

    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// True if this path equals `root` or lies below it
    #[must_use]
    pub fn is_within(&self, root: &SyncPath) -> bool {
        self.0.starts_with(&root.0)
    }

    /// Get the path relative to a root
    ///
    /// # Errors
    /// Returns error if this path is not within the root
    pub fn relative_to(&self, root: &SyncPath) -> Result<PathBuf, DomainError> {
        self.0
            .strip_prefix(&root.0)
            .map(Path::to_path_buf)
            .map_err(|_| {
                DomainError::PathNotInSyncRoot(format!(
                    "{} is not within {}",
                    self.0.display(),
                    root.0.display()
                ))
            })
    }

    /// Join a single name to this SyncPath
    ///
    /// # Errors
    /// Returns error if the name is empty, a dot segment, or contains a
    /// separator
    pub fn join(&self, name: &str) -> Result<Self, DomainError> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {name:?}"
            )));
        }
        Ok(Self(self.0.join(name)))
    }

    /// Parent folder, or None for `/`
    #[must_use]
    pub fn parent(&self) -> Option<SyncPath> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Final component as UTF-8, if any
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    fn normalize_path(path: &Path) -> Result<PathBuf, DomainError> {
        let mut normalized = PathBuf::new();

        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() || normalized.as_os_str().is_empty() {
                        return Err(DomainError::InvalidPath(format!(
                            "Path escapes root via ..: {}",
                            path.display()
                        )));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(normalized)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(sync_path: SyncPath) -> Self {
        sync_path.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// URL-shaped address of an object in the remote store
///
/// Folder locators end with a trailing `/`, file locators never do, so
/// appending a child segment to a folder locator is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteLocator(Url);

impl RemoteLocator {
    /// Parse a locator
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRemoteLocator` if the value is not an
    /// absolute hierarchical URL
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let url = Url::parse(value)
            .map_err(|e| DomainError::InvalidRemoteLocator(format!("{value}: {e}")))?;
        Self::from_url(url)
    }

    /// # Errors
    /// Returns `DomainError::InvalidRemoteLocator` for URLs that cannot
    /// carry path segments (e.g. `mailto:`)
    pub fn from_url(url: Url) -> Result<Self, DomainError> {
        if url.cannot_be_a_base() {
            return Err(DomainError::InvalidRemoteLocator(format!(
                "Locator must be hierarchical: {url}"
            )));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(DomainError::InvalidRemoteLocator(format!(
                "Locator must not carry a query or fragment: {url}"
            )));
        }
        Ok(Self(url))
    }

    #[must_use]
    pub fn as_url(&self) -> &Url {
        &self.0
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// True for folder locators (trailing separator)
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.0.path().ends_with('/')
    }

    /// Decoded final segment, or None for a root locator
    #[must_use]
    pub fn name(&self) -> Option<String> {
        let trimmed = self.0.path().trim_end_matches('/');
        let last = trimmed.rsplit('/').next()?;
        if last.is_empty() {
            return None;
        }
        percent_decode_str(last)
            .decode_utf8()
            .ok()
            .map(|s| s.into_owned())
    }

    /// Folder locator containing this one
    #[must_use]
    pub fn parent(&self) -> Option<RemoteLocator> {
        let path = self.0.path().trim_end_matches('/');
        if path.is_empty() {
            return None;
        }
        let cut = path.rfind('/')?;
        let mut url = self.0.clone();
        url.set_path(&path[..=cut]);
        Some(Self(url))
    }
}

impl Display for RemoteLocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteLocator {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RemoteLocator {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<RemoteLocator> for String {
    fn from(loc: RemoteLocator) -> Self {
        loc.0.into()
    }
}
