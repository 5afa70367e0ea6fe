//! Bidirectional mapping between local paths and remote locators
//!
//! The mapper is pure: it never touches the filesystem or the network.
//! Each local path component becomes one percent-encoded URL segment below
//! the remote root; folder locators carry a trailing `/`. Decoding is the
//! exact inverse, so for every path `P` under the local root
//! `to_local(to_remote(P)) == normalize(P)`.

use std::path::{Component, Path};

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Position;

use super::errors::DomainError;
use super::item::ItemKind;
use super::newtypes::{RemoteLocator, SyncPath};

/// Everything except RFC 3986 unreserved characters is escaped
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    local_root: SyncPath,
    remote_root: RemoteLocator,
}

impl PathMapper {
    /// Create a mapper; the remote root is treated as a folder
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRemoteLocator` if the root cannot be
    /// turned into a folder locator
    pub fn new(local_root: SyncPath, remote_root: RemoteLocator) -> Result<Self, DomainError> {
        let remote_root = if remote_root.is_folder() {
            remote_root
        } else {
            let mut url = remote_root.as_url().clone();
            let path = format!("{}/", url.path());
            url.set_path(&path);
            RemoteLocator::from_url(url)?
        };
        Ok(Self {
            local_root,
            remote_root,
        })
    }

    pub fn local_root(&self) -> &SyncPath {
        &self.local_root
    }

    pub fn remote_root(&self) -> &RemoteLocator {
        &self.remote_root
    }

    /// Map a local path to its remote locator
    ///
    /// # Errors
    /// - `DomainError::InvalidPath` for relative, non-UTF-8 or escaping paths,
    ///   or a file kind requested for the root
    /// - `DomainError::PathNotInSyncRoot` for paths outside the local root
    pub fn to_remote(&self, local: &Path, kind: ItemKind) -> Result<RemoteLocator, DomainError> {
        let path = SyncPath::new_within_root(local, &self.local_root)?;
        let relative = path.relative_to(&self.local_root)?;

        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => {
                    let name = name.to_str().ok_or_else(|| {
                        DomainError::InvalidPath(format!("Non UTF-8 path: {}", local.display()))
                    })?;
                    segments.push(utf8_percent_encode(name, SEGMENT).to_string());
                }
                _ => {
                    return Err(DomainError::InvalidPath(format!(
                        "Unexpected component in {}",
                        local.display()
                    )))
                }
            }
        }

        if segments.is_empty() {
            if kind == ItemKind::File {
                return Err(DomainError::InvalidPath(
                    "The sync root cannot be mapped as a file".to_string(),
                ));
            }
            return Ok(self.remote_root.clone());
        }

        let mut remote_path = self.remote_root.as_url().path().to_string();
        remote_path.push_str(&segments.join("/"));
        if kind == ItemKind::Folder {
            remote_path.push('/');
        }

        let mut url = self.remote_root.as_url().clone();
        url.set_path(&remote_path);
        RemoteLocator::from_url(url)
    }

    /// Map a remote locator back to the local path
    ///
    /// # Errors
    /// Returns `DomainError::InvalidRemoteLocator` for locators outside the
    /// remote root, empty segments, or segments that decode to a separator
    /// or dot segment
    pub fn to_local(&self, locator: &RemoteLocator) -> Result<SyncPath, DomainError> {
        let root = self.remote_root.as_url();
        let url = locator.as_url();

        if url[..Position::BeforePath] != root[..Position::BeforePath] {
            return Err(DomainError::InvalidRemoteLocator(format!(
                "{locator} is not under {}",
                self.remote_root
            )));
        }

        let root_path = root.path();
        let path = url.path();
        if path == root_path || format!("{path}/") == root_path {
            return Ok(self.local_root.clone());
        }

        let rest = path.strip_prefix(root_path).ok_or_else(|| {
            DomainError::InvalidRemoteLocator(format!("{locator} is not under {}", self.remote_root))
        })?;
        let rest = rest.strip_suffix('/').unwrap_or(rest);

        let mut local = self.local_root.clone();
        for segment in rest.split('/') {
            let name = percent_decode_str(segment).decode_utf8().map_err(|_| {
                DomainError::InvalidRemoteLocator(format!("Segment is not UTF-8: {segment}"))
            })?;
            if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
                return Err(DomainError::InvalidRemoteLocator(format!(
                    "Invalid segment {segment:?} in {locator}"
                )));
            }
            local = local.join(&name)?;
        }
        Ok(local)
    }

    /// Kind implied by a locator's trailing separator
    pub fn kind_of(locator: &RemoteLocator) -> ItemKind {
        if locator.is_folder() {
            ItemKind::Folder
        } else {
            ItemKind::File
        }
    }
}
