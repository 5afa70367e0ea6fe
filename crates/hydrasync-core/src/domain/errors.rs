//! Domain error types
//!
//! This module defines error types specific to domain operations,
//! including validation failures and path mapping errors.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),

    /// Invalid remote locator, or a locator outside the remote root
    #[error("Invalid remote locator: {0}")]
    InvalidRemoteLocator(String),

    /// Invalid remote ID format
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// Invalid fingerprint (change token)
    #[error("Invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl DomainError {
    /// Returns true for errors raised by the path mapper
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            DomainError::InvalidPath(_)
                | DomainError::PathNotInSyncRoot(_)
                | DomainError::InvalidRemoteLocator(_)
        )
    }
}
