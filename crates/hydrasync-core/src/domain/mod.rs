//! Domain entities and business logic
//!
//! This module contains the core domain types for HydraSync:
//! - Newtypes for validated paths, locators, fingerprints and identifiers
//! - Local item variants and their capability traits
//! - Remote descriptors and lock records
//! - The placeholder blob codec
//! - The path mapper between local paths and remote locators
//! - Conflict records and domain-specific error types

pub mod blob;
pub mod change;
pub mod conflict;
pub mod errors;
pub mod item;
pub mod lock;
pub mod newtypes;
pub mod path_mapper;
pub mod remote;

// Re-export commonly used types
pub use blob::{BlobError, PlaceholderBlob};
pub use change::{ChangeEvent, ChangeKind, ChangeOrigin, RemoteNotification};
pub use conflict::{Conflict, ConflictReason};
pub use errors::DomainError;
pub use item::{
    DeleteScope, Deletable, FileItem, FolderItem, Item, ItemKind, ItemState, LocalEntry, Lockable,
    Movable, PinState,
};
pub use lock::{LockMode, LockRecord};
pub use newtypes::*;
pub use path_mapper::PathMapper;
pub use remote::{ByteRange, ItemAttributes, ItemMetadata, RemoteDescriptor};
