//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRemoteStore`] - Remote document store operations and change feed
//! - [`IMaterializer`] - Host placeholder layer and local-tree primitives

pub mod materializer;
pub mod remote_store;

pub use materializer::IMaterializer;
pub use remote_store::{IRemoteStore, RemoteResult, RemoteStoreError};
