//! HydraSync Core - Domain logic and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `Item`, `RemoteDescriptor`, `LockRecord`, `ChangeEvent`, `Conflict`
//! - **Path mapping** - `PathMapper` between local paths and remote locators
//! - **Placeholder blob** - versioned codec for per-item sync state
//! - **Port definitions** - Traits for adapters: `IRemoteStore`, `IMaterializer`
//! - **Configuration** - YAML-backed `Config` with validation
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.

pub mod config;
pub mod domain;
pub mod ports;
