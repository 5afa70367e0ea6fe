//! HydraSync Conflict - Fingerprint persistence and conflict detection
//!
//! Provides:
//! - Per-item fingerprint storage inside the placeholder blob
//! - The optimistic-concurrency guard applied before outbound updates
//! - Detection of remote changes over unsynced local edits
//! - A registry of flagged conflicts awaiting external resolution

pub mod detector;
pub mod error;
pub mod fingerprint;
pub mod registry;

pub use detector::{ConflictDetector, DetectionResult};
pub use error::ConflictError;
pub use fingerprint::FingerprintStore;
pub use registry::ConflictRegistry;
