//! Integration tests for hydrasync-sync
//!
//! An in-memory remote store and materializer drive the walker, the
//! per-item actions, the monitors and the engine end to end.

mod common;

mod test_locks;
mod test_monitors;
mod test_outbound;
