//! Loop suppression
//!
//! Every write the engine makes is observed again by the monitor watching the
//! side it wrote to. Outbound writes carry an [`OperationId`] that the remote
//! store echoes on the resulting notification; inbound writes register the
//! local paths they touch, and the local monitor consumes one expectation per
//! echoed event.
//!
//! Registrations are settled by [`SuppressionGuard`] on drop, and linger for
//! a grace window so late echoes are still recognized. Concurrent operations
//! each hold their own registration, so one finishing never unblinds a
//! monitor for another.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::DashMap;
use hydrasync_core::domain::{OperationId, SyncPath};
use tokio::time::Instant;
use tracing::trace;

/// Which monitor must not see the echo
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// A write to the remote store; blinds the remote monitor
    Outbound,
    /// A write to the local tree; blinds the local monitor
    Inbound,
}

#[derive(Debug)]
struct Registration {
    inflight: usize,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct EchoExpectation {
    inflight: usize,
    expected: usize,
    expires_at: Option<Instant>,
}

impl EchoExpectation {
    fn is_expired(&self, now: Instant) -> bool {
        self.inflight == 0 && self.expires_at.is_some_and(|t| now >= t)
    }
}

pub struct LoopSuppressor {
    grace: Duration,
    operations: DashMap<OperationId, Registration>,
    local_echoes: DashMap<PathBuf, EchoExpectation>,
}

impl LoopSuppressor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            operations: DashMap::new(),
            local_echoes: DashMap::new(),
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Register a write about to happen in `direction`
    ///
    /// `scope` lists the local paths an inbound write touches; it is unused
    /// for outbound writes, which are matched by correlation.
    pub fn suppress(&self, direction: Direction, scope: &[SyncPath]) -> SuppressionGuard<'_> {
        let operation = OperationId::new();
        let paths = match direction {
            Direction::Outbound => {
                self.operations.insert(
                    operation,
                    Registration {
                        inflight: 1,
                        expires_at: None,
                    },
                );
                Vec::new()
            }
            Direction::Inbound => {
                let paths: Vec<PathBuf> = scope.iter().map(|p| p.as_path().to_path_buf()).collect();
                for path in &paths {
                    let mut entry = self
                        .local_echoes
                        .entry(path.clone())
                        .or_insert(EchoExpectation {
                            inflight: 0,
                            expected: 0,
                            expires_at: None,
                        });
                    entry.inflight += 1;
                    entry.expected += 1;
                    entry.expires_at = None;
                }
                paths
            }
        };
        trace!(operation = %operation, ?direction, paths = paths.len(), "Suppression registered");
        SuppressionGuard {
            suppressor: self,
            direction,
            operation,
            paths,
        }
    }

    /// Run `action` blind to its own echo in `direction`
    ///
    /// The registration is settled when `action` completes, fails, or is
    /// dropped mid-flight.
    pub async fn with_suppressed<F, Fut, T>(
        &self,
        direction: Direction,
        scope: &[SyncPath],
        action: F,
    ) -> T
    where
        F: FnOnce(OperationId) -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.suppress(direction, scope);
        let out = action(guard.operation()).await;
        drop(guard);
        out
    }

    /// True if a remote notification is the echo of one of our writes
    pub fn is_own_remote_echo(&self, correlation: Option<OperationId>) -> bool {
        let Some(op) = correlation else {
            return false;
        };
        let now = Instant::now();
        let own = match self.operations.get(&op) {
            Some(reg) => reg.inflight > 0 || reg.expires_at.is_some_and(|t| now < t),
            None => return false,
        };
        if !own {
            self.operations
                .remove_if(&op, |_, reg| reg.inflight == 0 && reg.expires_at.is_some_and(|t| now >= t));
        }
        own
    }

    /// Consume one expected local echo for `path`
    ///
    /// Returns true if the event must be dropped. While the inbound write is
    /// still running every event on the path is dropped without consuming.
    pub fn consume_local_echo(&self, path: &Path) -> bool {
        let now = Instant::now();
        let suppressed = match self.local_echoes.get_mut(path) {
            None => return false,
            Some(mut entry) => {
                if entry.inflight > 0 {
                    true
                } else if entry.is_expired(now) || entry.expected == 0 {
                    false
                } else {
                    entry.expected -= 1;
                    true
                }
            }
        };
        self.local_echoes
            .remove_if(path, |_, e| e.inflight == 0 && (e.expected == 0 || e.is_expired(now)));
        if suppressed {
            trace!(path = %path.display(), "Dropped local echo");
        }
        suppressed
    }

    /// Drop settled registrations past their grace window
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.operations
            .retain(|_, reg| reg.inflight > 0 || reg.expires_at.is_some_and(|t| now < t));
        self.local_echoes.retain(|_, e| !e.is_expired(now));
    }

    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    pub fn pending_echoes(&self) -> usize {
        self.local_echoes.len()
    }

    fn settle(&self, direction: Direction, operation: OperationId, paths: &[PathBuf]) {
        let expires_at = Some(Instant::now() + self.grace);
        match direction {
            Direction::Outbound => {
                if let Some(mut reg) = self.operations.get_mut(&operation) {
                    reg.inflight = reg.inflight.saturating_sub(1);
                    if reg.inflight == 0 {
                        reg.expires_at = expires_at;
                    }
                }
            }
            Direction::Inbound => {
                for path in paths {
                    if let Some(mut e) = self.local_echoes.get_mut(path) {
                        e.inflight = e.inflight.saturating_sub(1);
                        if e.inflight == 0 {
                            e.expires_at = expires_at;
                        }
                    }
                }
            }
        }
    }
}

/// Live suppression registration; settles on drop
pub struct SuppressionGuard<'a> {
    suppressor: &'a LoopSuppressor,
    direction: Direction,
    operation: OperationId,
    paths: Vec<PathBuf>,
}

impl SuppressionGuard<'_> {
    /// Correlation identifier to pass to the remote store
    pub fn operation(&self) -> OperationId {
        self.operation
    }
}

impl Drop for SuppressionGuard<'_> {
    fn drop(&mut self) {
        self.suppressor
            .settle(self.direction, self.operation, &self.paths);
    }
}
