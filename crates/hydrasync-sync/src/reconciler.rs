//! Pass runner shared by the reconciliation loop, the remote monitor and
//! forced reconciles
//!
//! Every walk goes through [`Reconciler::pass`], which publishes
//! `Synchronizing` while at least one pass is active, purges expired
//! suppression entries and drops idle path locks afterwards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use hydrasync_core::domain::SyncPath;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::context::SyncContext;
use crate::engine::SyncState;
use crate::walker::{ReconcileWalker, WalkReport};
use crate::SyncError;

/// Runs walks and keeps the published state and resume point current
#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<SyncContext>,
    walker: Arc<ReconcileWalker>,
    state: Arc<watch::Sender<SyncState>>,
    active: Arc<AtomicUsize>,
    resume: Arc<StdMutex<Vec<SyncPath>>>,
}

impl Reconciler {
    /// Starts out `Disabled`
    pub fn new(ctx: Arc<SyncContext>, walker: Arc<ReconcileWalker>) -> Self {
        let (state, _) = watch::channel(SyncState::Disabled);
        Self {
            ctx,
            walker,
            state: Arc::new(state),
            active: Arc::new(AtomicUsize::new(0)),
            resume: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn publish(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Walk from the root, or from wherever an interrupted pass stopped
    pub async fn full_pass(&self, cancel: &CancellationToken) -> Result<WalkReport, SyncError> {
        let resumed = std::mem::take(&mut *self.resume.lock().unwrap_or_else(PoisonError::into_inner));
        let roots = if resumed.is_empty() {
            vec![self.ctx.local_root().clone()]
        } else {
            debug!(folders = resumed.len(), "Resuming interrupted walk");
            resumed
        };
        self.pass(roots, true, cancel).await
    }

    /// Run one walk over `roots`; `recursive` descends into online
    /// subfolders, otherwise only the direct children are reconciled
    pub async fn pass(
        &self,
        roots: Vec<SyncPath>,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> Result<WalkReport, SyncError> {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            if *s == SyncState::Disabled || *s == SyncState::Synchronizing {
                return false;
            }
            *s = SyncState::Synchronizing;
            true
        });

        let result = if recursive {
            self.walker.walk(roots, cancel).await
        } else {
            self.walker.sync_folders(roots, cancel).await
        };

        if let Ok(report) = &result {
            if !report.remaining.is_empty() {
                self.resume
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(report.remaining.iter().cloned());
            }
        }
        self.ctx.suppressor.purge_expired();
        self.ctx.path_locks.prune();

        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.send_if_modified(|s| {
                if *s != SyncState::Synchronizing {
                    return false;
                }
                *s = SyncState::Idle;
                true
            });
        }
        result
    }
}
