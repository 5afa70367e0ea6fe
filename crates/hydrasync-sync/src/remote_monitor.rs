//! Remote change monitor
//!
//! Notifications only name the folders worth re-listing; each pass asks the
//! remote store for the current state of those folders instead of trusting
//! the payloads. At most one pass runs at a time. Notifications arriving
//! during a pass add to the pending scope and set a flag, and a single
//! follow-up pass covers all of them. Passes run through the engine's
//! [`Reconciler`], so they show up on the state stream like any other.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hydrasync_core::domain::{ItemKind, RemoteLocator, RemoteNotification, SyncPath};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::context::SyncContext;
use crate::reconciler::Reconciler;
use crate::SyncError;

pub struct RemoteMonitor {
    ctx: Arc<SyncContext>,
    reconciler: Reconciler,
    fatal: mpsc::UnboundedSender<SyncError>,
    cancel: CancellationToken,
    scope: Mutex<BTreeSet<SyncPath>>,
    running: AtomicBool,
    pending: AtomicBool,
    passes: AtomicU64,
}

impl RemoteMonitor {
    pub fn new(
        ctx: Arc<SyncContext>,
        reconciler: Reconciler,
        fatal: mpsc::UnboundedSender<SyncError>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            reconciler,
            fatal,
            cancel,
            scope: Mutex::new(BTreeSet::new()),
            running: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            passes: AtomicU64::new(0),
        }
    }

    /// Consume notifications until cancelled or the store closes the stream
    pub async fn run(self: Arc<Self>, mut notifications: mpsc::Receiver<RemoteNotification>) {
        info!("Remote change monitor started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = notifications.recv() => match next {
                    Some(notification) => self.notify(notification).await,
                    None => {
                        warn!("Remote change stream closed");
                        break;
                    }
                },
            }
        }
        info!(passes = self.pass_count(), "Remote change monitor stopped");
    }

    /// Accept one notification, starting a pass if none is running
    pub async fn notify(self: &Arc<Self>, notification: RemoteNotification) {
        let Some(scope) = self.scope_of(&notification).await else {
            return;
        };
        self.scope
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(scope);
        self.pending.store(true, Ordering::SeqCst);

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let monitor = Arc::clone(self);
            tokio::spawn(async move { monitor.drive().await });
        } else {
            trace!("Pass in flight, change coalesced");
        }
    }

    /// Number of passes run so far
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn drive(&self) {
        loop {
            while self.pending.swap(false, Ordering::SeqCst) {
                if self.cancel.is_cancelled() {
                    break;
                }
                let folders: Vec<SyncPath> = std::mem::take(
                    &mut *self.scope.lock().unwrap_or_else(|poisoned| poisoned.into_inner()),
                )
                .into_iter()
                .collect();
                if folders.is_empty() {
                    continue;
                }
                self.passes.fetch_add(1, Ordering::SeqCst);
                debug!(folders = folders.len(), "Remote-triggered pass");

                match self.reconciler.pass(folders, false, &self.cancel).await {
                    Ok(report) if report.cancelled => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "Remote-triggered pass aborted");
                        let _ = self.fatal.send(e);
                        break;
                    }
                }
            }

            self.running.store(false, Ordering::SeqCst);
            // a notification may have landed between the last swap and the store
            if self.cancel.is_cancelled()
                || !self.pending.load(Ordering::SeqCst)
                || self
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                break;
            }
        }
    }

    /// Local folders to re-list for a notification, or None to drop it
    async fn scope_of(&self, notification: &RemoteNotification) -> Option<Vec<SyncPath>> {
        if self.ctx.suppressor.is_own_remote_echo(notification.correlation) {
            trace!(locator = %notification.locator, "Dropped own remote echo");
            return None;
        }

        let mut folders = Vec::new();
        let locators = std::iter::once(&notification.locator).chain(notification.new_locator.iter());
        for locator in locators {
            if let Some(folder) = self.watched_parent(locator).await {
                folders.push(folder);
            }
        }
        if folders.is_empty() {
            debug!(
                kind = %notification.kind,
                locator = %notification.locator,
                "Dropped remote change outside materialized tree"
            );
            return None;
        }
        Some(folders)
    }

    /// Parent folder of `locator` if it is materialized and online
    async fn watched_parent(&self, locator: &RemoteLocator) -> Option<SyncPath> {
        let local = match self.ctx.mapper.to_local(locator) {
            Ok(local) => local,
            Err(e) => {
                debug!(locator = %locator, error = %e, "Unmappable remote locator");
                return None;
            }
        };
        if self.ctx.filter.is_excluded(local.as_path()) {
            return None;
        }
        let root = self.ctx.local_root();
        if &local == root {
            return Some(local);
        }
        let parent = local.parent()?;
        if &parent == root {
            return Some(parent);
        }
        match self.ctx.materializer.stat(&parent).await {
            Ok(Some(entry)) if entry.kind == ItemKind::Folder && entry.hydrated => Some(parent),
            Ok(_) => {
                trace!(path = %parent, "Parent folder not materialized or offline");
                None
            }
            Err(e) => {
                debug!(path = %parent, error = %e, "Cannot stat parent folder");
                None
            }
        }
    }
}
