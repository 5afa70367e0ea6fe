//! Reconciliation walker
//!
//! Full comparison of the materialized part of the local tree against the
//! remote store, driven by an explicit worklist of folders. Offline folders
//! are never entered. Within a folder every missing placeholder is created
//! before any update or delete runs.
//!
//! Local changes the monitors failed to upload are retried here.
//!
//! The walk is idempotent: a second run with no external change performs no
//! mutation. Cancellation is checked between items; an interrupted folder
//! goes back on the worklist, which the report hands to the next run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use hydrasync_core::domain::{Item, ItemKind, RemoteDescriptor, SyncPath};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::inbound::{InboundOutcome, InboundSync};
use crate::outbound::{OutboundOutcome, OutboundSync};
use crate::SyncError;

/// Counts from one walker pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkReport {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Local changes the monitors missed, uploaded by this pass
    pub uploaded: u64,
    pub hydrated: u64,
    pub dehydrated: u64,
    pub conflicts: u64,
    pub errors: u64,
    pub folders_visited: u64,
    /// Folders left to visit when the pass was cancelled
    pub remaining: Vec<SyncPath>,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl WalkReport {
    /// True if the pass changed nothing locally
    pub fn is_noop(&self) -> bool {
        self.created == 0
            && self.updated == 0
            && self.deleted == 0
            && self.uploaded == 0
            && self.hydrated == 0
            && self.dehydrated == 0
            && self.conflicts == 0
    }

    fn record(&mut self, outcome: InboundOutcome) {
        match outcome {
            InboundOutcome::Created => self.created += 1,
            InboundOutcome::Updated => self.updated += 1,
            InboundOutcome::Deleted => self.deleted += 1,
            InboundOutcome::Hydrated => self.hydrated += 1,
            InboundOutcome::Dehydrated => self.dehydrated += 1,
            InboundOutcome::Conflicted => self.conflicts += 1,
            InboundOutcome::Unchanged | InboundOutcome::LocalPending | InboundOutcome::Skipped => {}
        }
    }
}

enum FolderPass {
    /// Online subfolders to visit next
    Done(Vec<SyncPath>),
    Interrupted,
}

pub struct ReconcileWalker {
    ctx: Arc<SyncContext>,
    inbound: InboundSync,
    outbound: Arc<OutboundSync>,
}

impl ReconcileWalker {
    pub fn new(ctx: Arc<SyncContext>, outbound: Arc<OutboundSync>) -> Self {
        Self {
            inbound: InboundSync::new(ctx.clone()),
            outbound,
            ctx,
        }
    }

    /// Walk the trees below `roots`
    ///
    /// Per-item failures are counted and logged; the walk continues.
    ///
    /// # Errors
    /// Only process-wide failures (e.g. `AuthenticationRequired`) abort
    /// the walk.
    #[tracing::instrument(skip(self, roots, cancel), fields(roots = roots.len()))]
    pub async fn walk(
        &self,
        roots: Vec<SyncPath>,
        cancel: &CancellationToken,
    ) -> Result<WalkReport, SyncError> {
        self.run(roots, cancel, true).await
    }

    /// Reconcile the direct children of each folder, without descending
    pub async fn sync_folders(
        &self,
        folders: Vec<SyncPath>,
        cancel: &CancellationToken,
    ) -> Result<WalkReport, SyncError> {
        self.run(folders, cancel, false).await
    }

    async fn run(
        &self,
        roots: Vec<SyncPath>,
        cancel: &CancellationToken,
        recursive: bool,
    ) -> Result<WalkReport, SyncError> {
        let started = Instant::now();
        let mut report = WalkReport::default();
        let mut worklist: VecDeque<SyncPath> = roots.into();
        info!(folders = worklist.len(), recursive, "Reconciliation pass started");

        while let Some(folder) = worklist.pop_front() {
            if cancel.is_cancelled() {
                worklist.push_front(folder);
                report.cancelled = true;
                break;
            }
            if !self.is_walkable(&folder).await {
                continue;
            }

            match self.reconcile_folder(&folder, &mut report, cancel).await {
                Ok(FolderPass::Done(subfolders)) => {
                    report.folders_visited += 1;
                    if recursive {
                        worklist.extend(subfolders);
                    }
                }
                Ok(FolderPass::Interrupted) => {
                    worklist.push_front(folder);
                    report.cancelled = true;
                    break;
                }
                Err(e) if e.is_process_wide() => return Err(e),
                Err(e) => {
                    report.errors += 1;
                    warn!(path = %folder, operation = "reconcile", error = %e, "Folder reconciliation failed");
                }
            }
        }

        report.remaining = worklist.into_iter().collect();
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            uploaded = report.uploaded,
            hydrated = report.hydrated,
            dehydrated = report.dehydrated,
            conflicts = report.conflicts,
            errors = report.errors,
            folders = report.folders_visited,
            cancelled = report.cancelled,
            duration_ms = report.duration_ms,
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    /// The sync root is always walked; other folders only once online
    async fn is_walkable(&self, folder: &SyncPath) -> bool {
        if folder == self.ctx.local_root() {
            return true;
        }
        match self.ctx.materializer.is_offline(folder).await {
            Ok(offline) => {
                if offline {
                    debug!(path = %folder, "Skipping offline folder");
                }
                !offline
            }
            Err(e) => {
                debug!(path = %folder, error = %e, "Folder no longer present");
                false
            }
        }
    }

    async fn reconcile_folder(
        &self,
        folder: &SyncPath,
        report: &mut WalkReport,
        cancel: &CancellationToken,
    ) -> Result<FolderPass, SyncError> {
        let locator = self.ctx.to_remote(folder, ItemKind::Folder)?;
        let remote_children = self.ctx.remote.list(&locator, None).await?;
        let remote_by_name: HashMap<&str, &RemoteDescriptor> = remote_children
            .iter()
            .filter(|d| !self.ctx.filter.is_excluded_name(&d.name))
            .map(|d| (d.name.as_str(), d))
            .collect();

        // creations first
        let present: HashSet<String> = self
            .ctx
            .materializer
            .list_children(folder)
            .await?
            .into_iter()
            .filter_map(|e| e.path.file_name().map(str::to_owned))
            .collect();
        let mut missing: Vec<&RemoteDescriptor> = remote_by_name
            .values()
            .filter(|d| !present.contains(&d.name))
            .copied()
            .collect();
        missing.sort_by(|a, b| a.name.cmp(&b.name));

        for descriptor in missing {
            if cancel.is_cancelled() {
                return Ok(FolderPass::Interrupted);
            }
            match self.inbound.materialize(folder, descriptor).await {
                Ok(_) => report.record(InboundOutcome::Created),
                Err(e) => self.item_failed(folder, &descriptor.name, "materialize", e, report)?,
            }
        }

        // then updates, deletions, pin evaluation
        let mut subfolders = Vec::new();
        for entry in self.ctx.materializer.list_children(folder).await? {
            if cancel.is_cancelled() {
                return Ok(FolderPass::Interrupted);
            }
            if self.ctx.filter.is_excluded(entry.path.as_path()) {
                continue;
            }
            let name = entry.path.file_name().unwrap_or_default().to_owned();
            let item = match self.ctx.item_from_entry(entry).await {
                Ok(item) => item,
                Err(e) => {
                    self.item_failed(folder, &name, "load", e, report)?;
                    continue;
                }
            };

            match self.reconcile_item(&item, remote_by_name.get(name.as_str()).copied(), report).await {
                Ok(true) => subfolders.push(item.path().clone()),
                Ok(false) => {}
                Err(e) => self.item_failed(folder, &name, "reconcile", e, report)?,
            }
        }
        subfolders.sort();
        Ok(FolderPass::Done(subfolders))
    }

    /// Bring one child in line with its remote; returns true if it is an
    /// online folder to visit next
    async fn reconcile_item(
        &self,
        item: &Item,
        remote: Option<&RemoteDescriptor>,
        report: &mut WalkReport,
    ) -> Result<bool, SyncError> {
        if item.state().is_conflicted() {
            if self
                .ctx
                .conflicts
                .adopt(item.path(), item.state().stored_fingerprint().cloned())
            {
                info!(path = %item.path(), "Adopted persisted conflict");
            }
            return Ok(false);
        }

        let Some(remote) = remote else {
            let outcome = self.inbound.remove_local(item).await?;
            report.record(outcome);
            if outcome == InboundOutcome::Skipped && item.state().stored_fingerprint().is_none() {
                self.upload(self.outbound.sync_created(item.path()).await?, report);
            }
            return Ok(false);
        };

        let outcome = self.inbound.pull(item, remote).await?;
        report.record(outcome);
        match outcome {
            InboundOutcome::Conflicted => return Ok(false),
            InboundOutcome::LocalPending => {
                self.upload(self.outbound.sync_updated(item.path()).await?, report);
            }
            _ => {}
        }

        let pinned = self.inbound.apply_pin(item).await?;
        if let Some(outcome) = pinned {
            report.record(outcome);
        }

        Ok(match item {
            Item::Folder(folder) => !folder.is_offline() || pinned == Some(InboundOutcome::Hydrated),
            Item::File(_) => false,
        })
    }

    fn upload(&self, outcome: OutboundOutcome, report: &mut WalkReport) {
        if matches!(outcome, OutboundOutcome::Created | OutboundOutcome::Updated) {
            report.uploaded += 1;
        }
    }

    fn item_failed(
        &self,
        folder: &SyncPath,
        name: &str,
        operation: &str,
        err: SyncError,
        report: &mut WalkReport,
    ) -> Result<(), SyncError> {
        if err.is_process_wide() {
            return Err(err);
        }
        if err.is_conflict() {
            report.conflicts += 1;
        } else {
            report.errors += 1;
        }
        warn!(path = %folder, name, operation, error = %err, "Item sync failed, left for next pass");
        Ok(())
    }
}
