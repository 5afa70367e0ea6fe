//! Local to remote sync actions
//!
//! Every remote write runs under outbound suppression and carries the
//! suppressor's [`OperationId`](hydrasync_core::domain::OperationId), so the
//! notification it causes is recognized as our own. Updates are guarded by
//! the stored fingerprint; a mismatch flags the item and nothing is written.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use hydrasync_conflict::{fingerprint::resolve_written, ConflictDetector, ConflictError};
use hydrasync_core::domain::{
    ChangeEvent, ChangeKind, Conflict, ConflictReason, Fingerprint, Item, ItemKind, ItemMetadata,
    LocalEntry, PlaceholderBlob, RemoteLocator, SyncPath,
};
use hydrasync_core::ports::RemoteStoreError;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::suppressor::Direction;
use crate::SyncError;

/// What an outbound action did to the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundOutcome {
    Created,
    Updated,
    Deleted,
    Moved,
    Conflicted,
    Unchanged,
    Skipped,
}

pub struct OutboundSync {
    ctx: Arc<SyncContext>,
}

impl OutboundSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Route a settled local change to its action
    pub async fn dispatch(&self, event: &ChangeEvent) -> Result<OutboundOutcome, SyncError> {
        let root = self.ctx.local_root();
        let path = SyncPath::new_within_root(event.path.clone(), root)?;
        match event.kind {
            ChangeKind::Created => self.sync_created(&path).await,
            ChangeKind::Updated => self.sync_updated(&path).await,
            ChangeKind::Deleted => self.sync_deleted(&path).await,
            ChangeKind::Moved => {
                let to = event
                    .new_path
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("move event without destination"))?;
                let to = SyncPath::new_within_root(to, root)?;
                self.sync_moved(&path, &to).await
            }
        }
    }

    /// Upload a new local item; folders are uploaded with their content
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn sync_created(&self, path: &SyncPath) -> Result<OutboundOutcome, SyncError> {
        let mut outcome = OutboundOutcome::Skipped;
        let mut queue = VecDeque::from([path.clone()]);
        let mut first = true;

        while let Some(current) = queue.pop_front() {
            let _item_lock = self.ctx.path_locks.lock(&current).await;
            let Some((entry, item)) = self.load(&current).await? else {
                continue;
            };
            let result = if item.state().stored_fingerprint().is_some() {
                self.update_locked(&entry, &item).await?
            } else {
                self.create_locked(&entry, &item).await?
            };
            if first {
                outcome = result;
                first = false;
            }

            if entry.kind == ItemKind::Folder && result == OutboundOutcome::Created {
                for child in self.ctx.materializer.list_children(&current).await? {
                    if !self.ctx.filter.is_excluded(child.path.as_path()) {
                        queue.push_back(child.path);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Upload changed content of a synced item
    ///
    /// # Errors
    /// `SyncError::Conflict` when the remote changed since the last sync;
    /// the item is flagged and the remote is left untouched.
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn sync_updated(&self, path: &SyncPath) -> Result<OutboundOutcome, SyncError> {
        let _item_lock = self.ctx.path_locks.lock(path).await;
        let Some((entry, item)) = self.load(path).await? else {
            return Ok(OutboundOutcome::Skipped);
        };
        if item.state().stored_fingerprint().is_none() {
            return self.create_locked(&entry, &item).await;
        }
        self.update_locked(&entry, &item).await
    }

    /// Propagate a local delete
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn sync_deleted(&self, path: &SyncPath) -> Result<OutboundOutcome, SyncError> {
        let _item_lock = self.ctx.path_locks.lock(path).await;

        if self.ctx.materializer.stat(path).await?.is_some() {
            debug!("Item exists again, nothing to delete");
            return Ok(OutboundOutcome::Skipped);
        }
        if let Some(conflict) = self.ctx.conflicts.forget(path) {
            // the remote holds changes the user never saw
            info!(reason = %conflict.reason(), "Conflicted item deleted locally, keeping remote");
            return Ok(OutboundOutcome::Skipped);
        }

        for kind in [ItemKind::File, ItemKind::Folder] {
            let locator = self.ctx.to_remote(path, kind)?;
            let (remote, loc) = (&self.ctx.remote, &locator);
            let result = self
                .ctx
                .suppressor
                .with_suppressed(Direction::Outbound, &[], move |op| remote.delete(loc, op))
                .await;
            match result {
                Ok(()) => {
                    debug!(locator = %locator, "Remote item deleted");
                    return Ok(OutboundOutcome::Deleted);
                }
                Err(RemoteStoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        debug!("Remote item already gone");
        Ok(OutboundOutcome::Unchanged)
    }

    /// Propagate a local rename or move
    ///
    /// Saving through a temporary name shows up as a move from an excluded
    /// name, which is an update of the destination. A move to an excluded
    /// name is a delete. The item keeps its synchronized flag only if the
    /// remote move succeeds.
    #[tracing::instrument(skip(self), fields(from = %from, to = %to))]
    pub async fn sync_moved(&self, from: &SyncPath, to: &SyncPath) -> Result<OutboundOutcome, SyncError> {
        let filter = &self.ctx.filter;
        match (filter.is_excluded(from.as_path()), filter.is_excluded(to.as_path())) {
            (true, true) => return Ok(OutboundOutcome::Skipped),
            (false, true) => return self.sync_deleted(from).await,
            (true, false) => return self.sync_updated(to).await,
            (false, false) => {}
        }
        if from == to {
            return self.sync_updated(to).await;
        }

        let (_first, _second) = if from < to {
            (self.ctx.path_locks.lock(from).await, self.ctx.path_locks.lock(to).await)
        } else {
            let second = self.ctx.path_locks.lock(to).await;
            (self.ctx.path_locks.lock(from).await, second)
        };

        let Some((entry, item)) = self.load(to).await? else {
            return Ok(OutboundOutcome::Skipped);
        };
        if item.state().is_conflicted() {
            return Ok(OutboundOutcome::Skipped);
        }
        if item.state().stored_fingerprint().is_none() {
            return self.create_locked(&entry, &item).await;
        }

        let from_loc = self.ctx.to_remote(from, entry.kind)?;
        let to_loc = self.ctx.to_remote(to, entry.kind)?;
        let (remote, src, dst) = (&self.ctx.remote, &from_loc, &to_loc);
        let result = self
            .ctx
            .suppressor
            .with_suppressed(Direction::Outbound, &[], move |op| remote.move_item(src, dst, op))
            .await;

        if let Err(e) = result {
            warn!(path = %to, operation = "move", error = %e, "Remote move failed");
            self.ctx.materializer.set_in_sync(to, false).await?;
            return Err(e.into());
        }

        let original = self.original_path(to)?;
        self.ctx
            .fingerprints
            .update_blob(to, |blob| blob.original_path = original)
            .await?;
        self.ctx.conflicts.forget(from);

        if item.as_movable().keeps_sync_on_move() {
            self.ctx.materializer.set_in_sync(to, true).await?;
        } else if entry.kind == ItemKind::File {
            // content changed before the move settled
            let (entry, item) = self
                .load(to)
                .await?
                .ok_or_else(|| SyncError::NotFound(to.to_string()))?;
            self.update_locked(&entry, &item).await?;
        }
        debug!(from = %from_loc, to = %to_loc, "Remote item moved");
        Ok(OutboundOutcome::Moved)
    }

    async fn load(&self, path: &SyncPath) -> Result<Option<(LocalEntry, Item)>, SyncError> {
        match self.ctx.materializer.stat(path).await? {
            Some(entry) => {
                let item = self.ctx.item_from_entry(entry.clone()).await?;
                Ok(Some((entry, item)))
            }
            None => Ok(None),
        }
    }

    /// Create the remote item; the caller holds the item's path lock
    async fn create_locked(&self, entry: &LocalEntry, item: &Item) -> Result<OutboundOutcome, SyncError> {
        let path = item.path();
        if item.state().is_conflicted() {
            return Ok(OutboundOutcome::Skipped);
        }

        let locator = self.ctx.to_remote(path, entry.kind)?;
        let metadata = metadata_of(entry);
        let content = match entry.kind {
            ItemKind::File => Some(self.ctx.materializer.read_content(path).await?),
            ItemKind::Folder => None,
        };

        let remote = &self.ctx.remote;
        let (loc, meta, body) = (&locator, &metadata, content.as_deref());
        let result = self
            .ctx
            .suppressor
            .with_suppressed(Direction::Outbound, &[], move |op| remote.create(loc, meta, body, op))
            .await;

        let returned = match result {
            Ok(returned) => returned,
            Err(RemoteStoreError::PreconditionFailed { actual, .. }) => {
                info!(path = %path, "Remote item already exists, flagging conflict");
                self.ctx
                    .flag_conflict(Conflict::new(
                        path.clone(),
                        ConflictReason::RemoteModified,
                        None,
                        actual,
                    ))
                    .await;
                return Err(SyncError::Conflict(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let fingerprint = self.written_fingerprint(&locator, returned).await?;
        self.mark_synced(entry, item, fingerprint.clone()).await?;
        info!(path = %path, fingerprint = %fingerprint, "Created remote item");
        Ok(OutboundOutcome::Created)
    }

    /// Upload content over an existing remote file; the caller holds the
    /// item's path lock
    async fn update_locked(&self, entry: &LocalEntry, item: &Item) -> Result<OutboundOutcome, SyncError> {
        let path = item.path();
        if item.state().is_conflicted() {
            debug!(path = %path, "Item conflicted, skipping upload");
            return Ok(OutboundOutcome::Skipped);
        }
        if entry.kind == ItemKind::Folder || item.state().is_synchronized() {
            debug!(path = %path, "Nothing to upload");
            return Ok(OutboundOutcome::Unchanged);
        }

        let locator = self.ctx.to_remote(path, entry.kind)?;
        let remote_now = match self.ctx.remote.get(&locator).await {
            Ok(descriptor) => descriptor,
            Err(RemoteStoreError::NotFound(_)) => {
                self.ctx
                    .flag_conflict(Conflict::new(
                        path.clone(),
                        ConflictReason::RemoteDeleted,
                        item.state().stored_fingerprint().cloned(),
                        None,
                    ))
                    .await;
                return Err(SyncError::Conflict(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.ctx.detector.check_local_update(path, &remote_now).await {
            if let Some(conflict) = ConflictDetector::conflict_from_error(&e) {
                self.ctx.flag_conflict(conflict).await;
            }
            return Err(e.into());
        }
        let expected = remote_now.effective_fingerprint();

        let content = self.ctx.materializer.read_content(path).await?;
        let metadata = metadata_of(entry);
        let remote = &self.ctx.remote;
        let (loc, meta, body, exp) = (&locator, &metadata, content.as_slice(), &expected);
        let result = self
            .ctx
            .suppressor
            .with_suppressed(Direction::Outbound, &[], move |op| {
                remote.write(loc, body, meta, Some(exp), op)
            })
            .await;

        let returned = match result {
            Ok(returned) => returned,
            Err(RemoteStoreError::PreconditionFailed { actual, .. }) => {
                // lost the race against a remote writer
                let err = ConflictError::RemoteModified {
                    path: path.clone(),
                    stored: Some(expected),
                    remote: actual,
                };
                if let Some(conflict) = ConflictDetector::conflict_from_error(&err) {
                    self.ctx.flag_conflict(conflict).await;
                }
                return Err(err.into());
            }
            Err(e) => return Err(e.into()),
        };

        let fingerprint = self.written_fingerprint(&locator, returned).await?;
        self.mark_synced(entry, item, fingerprint.clone()).await?;
        info!(path = %path, fingerprint = %fingerprint, "Uploaded local changes");
        Ok(OutboundOutcome::Updated)
    }

    /// Fingerprint of what was just written
    ///
    /// Falls back to the remote's metadata when the store returned none.
    ///
    /// # Errors
    /// Fails if that metadata cannot be read; the item then stays
    /// unsynchronized.
    async fn written_fingerprint(
        &self,
        locator: &RemoteLocator,
        returned: Option<Fingerprint>,
    ) -> Result<Fingerprint, SyncError> {
        if let Some(fp) = returned {
            return Ok(fp);
        }
        let descriptor = self.ctx.remote.get(locator).await.map_err(|e| {
            warn!(locator = %locator, error = %e, "Written item has no readable fingerprint");
            e
        })?;
        Ok(resolve_written(descriptor.fingerprint, descriptor.modified_at))
    }

    /// Record the new base fingerprint and mark the item synchronized
    async fn mark_synced(
        &self,
        entry: &LocalEntry,
        item: &Item,
        fingerprint: Fingerprint,
    ) -> Result<(), SyncError> {
        let path = item.path();
        if entry.is_placeholder {
            self.ctx.fingerprints.set_fingerprint(path, fingerprint).await?;
            self.ctx.materializer.set_in_sync(path, true).await?;
            return Ok(());
        }

        let blob = PlaceholderBlob::new(self.original_path(path)?).with_fingerprint(fingerprint);
        let bytes = blob.encode().map_err(anyhow::Error::from)?;
        let materializer = &*self.ctx.materializer;
        self.ctx
            .suppressor
            .with_suppressed(Direction::Inbound, std::slice::from_ref(path), move |_| async move {
                materializer.convert_to_placeholder(path, &bytes).await?;
                materializer.set_in_sync(path, true).await
            })
            .await?;
        Ok(())
    }

    fn original_path(&self, path: &SyncPath) -> Result<String, SyncError> {
        let relative = path.relative_to(self.ctx.local_root())?;
        Ok(format!("/{}", relative.display()))
    }
}

fn metadata_of(entry: &LocalEntry) -> ItemMetadata {
    let modified = entry.modified_at.unwrap_or_else(Utc::now);
    ItemMetadata {
        kind: entry.kind,
        size: entry.size,
        created_at: modified,
        modified_at: modified,
        attributes: Default::default(),
    }
}
