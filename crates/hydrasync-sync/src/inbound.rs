//! Remote to local sync actions
//!
//! All local mutations run under inbound suppression so the local monitor
//! does not send them back to the remote store.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use hydrasync_conflict::{ConflictDetector, DetectionResult};
use hydrasync_core::domain::{
    ByteRange, Conflict, ConflictReason, DeleteScope, Item, PinState, PlaceholderBlob,
    RemoteDescriptor, SyncPath,
};
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::suppressor::Direction;
use crate::SyncError;

/// What an inbound action did to the local item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Created,
    Updated,
    Deleted,
    Hydrated,
    Dehydrated,
    Conflicted,
    Unchanged,
    /// Remote unchanged, local edits still waiting for upload
    LocalPending,
    Skipped,
}

pub struct InboundSync {
    ctx: Arc<SyncContext>,
}

impl InboundSync {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Create a placeholder for a remote child absent locally
    #[tracing::instrument(skip(self, remote), fields(name = %remote.name))]
    pub async fn materialize(
        &self,
        parent: &SyncPath,
        remote: &RemoteDescriptor,
    ) -> Result<SyncPath, SyncError> {
        let target = parent.join(&remote.name)?;
        let _item_lock = self.ctx.path_locks.lock(&target).await;

        let blob = PlaceholderBlob::new(self.original_path(&target)?)
            .with_fingerprint(remote.effective_fingerprint());
        let bytes = blob.encode().map_err(anyhow::Error::from)?;

        let materializer = self.ctx.materializer.clone();
        let created = self
            .ctx
            .suppressor
            .with_suppressed(Direction::Inbound, std::slice::from_ref(&target), move |_| async move {
                let created = materializer.create_placeholder(parent, remote, &bytes).await?;
                materializer.set_in_sync(&created, true).await?;
                anyhow::Ok(created)
            })
            .await?;

        debug!(path = %created, fingerprint = %remote.effective_fingerprint(), "Placeholder created");
        Ok(created)
    }

    /// Bring a local item up to date with its remote
    ///
    /// Unsynced local edits are never overwritten: the item is flagged
    /// conflicted instead. `listed` only names the item; the decision is
    /// made on its state as read under the path lock.
    #[tracing::instrument(skip(self, listed, remote), fields(path = %listed.path()))]
    pub async fn pull(&self, listed: &Item, remote: &RemoteDescriptor) -> Result<InboundOutcome, SyncError> {
        let path = listed.path().clone();
        let _item_lock = self.ctx.path_locks.lock(&path).await;
        let Some(item) = self.reload(&path).await? else {
            return Ok(InboundOutcome::Skipped);
        };

        if item.kind() != remote.kind {
            warn!(local = ?item.kind(), remote = ?remote.kind, "Item kind differs on each side, skipping");
            return Ok(InboundOutcome::Skipped);
        }

        match ConflictDetector::check_remote_update(&item, remote) {
            DetectionResult::Unchanged if !item.state().is_synchronized() => {
                return Ok(InboundOutcome::LocalPending)
            }
            DetectionResult::Unchanged => return Ok(InboundOutcome::Unchanged),
            DetectionResult::Conflicted(conflict) => {
                self.ctx.flag_conflict(*conflict).await;
                return Ok(InboundOutcome::Conflicted);
            }
            DetectionResult::NoConflict => {}
        }

        let content = match &item {
            Item::File(file) if file.is_hydrated() => {
                let locator = self.ctx.to_remote(&path, remote.kind)?;
                Some(self.ctx.remote.read(&locator, ByteRange::FULL).await?)
            }
            _ => None,
        };

        let fingerprint = remote.effective_fingerprint();
        let ctx = &*self.ctx;
        let (target, body, fp) = (&path, content.as_deref(), fingerprint.clone());
        ctx.suppressor
            .with_suppressed(Direction::Inbound, std::slice::from_ref(&path), move |_| async move {
                ctx.materializer.update_placeholder(target, remote, body).await?;
                ctx.fingerprints.set_fingerprint(target, fp).await?;
                ctx.materializer.set_in_sync(target, true).await?;
                Ok::<_, SyncError>(())
            })
            .await?;

        debug!(fingerprint = %fingerprint, hydrated = content.is_some(), "Pulled remote change");
        Ok(InboundOutcome::Updated)
    }

    /// Handle a local item whose remote no longer exists
    ///
    /// Synchronized items are deleted. An item that was synced once but has
    /// local edits is flagged; one that was never uploaded is left for the
    /// local monitor. Folders are emptied children first, and a folder that
    /// still holds unsynced descendants is kept.
    #[tracing::instrument(skip(self, item), fields(path = %item.path()))]
    pub async fn remove_local(&self, item: &Item) -> Result<InboundOutcome, SyncError> {
        if item.as_deletable().delete_scope() == DeleteScope::Single {
            return self.remove_single(item).await;
        }

        let mut order = Vec::new();
        let mut queue = VecDeque::from([item.clone()]);
        while let Some(current) = queue.pop_front() {
            if let Item::Folder(_) = current {
                for entry in self.ctx.materializer.list_children(current.path()).await? {
                    queue.push_back(self.ctx.item_from_entry(entry).await?);
                }
            }
            order.push(current);
        }

        let mut kept: HashSet<SyncPath> = HashSet::new();
        let mut outcome = InboundOutcome::Skipped;
        for current in order.iter().rev() {
            outcome = if kept.contains(current.path()) {
                InboundOutcome::Skipped
            } else {
                self.remove_single(current).await?
            };
            if !matches!(outcome, InboundOutcome::Deleted | InboundOutcome::Unchanged) {
                if let Some(parent) = current.path().parent() {
                    kept.insert(parent);
                }
            }
        }
        if outcome != InboundOutcome::Deleted {
            info!("Remote folder deleted, keeping local folder with unsynced content");
        }
        Ok(outcome)
    }

    /// Returns `Unchanged` if the item is already gone
    async fn remove_single(&self, listed: &Item) -> Result<InboundOutcome, SyncError> {
        let path = listed.path().clone();
        let _item_lock = self.ctx.path_locks.lock(&path).await;
        let Some(item) = self.ctx.load_item(&path).await? else {
            return Ok(InboundOutcome::Unchanged);
        };
        let state = item.state();

        if item.as_deletable().may_delete_from_remote() {
            let ctx = &*self.ctx;
            let target = &path;
            ctx.suppressor
                .with_suppressed(Direction::Inbound, std::slice::from_ref(&path), move |_| {
                    ctx.materializer.delete(target)
                })
                .await?;
            ctx.conflicts.forget(&path);
            debug!(path = %path, "Deleted local item removed remotely");
            return Ok(InboundOutcome::Deleted);
        }

        if state.is_conflicted() {
            return Ok(InboundOutcome::Skipped);
        }

        match state.stored_fingerprint() {
            Some(stored) => {
                self.ctx
                    .flag_conflict(Conflict::new(
                        path.clone(),
                        ConflictReason::RemoteDeleted,
                        Some(stored.clone()),
                        None,
                    ))
                    .await;
                Ok(InboundOutcome::Conflicted)
            }
            None => {
                debug!(path = %path, "Local item never uploaded, leaving in place");
                Ok(InboundOutcome::Skipped)
            }
        }
    }

    /// Hydrate or dehydrate according to the item's pin state
    #[tracing::instrument(skip(self, listed), fields(path = %listed.path()))]
    pub async fn apply_pin(&self, listed: &Item) -> Result<Option<InboundOutcome>, SyncError> {
        let path = listed.path().clone();
        let _item_lock = self.ctx.path_locks.lock(&path).await;
        let Some(item) = self.reload(&path).await? else {
            return Ok(None);
        };
        let pin = self.ctx.materializer.pin_state(&path).await?;

        let action = match (&item, pin) {
            (Item::File(file), PinState::Pinned) if !file.is_hydrated() => InboundOutcome::Hydrated,
            (Item::Folder(folder), PinState::Pinned) if folder.is_offline() => {
                InboundOutcome::Hydrated
            }
            (Item::File(file), PinState::Unpinned)
                if file.is_hydrated() && item.state().is_synchronized() =>
            {
                InboundOutcome::Dehydrated
            }
            _ => return Ok(None),
        };

        let materializer = &*self.ctx.materializer;
        let target = &path;
        self.ctx
            .suppressor
            .with_suppressed(Direction::Inbound, std::slice::from_ref(&path), move |_| async move {
                match action {
                    InboundOutcome::Hydrated => materializer.hydrate(target, ByteRange::FULL).await,
                    _ => materializer.dehydrate(target, ByteRange::FULL).await,
                }
            })
            .await?;

        debug!(?pin, ?action, "Applied pin state");
        Ok(Some(action))
    }

    /// Current state of an item the caller holds the path lock for
    ///
    /// None if it disappeared or was flagged since it was listed.
    async fn reload(&self, path: &SyncPath) -> Result<Option<Item>, SyncError> {
        match self.ctx.load_item(path).await? {
            Some(item) if item.state().is_conflicted() => {
                debug!(path = %path, "Item conflicted since it was listed, skipping");
                Ok(None)
            }
            Some(item) => Ok(Some(item)),
            None => {
                debug!(path = %path, "Item disappeared since it was listed, skipping");
                Ok(None)
            }
        }
    }

    /// Sync-root-relative path recorded in the blob
    fn original_path(&self, path: &SyncPath) -> Result<String, SyncError> {
        let relative = path.relative_to(self.ctx.local_root())?;
        Ok(format!("/{}", relative.display()))
    }
}
