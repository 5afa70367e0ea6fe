//! Remote lock coordination
//!
//! Per item: `Unlocked -> AutoLocked` when a write handle opens with
//! autolock enabled, back to `Unlocked` when the last such handle closes;
//! `Unlocked -> ManualLocked` on an explicit lock, back on explicit unlock.
//! Acquired records are persisted in the placeholder blob. Releasing always
//! clears the local record, whatever the remote unlock returns.
//!
//! Write handles opened or closed while the remote lock call is in flight
//! are counted against the pending lock.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hydrasync_core::domain::{ItemKind, LockMode, LockRecord, Lockable, SyncPath};
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::SyncError;

#[derive(Debug, Clone)]
enum LockState {
    /// A remote lock call is in progress for this item
    Acquiring { handles: usize },
    AutoLocked { handles: usize, record: LockRecord },
    ManualLocked { record: LockRecord },
}

pub struct LockCoordinator {
    ctx: Arc<SyncContext>,
    autolock: bool,
    timeout: Duration,
    states: DashMap<SyncPath, LockState>,
}

impl LockCoordinator {
    pub fn new(ctx: Arc<SyncContext>, autolock: bool, timeout: Duration) -> Self {
        Self {
            ctx,
            autolock,
            timeout,
            states: DashMap::new(),
        }
    }

    /// Lock mode currently held on `path`
    pub fn mode(&self, path: &SyncPath) -> LockMode {
        match self.states.get(path).as_deref() {
            Some(LockState::AutoLocked { .. }) => LockMode::Auto,
            Some(LockState::ManualLocked { .. }) => LockMode::Manual,
            Some(LockState::Acquiring { .. }) | None => LockMode::None,
        }
    }

    /// A handle on `path` was opened
    ///
    /// With autolock enabled and a write handle on a synchronized file, the
    /// first handle acquires the remote lock. Contention is reported as
    /// `ClientLockFailed`; the caller proceeds unlocked.
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn on_handle_opened(&self, path: &SyncPath, write: bool) -> Result<(), SyncError> {
        if !write || !self.autolock {
            return Ok(());
        }

        match self.states.entry(path.clone()) {
            Entry::Occupied(mut entry) => {
                return match entry.get_mut() {
                    LockState::AutoLocked { handles, .. } => {
                        *handles += 1;
                        debug!(handles = *handles, "Write handle joined auto lock");
                        Ok(())
                    }
                    LockState::ManualLocked { .. } => Ok(()),
                    LockState::Acquiring { handles } => {
                        *handles += 1;
                        debug!(handles = *handles, "Write handle joined pending lock");
                        Ok(())
                    }
                };
            }
            Entry::Vacant(entry) => {
                entry.insert(LockState::Acquiring { handles: 1 });
            }
        }

        let outcome = self.acquire_for_handle(path).await;
        match outcome {
            Ok(Some(record)) => {
                info!(owner = %record.owner(), "Auto lock acquired");
                if self.settle_acquired(path, record.clone()) == 0 {
                    self.release(path, &record).await?;
                    info!("Write handles closed during acquisition, auto lock released");
                }
                Ok(())
            }
            Ok(None) => {
                self.states.remove(path);
                Ok(())
            }
            Err(e) => {
                self.states.remove(path);
                Err(e)
            }
        }
    }

    /// A handle on `path` was closed; the last write handle releases an
    /// auto lock
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn on_handle_closed(&self, path: &SyncPath, write: bool) -> Result<(), SyncError> {
        if !write {
            return Ok(());
        }

        let release = match self.states.get_mut(path) {
            Some(mut state) => match &mut *state {
                LockState::AutoLocked { handles, record } => {
                    *handles = handles.saturating_sub(1);
                    (*handles == 0).then(|| record.clone())
                }
                LockState::Acquiring { handles } => {
                    *handles = handles.saturating_sub(1);
                    None
                }
                LockState::ManualLocked { .. } => None,
            },
            None => None,
        };

        if let Some(record) = release {
            self.states.remove(path);
            self.release(path, &record).await?;
            info!("Auto lock released");
        }
        Ok(())
    }

    /// Explicitly lock a file until [`LockCoordinator::unlock`]
    ///
    /// Locking an auto-locked file turns the lock manual, so closing its
    /// handles no longer releases it.
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn lock(&self, path: &SyncPath) -> Result<LockRecord, SyncError> {
        let promoted = match self.states.entry(path.clone()) {
            Entry::Occupied(mut entry) => {
                let record = match entry.get() {
                    LockState::ManualLocked { record } => return Ok(record.clone()),
                    LockState::AutoLocked { record, .. } => record.clone().with_mode(LockMode::Manual),
                    LockState::Acquiring { .. } => {
                        return Err(contended(path, "lock acquisition in progress"))
                    }
                };
                entry.insert(LockState::ManualLocked {
                    record: record.clone(),
                });
                Some(record)
            }
            Entry::Vacant(entry) => {
                entry.insert(LockState::Acquiring { handles: 0 });
                None
            }
        };
        if let Some(record) = promoted {
            self.persist(path, Some(record.clone())).await?;
            return Ok(record);
        }

        match self.acquire_manual(path).await {
            Ok(record) => {
                info!(owner = %record.owner(), "Manual lock acquired");
                self.states.insert(
                    path.clone(),
                    LockState::ManualLocked {
                        record: record.clone(),
                    },
                );
                Ok(record)
            }
            Err(e) => {
                self.states.remove(path);
                Err(e)
            }
        }
    }

    /// Release a lock held on `path`, including one persisted by an earlier
    /// run
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn unlock(&self, path: &SyncPath) -> Result<(), SyncError> {
        let held = match self.states.get(path).as_deref() {
            Some(LockState::Acquiring { .. }) => {
                return Err(contended(path, "lock acquisition in progress"))
            }
            Some(LockState::AutoLocked { record, .. }) | Some(LockState::ManualLocked { record }) => {
                Some(record.clone())
            }
            None => None,
        };

        let record = match held {
            Some(record) => {
                self.states.remove(path);
                record
            }
            None => {
                let blob = self.ctx.fingerprints.load_blob(path).await?;
                match blob.lock {
                    Some(record) => record,
                    None => {
                        debug!("Nothing to unlock");
                        return Ok(());
                    }
                }
            }
        };

        self.release(path, &record).await?;
        info!("Lock released");
        Ok(())
    }

    /// Turn the pending entry into an auto lock held by the write handles
    /// counted meanwhile; returns that count, leaving no entry when it is 0
    fn settle_acquired(&self, path: &SyncPath, record: LockRecord) -> usize {
        match self.states.entry(path.clone()) {
            Entry::Occupied(mut entry) => {
                let handles = match entry.get() {
                    LockState::Acquiring { handles } => *handles,
                    _ => 1,
                };
                if handles == 0 {
                    entry.remove();
                } else {
                    entry.insert(LockState::AutoLocked { handles, record });
                }
                handles
            }
            Entry::Vacant(_) => 0,
        }
    }

    /// Remote lock for a newly opened write handle
    ///
    /// Returns None when there is nothing to lock: the item is missing, a
    /// folder, or was never uploaded.
    async fn acquire_for_handle(&self, path: &SyncPath) -> Result<Option<LockRecord>, SyncError> {
        let Some(item) = self.ctx.load_item(path).await? else {
            return Ok(None);
        };
        let Some(lockable) = item.as_lockable() else {
            return Ok(None);
        };
        if item.state().is_new() {
            debug!("Item not uploaded yet, skipping auto lock");
            return Ok(None);
        }
        if let Some(existing) = lockable.lock_record() {
            if existing.mode() == LockMode::Auto {
                // left over from an earlier run; take it over
                debug!("Adopting persisted auto lock");
                return Ok(Some(existing.clone()));
            }
            return Err(contended(path, "already locked manually"));
        }

        let record = self.remote_lock(path).await?.with_mode(LockMode::Auto);
        self.persist_or_release(path, record).await.map(Some)
    }

    async fn acquire_manual(&self, path: &SyncPath) -> Result<LockRecord, SyncError> {
        let item = self
            .ctx
            .load_item(path)
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?;
        let Some(lockable) = item.as_lockable() else {
            return Err(contended(path, "folders cannot be locked"));
        };
        if let Some(existing) = lockable.lock_record() {
            let record = existing.clone().with_mode(LockMode::Manual);
            self.persist(path, Some(record.clone())).await?;
            return Ok(record);
        }

        let record = self.remote_lock(path).await?.with_mode(LockMode::Manual);
        self.persist_or_release(path, record).await
    }

    async fn remote_lock(&self, path: &SyncPath) -> Result<LockRecord, SyncError> {
        let locator = self.ctx.to_remote(path, ItemKind::File)?;
        match tokio::time::timeout(self.timeout, self.ctx.remote.lock(&locator)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(contended(path, "remote lock timed out")),
        }
    }

    /// Persist a fresh record, giving the remote lock back if that fails
    async fn persist_or_release(
        &self,
        path: &SyncPath,
        record: LockRecord,
    ) -> Result<LockRecord, SyncError> {
        if let Err(e) = self.persist(path, Some(record.clone())).await {
            if let Err(unlock_err) = self.remote_unlock(path, &record).await {
                warn!(error = %unlock_err, "Failed to give back lock after persist failure");
            }
            return Err(e);
        }
        Ok(record)
    }

    async fn release(&self, path: &SyncPath, record: &LockRecord) -> Result<(), SyncError> {
        if let Err(e) = self.remote_unlock(path, record).await {
            warn!(path = %path, operation = "unlock", error = %e, "Remote unlock failed");
        }
        self.persist(path, None).await
    }

    async fn remote_unlock(&self, path: &SyncPath, record: &LockRecord) -> Result<(), SyncError> {
        let locator = self.ctx.to_remote(path, ItemKind::File)?;
        match tokio::time::timeout(self.timeout, self.ctx.remote.unlock(&locator, record.token())).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::RemoteUnavailable("remote unlock timed out".into())),
        }
    }

    async fn persist(&self, path: &SyncPath, record: Option<LockRecord>) -> Result<(), SyncError> {
        self.ctx
            .fingerprints
            .update_blob(path, |blob| blob.lock = record)
            .await?;
        Ok(())
    }
}

fn contended(path: &SyncPath, reason: &str) -> SyncError {
    SyncError::ClientLockFailed {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
