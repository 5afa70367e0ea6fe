//! Sync engine
//!
//! The [`SyncEngine`] wires the components of one sync root together and
//! runs them as independent tasks:
//!
//! 1. **Local monitor**: watcher events to outbound actions
//! 2. **Remote monitor**: store notifications to coalesced folder passes
//! 3. **Reconciliation**: a periodic full walk, also run on demand
//!
//! A process-wide failure (expired session) cancels the running cycle and
//! moves the engine to [`SyncState::Disabled`] until `start_sync` is called
//! again. Without a change subscription the remote side is polled by running
//! the walk at the poll interval.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use hydrasync_core::config::Config;
use hydrasync_core::domain::{ChangeEvent, Conflict, ItemKind, LockRecord, LockMode, SyncPath};
use hydrasync_core::ports::{IMaterializer, IRemoteStore, RemoteStoreError};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::SyncContext;
use crate::local_monitor::{LocalMonitor, DEFAULT_DEBOUNCE};
use crate::locks::LockCoordinator;
use crate::outbound::{OutboundOutcome, OutboundSync};
use crate::reconciler::Reconciler;
use crate::remote_monitor::RemoteMonitor;
use crate::walker::{ReconcileWalker, WalkReport};
use crate::SyncError;

/// Engine lifecycle as published on [`SyncEngine::subscribe_state`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Running, no pass started yet
    Enabled,
    /// A reconciliation pass is running
    Synchronizing,
    /// Running, waiting for changes
    Idle,
    /// Stopped, or paused by a process-wide failure
    Disabled,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Enabled => "enabled",
            SyncState::Synchronizing => "synchronizing",
            SyncState::Idle => "idle",
            SyncState::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

struct Cycle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_task: Option<JoinHandle<mpsc::Receiver<ChangeEvent>>>,
    remote_monitor: Option<Arc<RemoteMonitor>>,
}

pub struct SyncEngine {
    ctx: Arc<SyncContext>,
    outbound: Arc<OutboundSync>,
    reconciler: Reconciler,
    locks: LockCoordinator,
    reconcile_interval: Duration,
    poll_interval: Duration,
    debounce: Duration,
    trigger: Arc<Notify>,
    local_events: StdMutex<Option<mpsc::Receiver<ChangeEvent>>>,
    cycle: Mutex<Option<Cycle>>,
}

impl SyncEngine {
    pub fn new(
        config: &Config,
        remote: Arc<dyn IRemoteStore>,
        materializer: Arc<dyn IMaterializer>,
    ) -> Result<Self, SyncError> {
        let ctx = Arc::new(SyncContext::new(config, remote, materializer)?);
        let outbound = Arc::new(OutboundSync::new(ctx.clone()));
        let walker = Arc::new(ReconcileWalker::new(ctx.clone(), outbound.clone()));

        info!(
            local_root = %ctx.local_root(),
            remote_root = %ctx.mapper.remote_root(),
            autolock = config.locking.autolock,
            "Sync engine created"
        );

        Ok(Self {
            locks: LockCoordinator::new(
                ctx.clone(),
                config.locking.autolock,
                config.locking.lock_timeout(),
            ),
            reconciler: Reconciler::new(ctx.clone(), walker),
            ctx,
            outbound,
            reconcile_interval: config.sync.reconcile_interval(),
            poll_interval: config.sync.poll_interval(),
            debounce: DEFAULT_DEBOUNCE,
            trigger: Arc::new(Notify::new()),
            local_events: StdMutex::new(None),
            cycle: Mutex::new(None),
        })
    }

    /// Debounce window of the local monitor
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Connect the stream of local changes, typically from a `FileWatcher`
    pub fn set_local_events(&self, rx: mpsc::Receiver<ChangeEvent>) {
        *self.local_events.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
        info!("Local change stream connected to SyncEngine");
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    pub fn state(&self) -> SyncState {
        self.reconciler.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.reconciler.subscribe_state()
    }

    /// Start monitors and the reconciliation loop
    ///
    /// Calling it while running is a no-op.
    ///
    /// # Errors
    /// `SyncError::AuthenticationRequired` if the store refuses the
    /// change subscription; the engine stays disabled.
    #[tracing::instrument(skip(self))]
    pub async fn start_sync(&self) -> Result<(), SyncError> {
        let mut cycle = self.cycle.lock().await;
        if let Some(active) = cycle.as_ref() {
            if !active.cancel.is_cancelled() {
                debug!("Sync already running");
                return Ok(());
            }
        }
        if let Some(stale) = cycle.take() {
            self.teardown(stale).await;
        }

        let subscription = match self.ctx.remote.subscribe_changes().await {
            Ok(rx) => Some(rx),
            Err(RemoteStoreError::AuthenticationRequired) => {
                error!("Remote store requires authentication, sync disabled");
                self.reconciler.publish(SyncState::Disabled);
                return Err(SyncError::AuthenticationRequired);
            }
            Err(e) => {
                warn!(error = %e, "Change subscription unavailable, polling instead");
                None
            }
        };

        let cancel = CancellationToken::new();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        self.reconciler.publish(SyncState::Enabled);

        let mut tasks = Vec::new();
        let remote_monitor = subscription.map(|rx| {
            let monitor = Arc::new(RemoteMonitor::new(
                self.ctx.clone(),
                self.reconciler.clone(),
                fatal_tx.clone(),
                cancel.clone(),
            ));
            tasks.push(tokio::spawn(monitor.clone().run(rx)));
            monitor
        });

        let local_rx = self
            .local_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let local_task = local_rx.map(|rx| {
            let monitor = LocalMonitor::new(self.ctx.clone(), self.outbound.clone(), fatal_tx.clone())
                .with_debounce(self.debounce);
            tokio::spawn(monitor.run(rx, cancel.clone()))
        });
        if local_task.is_none() {
            warn!("No local change stream connected, local edits are picked up by reconciliation only");
        }

        let period = match remote_monitor {
            Some(_) => self.reconcile_interval,
            None => self.reconcile_interval.min(self.poll_interval),
        };
        tasks.push(tokio::spawn(reconcile_loop(
            self.reconciler.clone(),
            self.trigger.clone(),
            period,
            fatal_tx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(supervise(
            fatal_rx,
            self.reconciler.clone(),
            cancel.clone(),
        )));

        *cycle = Some(Cycle {
            cancel,
            tasks,
            local_task,
            remote_monitor,
        });
        info!(reconcile_secs = period.as_secs(), "Sync started");
        Ok(())
    }

    /// Cancel the running cycle and wait for its tasks
    #[tracing::instrument(skip(self))]
    pub async fn stop_sync(&self) {
        let mut cycle = self.cycle.lock().await;
        if let Some(active) = cycle.take() {
            self.teardown(active).await;
            info!("Sync stopped");
        }
        self.reconciler.publish(SyncState::Disabled);
    }

    /// Ask the reconciliation loop for an immediate full pass
    pub fn request_reconcile(&self) {
        self.trigger.notify_one();
    }

    /// Reconcile `path` now and return the pass report
    ///
    /// A folder is walked with everything below it; a file is reconciled
    /// through its parent folder.
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn force_reconcile(&self, path: &SyncPath) -> Result<WalkReport, SyncError> {
        let cancel = self.running_token().await?;
        let path = self.within_root(path)?;

        let is_file = matches!(
            self.ctx.materializer.stat(&path).await?,
            Some(entry) if entry.kind == ItemKind::File
        );
        match (is_file, path.parent()) {
            (true, Some(parent)) => self.reconciler.pass(vec![parent], false, &cancel).await,
            _ => self.reconciler.pass(vec![path], true, &cancel).await,
        }
    }

    /// Lock a file until [`SyncEngine::unlock`]
    pub async fn lock(&self, path: &SyncPath) -> Result<LockRecord, SyncError> {
        let path = self.within_root(path)?;
        self.locks.lock(&path).await
    }

    pub async fn unlock(&self, path: &SyncPath) -> Result<(), SyncError> {
        let path = self.within_root(path)?;
        self.locks.unlock(&path).await
    }

    pub fn lock_mode(&self, path: &SyncPath) -> LockMode {
        self.locks.mode(path)
    }

    /// Notify the engine that a handle was opened on `path`
    ///
    /// Lock contention is logged and swallowed: the caller proceeds
    /// unlocked.
    pub async fn on_handle_opened(&self, path: &SyncPath, write: bool) -> Result<(), SyncError> {
        let path = self.within_root(path)?;
        match self.locks.on_handle_opened(&path, write).await {
            Err(SyncError::ClientLockFailed { reason, .. }) => {
                warn!(path = %path, operation = "autolock", reason, "Proceeding without remote lock");
                Ok(())
            }
            other => other,
        }
    }

    pub async fn on_handle_closed(&self, path: &SyncPath, write: bool) -> Result<(), SyncError> {
        let path = self.within_root(path)?;
        self.locks.on_handle_closed(&path, write).await
    }

    /// Pending conflicts, oldest first
    pub fn conflicts(&self) -> Vec<Conflict> {
        self.ctx.conflicts.list()
    }

    /// Clear a conflict after the user resolved it and upload the result
    ///
    /// The current remote version becomes the item's base, so the resolved
    /// local content is written over it.
    #[tracing::instrument(skip(self), fields(path = %path))]
    pub async fn resolve_conflict(&self, path: &SyncPath) -> Result<OutboundOutcome, SyncError> {
        let path = self.within_root(path)?;
        let kind = match self.ctx.materializer.stat(&path).await? {
            Some(entry) => entry.kind,
            None => ItemKind::File,
        };
        let locator = self.ctx.to_remote(&path, kind)?;
        let accepted = match self.ctx.remote.get(&locator).await {
            Ok(descriptor) => Some(descriptor.effective_fingerprint()),
            Err(RemoteStoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };

        self.ctx.conflicts.resolve_conflict(&path, accepted).await?;
        self.outbound.sync_updated(&path).await
    }

    /// Passes run so far by the remote monitor of the current cycle
    pub async fn remote_pass_count(&self) -> u64 {
        self.cycle
            .lock()
            .await
            .as_ref()
            .and_then(|c| c.remote_monitor.as_ref())
            .map_or(0, |m| m.pass_count())
    }

    async fn running_token(&self) -> Result<CancellationToken, SyncError> {
        match self.cycle.lock().await.as_ref() {
            Some(cycle) if !cycle.cancel.is_cancelled() => Ok(cycle.cancel.child_token()),
            _ => Err(SyncError::NotRunning),
        }
    }

    fn within_root(&self, path: &SyncPath) -> Result<SyncPath, SyncError> {
        Ok(SyncPath::new_within_root(
            path.as_path(),
            self.ctx.local_root(),
        )?)
    }

    async fn teardown(&self, cycle: Cycle) {
        cycle.cancel.cancel();
        for task in cycle.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Sync task ended abnormally");
            }
        }
        if let Some(local) = cycle.local_task {
            match local.await {
                Ok(rx) => {
                    *self.local_events.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
                }
                Err(e) => warn!(error = %e, "Local monitor ended abnormally"),
            }
        }
    }
}

async fn reconcile_loop(
    reconciler: Reconciler,
    trigger: Arc<Notify>,
    period: Duration,
    fatal: mpsc::UnboundedSender<SyncError>,
    cancel: CancellationToken,
) {
    // the first tick fires immediately
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = trigger.notified() => debug!("Reconciliation requested"),
        }
        if let Err(e) = reconciler.full_pass(&cancel).await {
            error!(error = %e, "Reconciliation aborted");
            let _ = fatal.send(e);
            break;
        }
    }
}

async fn supervise(
    mut fatal: mpsc::UnboundedReceiver<SyncError>,
    reconciler: Reconciler,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        Some(err) = fatal.recv() => {
            error!(error = %err, "Process-wide sync failure, disabling engine");
            reconciler.publish(SyncState::Disabled);
            cancel.cancel();
        }
    }
}
