//! Local change monitor
//!
//! Raw watcher events are filtered, debounced, checked against expected
//! inbound echoes, then handed to [`OutboundSync`]. Failures are logged and
//! the item is left for a later pass; only process-wide errors leave the
//! monitor, through the engine's fatal channel.

use std::sync::Arc;
use std::time::Duration;

use hydrasync_core::domain::{ChangeEvent, ChangeKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::context::SyncContext;
use crate::outbound::OutboundSync;
use crate::watcher::DebouncedChangeQueue;
use crate::SyncError;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);
const MIN_TICK: Duration = Duration::from_millis(10);

pub struct LocalMonitor {
    ctx: Arc<SyncContext>,
    outbound: Arc<OutboundSync>,
    fatal: mpsc::UnboundedSender<SyncError>,
    debounce: Duration,
}

impl LocalMonitor {
    pub fn new(
        ctx: Arc<SyncContext>,
        outbound: Arc<OutboundSync>,
        fatal: mpsc::UnboundedSender<SyncError>,
    ) -> Self {
        Self {
            ctx,
            outbound,
            fatal,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Process events until cancelled or the watcher goes away
    ///
    /// Returns the receiver so a later cycle can resume on the same stream.
    pub async fn run(
        self,
        mut events: mpsc::Receiver<ChangeEvent>,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ChangeEvent> {
        let mut queue = DebouncedChangeQueue::new(self.debounce);
        let mut ticker = tokio::time::interval((self.debounce / 3).max(MIN_TICK));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(debounce_ms = self.debounce.as_millis() as u64, "Local change monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(event) => self.accept(event, &mut queue),
                    None => {
                        warn!("Local event stream closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !queue.is_empty() {
                        self.flush(&mut queue, &cancel).await;
                    }
                }
            }
        }

        if !queue.is_empty() {
            debug!(pending = queue.pending_count(), "Unsettled local changes left for reconciliation");
        }
        info!("Local change monitor stopped");
        events
    }

    fn accept(&self, event: ChangeEvent, queue: &mut DebouncedChangeQueue) {
        let root = self.ctx.local_root().as_path();
        if !event.paths().all(|p| p.starts_with(root)) || event.path == root {
            trace!(path = %event.path.display(), "Ignoring event outside sync root");
            return;
        }

        let filter = &self.ctx.filter;
        let excluded = match event.kind {
            // a move is dropped only when neither side is a real name
            ChangeKind::Moved => event.paths().all(|p| filter.is_excluded(p)),
            _ => filter.is_excluded(&event.path),
        };
        if excluded {
            trace!(path = %event.path.display(), "Ignoring temporary artifact");
            return;
        }
        queue.push(event);
    }

    async fn flush(&self, queue: &mut DebouncedChangeQueue, cancel: &CancellationToken) {
        for event in queue.poll() {
            if cancel.is_cancelled() {
                return;
            }
            // every path consumes its own expectation
            let echoes = event
                .paths()
                .filter(|p| self.ctx.suppressor.consume_local_echo(p))
                .count();
            if echoes > 0 {
                trace!(path = %event.path.display(), "Dropped inbound echo");
                continue;
            }

            debug!(kind = %event.kind, path = %event.path.display(), "Dispatching local change");
            match self.outbound.dispatch(&event).await {
                Ok(outcome) => trace!(?outcome, "Local change handled"),
                Err(e) if e.is_process_wide() => {
                    let _ = self.fatal.send(e);
                    return;
                }
                Err(e) if e.is_conflict() => {
                    warn!(path = %event.path.display(), operation = %event.kind, "Local change conflicts with remote, item flagged");
                }
                Err(e) => {
                    warn!(
                        path = %event.path.display(),
                        operation = %event.kind,
                        error = %e,
                        "Local change not synced, left for next pass"
                    );
                }
            }
        }
    }
}
