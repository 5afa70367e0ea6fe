//! Local file watching and event debouncing
//!
//! [`FileWatcher`] wraps the `notify` crate and turns raw OS events into
//! local [`ChangeEvent`]s. [`DebouncedChangeQueue`] holds them until a path
//! has been quiet for the debounce window, merging bursts into the net
//! change.
//!
//! ```text
//! inotify / kqueue
//!       |
//!       v
//!  FileWatcher --> mpsc --> LocalMonitor (DebouncedChangeQueue) --> OutboundSync
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use hydrasync_core::domain::{ChangeEvent, ChangeKind};
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

const CHANNEL_CAPACITY: usize = 1024;

/// Recursive watcher over the sync root
///
/// ```ignore
/// let (mut watcher, rx) = FileWatcher::new()?;
/// watcher.watch(Path::new("/home/user/HydraSync"))?;
/// engine.set_local_events(rx);
/// ```
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Create the watcher and the receiver its events are delivered on
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Dropping local change, monitor has stopped");
                        }
                    }
                }
                Err(err) => error!(error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Watch `path` and everything below it
    ///
    /// # Errors
    /// Returns an error if the path cannot be watched (missing, permissions,
    /// or the inotify watch limit)
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))
    }

    pub fn unwatch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Stopping watch");
        self.watcher
            .unwatch(path)
            .with_context(|| format!("Failed to unwatch path: {}", path.display()))
    }
}

/// Map a raw `notify` event to a local change
///
/// Metadata-only changes and plain accesses are ignored; a close after
/// writing counts as an update, so content-close triggers an upload even on
/// backends that report no data modification.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;
    let first = || paths.first().cloned();

    let change = match &event.kind {
        EventKind::Create(_) => ChangeEvent::local(ChangeKind::Created, first()?),
        EventKind::Remove(_) => ChangeEvent::local(ChangeKind::Deleted, first()?),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
            ChangeEvent::local(ChangeKind::Updated, first()?)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            ChangeEvent::local_move(paths[0].clone(), paths[1].clone())
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            ChangeEvent::local(ChangeKind::Deleted, first()?)
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            ChangeEvent::local(ChangeKind::Created, first()?)
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) => ChangeEvent::local(ChangeKind::Updated, first()?),
        _ => {
            trace!(kind = ?event.kind, "Ignoring event kind");
            return None;
        }
    };
    debug!(kind = %change.kind, path = %change.path.display(), "Mapped local event");
    Some(change)
}

/// Holds local changes until their path is quiet
///
/// Events on the same path merge into their net effect: a create followed
/// by updates stays a create, a create followed by a delete disappears, and
/// a delete followed by a create becomes an update. Moves are keyed by
/// their destination.
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, (ChangeEvent, Instant)>,
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        let now = Instant::now();
        match event.kind {
            ChangeKind::Moved => {
                let Some(to) = event.new_path.clone() else {
                    return;
                };
                let merged = match self.pending.remove(&event.path) {
                    Some((prev, _)) if prev.kind == ChangeKind::Created => {
                        ChangeEvent::local(ChangeKind::Created, to.clone())
                    }
                    // a moved-then-moved-again item keeps its first origin
                    Some((prev, _)) if prev.kind == ChangeKind::Moved => {
                        ChangeEvent::local_move(prev.path, to.clone())
                    }
                    _ => event,
                };
                self.pending.insert(to, (merged, now));
            }
            kind => {
                let path = event.path.clone();
                let merged = match (self.pending.remove(&path), kind) {
                    (Some((prev, _)), ChangeKind::Updated)
                        if matches!(prev.kind, ChangeKind::Created | ChangeKind::Moved) =>
                    {
                        prev
                    }
                    (Some((prev, _)), ChangeKind::Deleted) if prev.kind == ChangeKind::Created => {
                        trace!(path = %path.display(), "Created and deleted before settling");
                        return;
                    }
                    (Some((prev, _)), ChangeKind::Deleted) if prev.kind == ChangeKind::Moved => {
                        ChangeEvent::local(ChangeKind::Deleted, prev.path)
                    }
                    (Some((prev, _)), ChangeKind::Created) if prev.kind == ChangeKind::Deleted => {
                        ChangeEvent::local(ChangeKind::Updated, path.clone())
                    }
                    _ => event,
                };
                self.pending.insert(path, (merged, now));
            }
        }
    }

    /// Remove and return every change quiet for at least the debounce delay
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= self.debounce_delay)
            .map(|(path, _)| path.clone())
            .collect();

        let mut settled: Vec<ChangeEvent> = settled_paths
            .iter()
            .filter_map(|p| self.pending.remove(p).map(|(ev, _)| ev))
            .collect();
        // parents before children keeps folder creates ahead of their content
        settled.sort_by(|a, b| a.path.cmp(&b.path));
        settled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
