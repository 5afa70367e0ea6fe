//! Local and remote monitors: echo suppression and pass coalescing

use std::sync::Arc;
use std::time::Duration;

use hydrasync_core::domain::{ChangeKind, ItemKind, PinState, RemoteNotification};
use hydrasync_core::ports::IRemoteStore;
use hydrasync_sync::local_monitor::LocalMonitor;
use hydrasync_sync::reconciler::Reconciler;
use hydrasync_sync::remote_monitor::RemoteMonitor;
use hydrasync_sync::walker::ReconcileWalker;
use hydrasync_sync::SyncState;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::common::{eventually, local, Harness};

const DEBOUNCE: Duration = Duration::from_millis(20);

fn spawn_local_monitor(h: &Harness, cancel: &CancellationToken) {
    let (fatal, _) = mpsc::unbounded_channel();
    let monitor = LocalMonitor::new(h.ctx.clone(), h.outbound.clone(), fatal).with_debounce(DEBOUNCE);
    tokio::spawn(monitor.run(h.local.events(), cancel.clone()));
}

fn reconciler(h: &Harness) -> Reconciler {
    let walker = Arc::new(ReconcileWalker::new(h.ctx.clone(), h.outbound.clone()));
    Reconciler::new(h.ctx.clone(), walker)
}

fn remote_monitor_with(h: &Harness, reconciler: Reconciler, cancel: &CancellationToken) -> Arc<RemoteMonitor> {
    let (fatal, _) = mpsc::unbounded_channel();
    Arc::new(RemoteMonitor::new(h.ctx.clone(), reconciler, fatal, cancel.clone()))
}

fn remote_monitor(h: &Harness, cancel: &CancellationToken) -> Arc<RemoteMonitor> {
    remote_monitor_with(h, reconciler(h), cancel)
}

#[tokio::test]
async fn test_local_monitor_uploads_user_edit() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    spawn_local_monitor(&h, &cancel);

    h.local.user_write("notes.txt", b"hello");

    eventually("upload of notes.txt", || h.remote.exists("notes.txt")).await;
    assert_eq!(h.remote.content("notes.txt").unwrap(), b"hello");
    cancel.cancel();
}

#[tokio::test]
async fn test_local_monitor_ignores_temporary_artifacts() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    spawn_local_monitor(&h, &cancel);

    h.local.user_write("report.docx.tmp", b"scratch");
    h.local.user_write("real.txt", b"r");

    eventually("upload of real.txt", || h.remote.exists("real.txt")).await;
    assert!(!h.remote.exists("report.docx.tmp"));
    cancel.cancel();
}

#[tokio::test]
async fn test_inbound_writes_are_not_echoed_back() {
    let h = Harness::new();
    h.remote.seed_file("a.txt", b"a");
    h.remote.seed_file("b.txt", b"b");
    let cancel = CancellationToken::new();
    spawn_local_monitor(&h, &cancel);

    h.walk().await;
    h.local.set_pin("a.txt", PinState::Pinned);
    h.walk().await;

    eventually("echoes consumed", || h.ctx.suppressor.pending_echoes() == 0).await;
    assert_eq!(h.remote.mutation_count(), 0);
    cancel.cancel();
}

#[tokio::test]
async fn test_user_edit_after_inbound_write_is_uploaded() {
    let h = Harness::new();
    h.remote.seed_file("a.txt", b"remote");
    let cancel = CancellationToken::new();
    spawn_local_monitor(&h, &cancel);
    h.walk().await;
    eventually("echo consumed", || h.ctx.suppressor.pending_echoes() == 0).await;

    h.local.user_write("a.txt", b"user edit");

    eventually("upload of user edit", || h.remote.write_count() == 1).await;
    assert_eq!(h.remote.content("a.txt").unwrap(), b"user edit");
    cancel.cancel();
}

#[tokio::test]
async fn test_own_remote_writes_do_not_trigger_passes() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    let monitor = remote_monitor(&h, &cancel);
    let notifications = h.remote.subscribe_changes().await.unwrap();
    tokio::spawn(monitor.clone().run(notifications));

    h.local.user_write("mine.txt", b"m");
    h.outbound.sync_created(&local("mine.txt")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(monitor.pass_count(), 0);

    h.remote.external_create_file("theirs.txt", b"t");
    eventually("remote-triggered pass", || h.local.exists("theirs.txt")).await;
    assert_eq!(monitor.pass_count(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_notifications_during_pass_cause_one_more_pass() {
    let h = Harness::new();
    h.remote.seed_file("a.txt", b"a");
    h.walk().await;
    let cancel = CancellationToken::new();
    let monitor = remote_monitor(&h, &cancel);
    let changed = || RemoteNotification::new(ChangeKind::Updated, h.remote.locator("a.txt", ItemKind::File));

    let gate = h.remote.pause_listing().await;
    let lists_before = h.remote.list_calls();
    monitor.notify(changed()).await;
    eventually("first pass listing", || h.remote.list_calls() > lists_before).await;

    for _ in 0..10 {
        monitor.notify(changed()).await;
    }
    drop(gate);

    eventually("passes settled", || !monitor.is_running()).await;
    assert_eq!(monitor.pass_count(), 2);
}

#[tokio::test]
async fn test_notification_below_offline_folder_is_dropped() {
    let h = Harness::new();
    h.remote.seed_folder("archive");
    h.remote.seed_file("archive/old.txt", b"o");
    h.walk().await;
    let cancel = CancellationToken::new();
    let monitor = remote_monitor(&h, &cancel);

    monitor
        .notify(RemoteNotification::new(
            ChangeKind::Updated,
            h.remote.locator("archive/old.txt", ItemKind::File),
        ))
        .await;

    assert!(!monitor.is_running());
    assert_eq!(monitor.pass_count(), 0);
}

#[tokio::test]
async fn test_remote_change_in_online_folder_is_pulled() {
    let h = Harness::new();
    h.remote.seed_folder("docs");
    h.remote.seed_file("docs/a.txt", b"v1");
    h.walk().await;
    h.local.set_pin("docs", PinState::Pinned);
    h.walk().await;
    let cancel = CancellationToken::new();
    let monitor = remote_monitor(&h, &cancel);
    let notifications = h.remote.subscribe_changes().await.unwrap();
    tokio::spawn(monitor.clone().run(notifications));

    let v2 = h.remote.external_write("docs/a.txt", b"v2");

    eventually("pulled fingerprint", || h.local.blob("docs/a.txt").fingerprint.as_ref() == Some(&v2)).await;
    cancel.cancel();
}

#[tokio::test]
async fn test_remote_pass_publishes_state_and_prunes_path_locks() {
    let h = Harness::new();
    h.remote.seed_file("a.txt", b"a");
    h.walk().await;
    let cancel = CancellationToken::new();
    let reconciler = reconciler(&h);
    reconciler.publish(SyncState::Enabled);
    let mut states = reconciler.subscribe_state();
    let monitor = remote_monitor_with(&h, reconciler.clone(), &cancel);
    assert!(!h.ctx.path_locks.is_empty(), "the earlier walk left idle locks");

    let gate = h.remote.pause_listing().await;
    monitor
        .notify(RemoteNotification::new(ChangeKind::Updated, h.remote.locator("a.txt", ItemKind::File)))
        .await;
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == SyncState::Synchronizing))
        .await
        .expect("remote pass reported as synchronizing")
        .unwrap();
    drop(gate);

    eventually("pass settled", || !monitor.is_running()).await;
    assert_eq!(reconciler.state(), SyncState::Idle);
    assert!(h.ctx.path_locks.is_empty());
}
