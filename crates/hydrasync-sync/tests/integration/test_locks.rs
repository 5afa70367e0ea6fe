//! Lock coordinator state machine

use std::time::Duration;

use hydrasync_core::domain::{LockMode, PinState};
use hydrasync_sync::locks::LockCoordinator;
use hydrasync_sync::SyncError;

use crate::common::{eventually, local, Harness, TEST_OWNER};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Harness with a synced placeholder `a.txt`
async fn synced_file() -> Harness {
    let h = Harness::new();
    h.remote.seed_file("a.txt", b"a");
    h.walk().await;
    h
}

fn coordinator(h: &Harness, autolock: bool) -> LockCoordinator {
    LockCoordinator::new(h.ctx.clone(), autolock, TIMEOUT)
}

#[tokio::test]
async fn test_write_handle_takes_and_releases_auto_lock() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    locks.on_handle_opened(&path, true).await.unwrap();

    assert_eq!(locks.mode(&path), LockMode::Auto);
    assert_eq!(h.remote.lock_owner("a.txt").as_deref(), Some(TEST_OWNER));
    let record = h.local.blob("a.txt").lock.expect("lock record persisted");
    assert_eq!(record.mode(), LockMode::Auto);

    locks.on_handle_closed(&path, true).await.unwrap();

    assert_eq!(locks.mode(&path), LockMode::None);
    assert_eq!(h.remote.lock_owner("a.txt"), None);
    assert!(h.local.blob("a.txt").lock.is_none());
}

#[tokio::test]
async fn test_auto_lock_held_until_last_write_handle_closes() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    locks.on_handle_opened(&path, true).await.unwrap();
    locks.on_handle_opened(&path, true).await.unwrap();
    locks.on_handle_closed(&path, true).await.unwrap();
    assert_eq!(locks.mode(&path), LockMode::Auto);

    locks.on_handle_closed(&path, true).await.unwrap();
    assert_eq!(locks.mode(&path), LockMode::None);
    assert_eq!(h.remote.lock_owner("a.txt"), None);
}

#[tokio::test]
async fn test_handle_opened_during_acquisition_keeps_lock_alive() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    let gate = h.remote.pause_locking().await;
    let (first, ()) = tokio::join!(locks.on_handle_opened(&path, true), async {
        eventually("remote lock call", || h.remote.lock_calls() == 1).await;
        locks.on_handle_opened(&path, true).await.unwrap();
        drop(gate);
    });
    first.unwrap();
    assert_eq!(h.remote.lock_calls(), 1);
    assert_eq!(locks.mode(&path), LockMode::Auto);

    locks.on_handle_closed(&path, true).await.unwrap();
    assert_eq!(locks.mode(&path), LockMode::Auto, "second handle still open");
    assert_eq!(h.remote.lock_owner("a.txt").as_deref(), Some(TEST_OWNER));

    locks.on_handle_closed(&path, true).await.unwrap();
    assert_eq!(locks.mode(&path), LockMode::None);
    assert_eq!(h.remote.lock_owner("a.txt"), None);
}

#[tokio::test]
async fn test_all_handles_closed_during_acquisition_release_lock() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    let gate = h.remote.pause_locking().await;
    let (first, ()) = tokio::join!(locks.on_handle_opened(&path, true), async {
        eventually("remote lock call", || h.remote.lock_calls() == 1).await;
        locks.on_handle_closed(&path, true).await.unwrap();
        drop(gate);
    });
    first.unwrap();

    assert_eq!(locks.mode(&path), LockMode::None);
    assert_eq!(h.remote.lock_owner("a.txt"), None);
    assert!(h.local.blob("a.txt").lock.is_none());
}

#[tokio::test]
async fn test_read_handles_and_disabled_autolock_take_no_lock() {
    let h = synced_file().await;
    let path = local("a.txt");

    let enabled = coordinator(&h, true);
    enabled.on_handle_opened(&path, false).await.unwrap();
    assert_eq!(enabled.mode(&path), LockMode::None);

    let disabled = coordinator(&h, false);
    disabled.on_handle_opened(&path, true).await.unwrap();
    assert_eq!(disabled.mode(&path), LockMode::None);
    assert_eq!(h.remote.lock_owner("a.txt"), None);
}

#[tokio::test]
async fn test_unsynced_file_is_not_auto_locked() {
    let h = Harness::new();
    h.local.user_write("draft.txt", b"d");
    let locks = coordinator(&h, true);

    locks.on_handle_opened(&local("draft.txt"), true).await.unwrap();

    assert_eq!(locks.mode(&local("draft.txt")), LockMode::None);
}

#[tokio::test]
async fn test_contended_lock_is_reported_and_not_recorded() {
    let h = synced_file().await;
    h.remote.external_lock("a.txt", "alice");
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    let err = locks.on_handle_opened(&path, true).await.unwrap_err();

    assert!(matches!(err, SyncError::ClientLockFailed { .. }), "got {err:?}");
    assert!(err.is_recoverable());
    assert_eq!(locks.mode(&path), LockMode::None);
    assert!(h.local.blob("a.txt").lock.is_none());
    assert_eq!(h.remote.lock_owner("a.txt").as_deref(), Some("alice"));
}

#[tokio::test]
async fn test_manual_lock_survives_handle_close() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    let record = locks.lock(&path).await.unwrap();
    assert_eq!(record.mode(), LockMode::Manual);
    locks.on_handle_opened(&path, true).await.unwrap();
    locks.on_handle_closed(&path, true).await.unwrap();

    assert_eq!(locks.mode(&path), LockMode::Manual);
    assert_eq!(h.remote.lock_owner("a.txt").as_deref(), Some(TEST_OWNER));

    locks.unlock(&path).await.unwrap();
    assert_eq!(locks.mode(&path), LockMode::None);
    assert_eq!(h.remote.lock_owner("a.txt"), None);
    assert!(h.local.blob("a.txt").lock.is_none());
}

#[tokio::test]
async fn test_explicit_lock_promotes_auto_lock() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");

    locks.on_handle_opened(&path, true).await.unwrap();
    locks.lock(&path).await.unwrap();
    locks.on_handle_closed(&path, true).await.unwrap();

    assert_eq!(locks.mode(&path), LockMode::Manual);
    assert_eq!(h.local.blob("a.txt").lock.unwrap().mode(), LockMode::Manual);
}

#[tokio::test]
async fn test_unlock_clears_record_when_remote_call_fails() {
    let h = synced_file().await;
    let locks = coordinator(&h, true);
    let path = local("a.txt");
    locks.lock(&path).await.unwrap();

    h.remote.expire_session();
    locks.unlock(&path).await.unwrap();

    assert_eq!(locks.mode(&path), LockMode::None);
    assert!(h.local.blob("a.txt").lock.is_none());
}

#[tokio::test]
async fn test_unlock_releases_lock_persisted_by_earlier_run() {
    let h = synced_file().await;
    coordinator(&h, true).lock(&local("a.txt")).await.unwrap();

    let restarted = coordinator(&h, true);
    restarted.unlock(&local("a.txt")).await.unwrap();

    assert_eq!(h.remote.lock_owner("a.txt"), None);
    assert!(h.local.blob("a.txt").lock.is_none());
}

#[tokio::test]
async fn test_folders_cannot_be_locked() {
    let h = Harness::new();
    h.remote.seed_folder("docs");
    h.walk().await;
    h.local.set_pin("docs", PinState::Pinned);
    let locks = coordinator(&h, true);

    let err = locks.lock(&local("docs")).await.unwrap_err();

    assert!(matches!(err, SyncError::ClientLockFailed { .. }), "got {err:?}");
    assert_eq!(locks.mode(&local("docs")), LockMode::None);
}
