//! Local to remote actions: creates, fingerprint-guarded updates, deletes
//! and moves

use hydrasync_core::domain::{ChangeEvent, ConflictReason};
use hydrasync_sync::outbound::OutboundOutcome;
use hydrasync_sync::SyncError;

use crate::common::{fp, local, Harness};

/// A synced `a.txt` at the root, created through the outbound path
async fn uploaded_file(h: &Harness) {
    h.local.user_write("a.txt", b"first");
    let outcome = h.outbound.sync_created(&local("a.txt")).await.unwrap();
    assert_eq!(outcome, OutboundOutcome::Created);
}

#[tokio::test]
async fn test_create_uploads_and_converts_to_placeholder() {
    let h = Harness::new();

    uploaded_file(&h).await;

    assert_eq!(h.remote.content("a.txt").unwrap(), b"first");
    assert!(h.local.is_placeholder_item("a.txt"));
    assert!(h.local.is_in_sync("a.txt"));
    let blob = h.local.blob("a.txt");
    assert_eq!(blob.fingerprint, Some(fp("v1")));
    assert_eq!(blob.original_path, "/a.txt");
}

#[tokio::test]
async fn test_created_folder_is_uploaded_with_its_content() {
    let h = Harness::new();
    h.local.user_create_folder("proj");
    h.local.user_write("proj/a.txt", b"a");
    h.local.user_create_folder("proj/sub");
    h.local.user_write("proj/sub/b.txt", b"b");

    let outcome = h.outbound.sync_created(&local("proj")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Created);
    assert!(h.remote.exists("proj"));
    assert_eq!(h.remote.content("proj/a.txt").unwrap(), b"a");
    assert_eq!(h.remote.content("proj/sub/b.txt").unwrap(), b"b");
    assert!(h.local.is_in_sync("proj/sub/b.txt"));
}

#[tokio::test]
async fn test_create_over_existing_remote_item_is_a_conflict() {
    let h = Harness::new();
    h.remote.seed_file("a.txt", b"someone else's");
    h.local.user_write("a.txt", b"mine");

    let err = h.outbound.sync_created(&local("a.txt")).await.unwrap_err();

    assert!(err.is_conflict());
    assert!(h.ctx.conflicts.is_flagged(&local("a.txt")));
    assert_eq!(h.remote.content("a.txt").unwrap(), b"someone else's");
}

#[tokio::test]
async fn test_update_uploads_when_fingerprint_matches() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_write("a.txt", b"second");
    let outcome = h.outbound.sync_updated(&local("a.txt")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Updated);
    assert_eq!(h.remote.content("a.txt").unwrap(), b"second");
    assert_eq!(h.local.blob("a.txt").fingerprint, Some(fp("v2")));
    assert!(h.local.is_in_sync("a.txt"));
}

#[tokio::test]
async fn test_update_without_returned_fingerprint_reads_it_back() {
    let h = Harness::new();
    uploaded_file(&h).await;
    h.remote.withhold_fingerprints();

    h.local.user_write("a.txt", b"second");
    h.outbound.sync_updated(&local("a.txt")).await.unwrap();

    assert_eq!(h.local.blob("a.txt").fingerprint, h.remote.fingerprint("a.txt"));
    assert_eq!(h.local.blob("a.txt").fingerprint, Some(fp("v2")));
    assert!(h.local.is_in_sync("a.txt"));
}

#[tokio::test]
async fn test_update_fails_when_written_fingerprint_cannot_be_read() {
    let h = Harness::new();
    uploaded_file(&h).await;
    h.remote.withhold_fingerprints();
    h.remote.break_get_after_write();

    h.local.user_write("a.txt", b"second");
    let err = h.outbound.sync_updated(&local("a.txt")).await.unwrap_err();

    assert!(matches!(err, SyncError::RemoteUnavailable(_)), "got {err:?}");
    assert!(!h.local.is_in_sync("a.txt"));
    assert_eq!(h.local.blob("a.txt").fingerprint, Some(fp("v1")), "nothing invented");
}

#[tokio::test]
async fn test_create_fails_when_written_fingerprint_cannot_be_read() {
    let h = Harness::new();
    h.remote.withhold_fingerprints();
    h.remote.break_get_after_write();
    h.local.user_write("a.txt", b"first");

    let err = h.outbound.sync_created(&local("a.txt")).await.unwrap_err();

    assert!(err.is_recoverable(), "got {err:?}");
    assert!(!h.local.is_placeholder_item("a.txt"));
    assert!(!h.local.is_in_sync("a.txt"));
}

#[tokio::test]
async fn test_update_of_synchronized_item_writes_nothing() {
    let h = Harness::new();
    uploaded_file(&h).await;
    let writes = h.remote.write_count();

    let outcome = h.outbound.sync_updated(&local("a.txt")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Unchanged);
    assert_eq!(h.remote.write_count(), writes);
}

#[tokio::test]
async fn test_update_rejected_when_remote_changed() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_write("a.txt", b"local edit");
    h.remote.external_write("a.txt", b"remote edit");
    let err = h.outbound.sync_updated(&local("a.txt")).await.unwrap_err();

    assert!(matches!(err, SyncError::Conflict(_)), "got {err:?}");
    assert_eq!(h.remote.write_count(), 0);
    assert_eq!(h.remote.content("a.txt").unwrap(), b"remote edit");
    assert_eq!(h.local.content("a.txt").unwrap(), b"local edit");

    let blob = h.local.blob("a.txt");
    assert!(blob.conflicted);
    assert_eq!(blob.fingerprint, Some(fp("v1")), "base fingerprint is kept");
    let conflict = h.ctx.conflicts.get(&local("a.txt")).unwrap();
    assert_eq!(conflict.reason(), ConflictReason::RemoteModified);
    assert_eq!(conflict.remote_fingerprint(), Some(&fp("v2")));
}

#[tokio::test]
async fn test_conflicted_item_is_not_uploaded_again() {
    let h = Harness::new();
    uploaded_file(&h).await;
    h.local.user_write("a.txt", b"local edit");
    h.remote.external_write("a.txt", b"remote edit");
    let _ = h.outbound.sync_updated(&local("a.txt")).await;

    h.local.user_write("a.txt", b"another edit");
    let outcome = h.outbound.sync_updated(&local("a.txt")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Skipped);
    assert_eq!(h.remote.content("a.txt").unwrap(), b"remote edit");
}

#[tokio::test]
async fn test_update_of_item_deleted_remotely_is_a_conflict() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_write("a.txt", b"edit");
    h.remote.external_delete("a.txt");
    let err = h.outbound.sync_updated(&local("a.txt")).await.unwrap_err();

    assert!(err.is_conflict());
    let conflict = h.ctx.conflicts.get(&local("a.txt")).unwrap();
    assert_eq!(conflict.reason(), ConflictReason::RemoteDeleted);
}

#[tokio::test]
async fn test_local_delete_removes_remote_item() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_delete("a.txt");
    let outcome = h.outbound.sync_deleted(&local("a.txt")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Deleted);
    assert!(!h.remote.exists("a.txt"));
}

#[tokio::test]
async fn test_local_delete_of_folder_uses_folder_locator() {
    let h = Harness::new();
    h.local.user_create_folder("proj");
    h.local.user_write("proj/a.txt", b"a");
    h.outbound.sync_created(&local("proj")).await.unwrap();

    h.local.user_delete("proj");
    let outcome = h.outbound.sync_deleted(&local("proj")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Deleted);
    assert!(!h.remote.exists("proj"));
    assert!(!h.remote.exists("proj/a.txt"));
}

#[tokio::test]
async fn test_deleting_conflicted_item_keeps_remote() {
    let h = Harness::new();
    uploaded_file(&h).await;
    h.local.user_write("a.txt", b"local edit");
    h.remote.external_write("a.txt", b"remote edit");
    let _ = h.outbound.sync_updated(&local("a.txt")).await;

    h.local.user_delete("a.txt");
    let outcome = h.outbound.sync_deleted(&local("a.txt")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Skipped);
    assert_eq!(h.remote.content("a.txt").unwrap(), b"remote edit");
    assert!(!h.ctx.conflicts.is_flagged(&local("a.txt")));
}

#[tokio::test]
async fn test_rename_moves_remote_item_and_keeps_sync() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_rename("a.txt", "b.txt");
    let event = ChangeEvent::local_move(local("a.txt").into_path_buf(), local("b.txt").into_path_buf());
    let outcome = h.outbound.dispatch(&event).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Moved);
    assert!(!h.remote.exists("a.txt"));
    assert_eq!(h.remote.content("b.txt").unwrap(), b"first");
    assert!(h.local.is_in_sync("b.txt"));
    assert_eq!(h.local.blob("b.txt").original_path, "/b.txt");
    assert_eq!(h.local.blob("b.txt").fingerprint, Some(fp("v1")));
}

#[tokio::test]
async fn test_rename_of_edited_file_uploads_after_move() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_write("a.txt", b"edited");
    h.local.user_rename("a.txt", "b.txt");
    let outcome = h.outbound.sync_moved(&local("a.txt"), &local("b.txt")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Moved);
    assert_eq!(h.remote.content("b.txt").unwrap(), b"edited");
    assert!(h.local.is_in_sync("b.txt"));
}

#[tokio::test]
async fn test_failed_remote_move_leaves_item_unsynchronized() {
    let h = Harness::new();
    uploaded_file(&h).await;
    h.remote.seed_file("b.txt", b"taken");

    h.local.user_rename("a.txt", "b.txt");
    let result = h.outbound.sync_moved(&local("a.txt"), &local("b.txt")).await;

    assert!(result.is_err());
    assert!(!h.local.is_in_sync("b.txt"));
    assert_eq!(h.remote.content("b.txt").unwrap(), b"taken");
}

#[tokio::test]
async fn test_rename_to_temporary_name_deletes_remote() {
    let h = Harness::new();
    uploaded_file(&h).await;

    h.local.user_rename("a.txt", "a.txt.tmp");
    let outcome = h.outbound.sync_moved(&local("a.txt"), &local("a.txt.tmp")).await.unwrap();

    assert_eq!(outcome, OutboundOutcome::Deleted);
    assert!(!h.remote.exists("a.txt"));
    assert!(!h.remote.exists("a.txt.tmp"));
}

#[tokio::test]
async fn test_dispatch_rejects_path_outside_root() {
    let h = Harness::new();
    let event = ChangeEvent::local(hydrasync_core::domain::ChangeKind::Created, "/elsewhere/x.txt");

    let err = h.outbound.dispatch(&event).await.unwrap_err();

    assert!(matches!(err, SyncError::InvalidPath(_)), "got {err:?}");
}
