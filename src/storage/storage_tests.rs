use super::*;
use serde_json::json;

const ROLES: &str = "artifacts/t/public/data/user_roles";

#[tokio::test]
async fn create_if_absent_never_overwrites() {
    let b = MemoryBackend::new();
    let first = b.create_if_absent(ROLES, "p1", json!({"role": "admin"})).await.unwrap();
    assert!(first.was_created());
    let second = b.create_if_absent(ROLES, "p1", json!({"role": "investor"})).await.unwrap();
    assert_eq!(second, CreateOutcome::Exists(json!({"role": "admin"})));
    assert_eq!(b.get(ROLES, "p1").await.unwrap(), Some(json!({"role": "admin"})));
}

#[tokio::test]
async fn delete_reports_absent_keys() {
    let b = MemoryBackend::new();
    assert_eq!(b.delete(ROLES, "missing").await.unwrap(), None);
    b.create_if_absent(ROLES, "k", json!(1)).await.unwrap();
    assert!(b.delete(ROLES, "k").await.unwrap().is_some());
    assert_eq!(b.get(ROLES, "k").await.unwrap(), None);
    assert!(b.scan(ROLES).await.unwrap().is_empty());
}

#[tokio::test]
async fn sequence_numbers_strictly_increase_across_collections() {
    let b = MemoryBackend::new();
    let CreateOutcome::Created { seq: s1 } = b.create_if_absent("a", "1", json!(1)).await.unwrap() else { panic!("expected create") };
    let CreateOutcome::Created { seq: s2 } = b.create_if_absent("b", "1", json!(1)).await.unwrap() else { panic!("expected create") };
    let s3 = b.delete("a", "1").await.unwrap().unwrap();
    assert!(s1 < s2 && s2 < s3);
}

#[tokio::test]
async fn watch_delivers_initial_state_then_changes_in_order() {
    let b = MemoryBackend::new();
    b.create_if_absent("docs", "a", json!({"n": 1})).await.unwrap();
    let mut w = b.watch("docs", Filter::All).await.unwrap();
    assert_eq!(w.entries.len(), 1);
    b.create_if_absent("docs", "b", json!({"n": 2})).await.unwrap();
    b.create_if_absent("other", "x", json!({"n": 3})).await.unwrap();
    b.delete("docs", "a").await.unwrap();

    let Some(WatchItem::Change(e1)) = w.next().await else { panic!("expected change") };
    assert_eq!(e1.key, "b");
    assert!(matches!(e1.kind, ChangeKind::Created(_)));
    let Some(WatchItem::Change(e2)) = w.next().await else { panic!("expected change") };
    assert_eq!(e2.key, "a");
    assert_eq!(e2.kind, ChangeKind::Deleted(json!({"n": 1})));
    assert!(e1.seq < e2.seq);
}

#[tokio::test]
async fn filtered_watch_only_sees_matching_rows() {
    let b = MemoryBackend::new();
    b.create_if_absent(ROLES, "p0", json!({"role": "investor"})).await.unwrap();
    let mut w = b.watch(ROLES, Filter::field_equals("role", "admin")).await.unwrap();
    assert!(w.entries.is_empty());
    b.create_if_absent(ROLES, "p1", json!({"role": "investor"})).await.unwrap();
    b.create_if_absent(ROLES, "p2", json!({"role": "admin"})).await.unwrap();
    let Some(WatchItem::Change(ev)) = w.next().await else { panic!("expected change") };
    assert_eq!(ev.key, "p2");
}

#[tokio::test]
async fn slow_watchers_are_told_they_lagged() {
    let b = MemoryBackend::new().with_channel_capacity(2);
    let mut w = b.watch("docs", Filter::All).await.unwrap();
    for i in 0..5 {
        b.create_if_absent("docs", &i.to_string(), json!(i)).await.unwrap();
    }
    assert!(matches!(w.next().await, Some(WatchItem::Lagged(_))));
}

#[tokio::test]
async fn unavailable_backend_is_retryable_infrastructure_error() {
    let b = MemoryBackend::new();
    b.set_available(false);
    let err = b.get(ROLES, "p1").await.unwrap_err();
    assert_eq!(err.code_str(), "backend_unreachable");
    assert!(err.is_retryable());
    assert!(b.create_if_absent(ROLES, "p1", json!(1)).await.is_err());
    b.set_available(true);
    assert_eq!(b.get(ROLES, "p1").await.unwrap(), None);
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let b = MemoryBackend::open(SnapshotSettings::new(tmp.path())).unwrap();
        b.create_if_absent(ROLES, "p1", json!({"role": "admin"})).await.unwrap();
        b.create_if_absent("docs", "d1", json!({"name": "Q2"})).await.unwrap();
        b.create_if_absent("docs", "d2", json!({"name": "Q3"})).await.unwrap();
        b.delete("docs", "d1").await.unwrap();
    }
    let b = MemoryBackend::open(SnapshotSettings::new(tmp.path())).unwrap();
    assert_eq!(b.get(ROLES, "p1").await.unwrap(), Some(json!({"role": "admin"})));
    let docs = b.scan("docs").await.unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].0, "d2");
    // Sequence continues after the persisted one.
    let w = b.watch("docs", Filter::All).await.unwrap();
    assert_eq!(w.seq, 4);
}

#[tokio::test]
async fn failed_snapshot_write_rolls_the_mutation_back() {
    let tmp = tempfile::tempdir().unwrap();
    let b = MemoryBackend::open(SnapshotSettings::new(tmp.path())).unwrap();
    b.create_if_absent("docs", "d1", json!({"name": "Q2"})).await.unwrap();
    let mut w = b.watch("docs", Filter::All).await.unwrap();

    // A directory where the temp file should go makes the write fail.
    let blocker = tmp.path().join("snapshot.bin.tmp");
    std::fs::create_dir(&blocker).unwrap();
    let err = b.create_if_absent("docs", "d2", json!({"name": "Q3"})).await.unwrap_err();
    assert_eq!(err.code_str(), "io_error");
    assert_eq!(b.get("docs", "d2").await.unwrap(), None);
    let err = b.delete("docs", "d1").await.unwrap_err();
    assert!(err.is_retryable());
    assert!(b.get("docs", "d1").await.unwrap().is_some());

    std::fs::remove_dir(&blocker).unwrap();
    let CreateOutcome::Created { seq } = b.create_if_absent("docs", "d2", json!({"name": "Q3"})).await.unwrap() else { panic!("expected create") };
    assert_eq!(seq, 2);
    // Watchers never saw the rolled-back mutations.
    let Some(WatchItem::Change(ev)) = w.next().await else { panic!("expected change") };
    assert_eq!((ev.seq, ev.key.as_str()), (2, "d2"));

    let reopened = MemoryBackend::open(SnapshotSettings::new(tmp.path())).unwrap();
    assert_eq!(reopened.scan("docs").await.unwrap().len(), 2);
}

#[tokio::test]
async fn corrupt_snapshot_fails_to_open() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("snapshot.bin"), b"not a snapshot").unwrap();
    let err = MemoryBackend::open(SnapshotSettings::new(tmp.path())).err().unwrap();
    assert_eq!(err.code_str(), "snapshot_corrupt");
}

#[test]
fn collection_paths_are_namespaced_by_app_id() {
    let p = CollectionPaths::new("vdr");
    assert_eq!(p.user_roles(), "artifacts/vdr/public/data/user_roles");
    assert_eq!(p.documents(), "artifacts/vdr/public/data/files");
    assert_eq!(p.admin_claim(), "artifacts/vdr/public/data/admin_claim");
    assert_eq!(CollectionPaths::new("  ").app_id(), "default-app-id");
}
