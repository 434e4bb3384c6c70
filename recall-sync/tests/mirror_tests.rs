use futures::StreamExt;
use pretty_assertions::assert_eq;
use recall_model::EntitySchema;
use recall_storage::LocalDb;
use recall_sync::{MirrorUpdate, RemoteError, RemoteMirror, RemoteResult};
use recall_types::LocalClock;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn schema() -> EntitySchema {
    EntitySchema::new("work", "works").with_version_field("updated_at")
}

fn open(db: &LocalDb, clock: Arc<LocalClock>) -> RemoteMirror {
    RemoteMirror::open(&schema(), db.mirror_table(&schema()).unwrap(), clock).unwrap()
}

fn ids(mirror: &RemoteMirror) -> Vec<String> {
    mirror.snapshot().iter().map(|e| e.id.clone()).collect()
}

// ── Snapshots ────────────────────────────────────────────────────

#[test]
fn starts_empty_and_disconnected() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = open(&db, Arc::new(LocalClock::new()));
    assert!(mirror.snapshot().is_empty());
    assert!(!mirror.connected());
    assert_eq!(mirror.kind(), "work");
}

#[test]
fn snapshot_replaces_all_rows() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = open(&db, Arc::new(LocalClock::new()));

    mirror
        .apply_snapshot(vec![json!({"id": "a"}), json!({"id": "b"})])
        .unwrap();
    assert_eq!(ids(&mirror), vec!["a", "b"]);
    assert!(mirror.connected());

    mirror.apply_snapshot(vec![json!({"id": "c", "title": "C"})]).unwrap();
    assert_eq!(ids(&mirror), vec!["c"]);
    assert_eq!(mirror.get("c").unwrap().get_str("/title"), Some("C"));
    assert!(mirror.get("a").is_none());
}

#[test]
fn empty_snapshot_clears_mirror() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = open(&db, Arc::new(LocalClock::new()));
    mirror.apply_snapshot(vec![json!({"id": "a"})]).unwrap();

    assert_eq!(mirror.apply_snapshot(Vec::new()).unwrap(), 0);
    assert!(mirror.snapshot().is_empty());
}

#[test]
fn rows_without_string_id_are_skipped() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = open(&db, Arc::new(LocalClock::new()));

    let applied = mirror
        .apply_snapshot(vec![json!({"id": "a"}), json!({"title": "no id"}), json!({"id": 7})])
        .unwrap();
    assert_eq!(applied, 1);
    assert_eq!(ids(&mirror), vec!["a"]);
}

#[test]
fn earlier_snapshot_reference_is_unaffected_by_refresh() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = open(&db, Arc::new(LocalClock::new()));
    mirror.apply_snapshot(vec![json!({"id": "a"})]).unwrap();

    let held = mirror.snapshot();
    mirror.apply_snapshot(Vec::new()).unwrap();
    assert_eq!(held.len(), 1);
}

#[test]
fn persisted_snapshot_is_served_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recall.duckdb");
    {
        let db = LocalDb::open(&path).unwrap();
        open(&db, Arc::new(LocalClock::new()))
            .apply_snapshot(vec![json!({"id": "a", "title": "kept"})])
            .unwrap();
    }

    let db = LocalDb::open(&path).unwrap();
    let mirror = open(&db, Arc::new(LocalClock::new()));
    assert_eq!(mirror.get("a").unwrap().get_str("/title"), Some("kept"));
    assert!(!mirror.connected());
}

#[test]
fn clock_moves_past_observed_versions() {
    let db = LocalDb::open_in_memory().unwrap();
    let clock = Arc::new(LocalClock::new());
    let mirror = open(&db, Arc::clone(&clock));
    let far_future = 4_000_000_000_000u64;

    mirror
        .apply_snapshot(vec![json!({"id": "a", "updated_at": far_future})])
        .unwrap();
    assert!(clock.next().wall_time() >= far_future);
}

// ── Subscription loop ────────────────────────────────────────────

fn collect_updates() -> (Arc<Mutex<Vec<MirrorUpdate>>>, impl Fn(MirrorUpdate) + Send + Sync) {
    let updates = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&updates);
    (updates, move |u| sink.lock().unwrap().push(u))
}

#[tokio::test]
async fn run_applies_snapshots_and_reports_errors() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = Arc::new(open(&db, Arc::new(LocalClock::new())));
    let items: Vec<RemoteResult<Vec<Value>>> = vec![
        Ok(vec![json!({"id": "a"}), json!({"id": "b"})]),
        Err(RemoteError::Unreachable("gone".into())),
        Ok(Vec::new()),
    ];
    let (updates, on_update) = collect_updates();

    Arc::clone(&mirror)
        .run(futures::stream::iter(items).boxed(), on_update)
        .await;

    assert_eq!(
        *updates.lock().unwrap(),
        vec![
            MirrorUpdate::Applied { rows: 2 },
            MirrorUpdate::Disconnected(RemoteError::Unreachable("gone".into())),
            MirrorUpdate::Applied { rows: 0 },
        ]
    );
    assert!(mirror.snapshot().is_empty());
    assert!(!mirror.connected());
}

#[tokio::test]
async fn error_keeps_last_snapshot() {
    let db = LocalDb::open_in_memory().unwrap();
    let mirror = Arc::new(open(&db, Arc::new(LocalClock::new())));
    let items: Vec<RemoteResult<Vec<Value>>> = vec![
        Ok(vec![json!({"id": "a"})]),
        Err(RemoteError::Unreachable("gone".into())),
    ];
    let (_updates, on_update) = collect_updates();

    Arc::clone(&mirror)
        .run(futures::stream::iter(items).boxed(), on_update)
        .await;

    assert_eq!(ids(&mirror), vec!["a"]);
}
