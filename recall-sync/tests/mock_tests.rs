use futures::StreamExt;
use pretty_assertions::assert_eq;
use recall_model::Filter;
use recall_sync::mock::InMemoryRemote;
use recall_sync::{RemoteError, RemoteSource, RemoteWriter, SnapshotStream, WriteRequest};
use recall_types::ChangeOp;
use serde_json::{json, Value};
use std::time::Duration;

fn request(op: ChangeOp, id: &str, payload: Value) -> WriteRequest {
    WriteRequest {
        table: "works".into(),
        op,
        id: id.into(),
        payload,
    }
}

async fn next_rows(stream: &mut SnapshotStream) -> Result<Vec<Value>, RemoteError> {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("subscription stalled")
        .expect("subscription ended")
}

// ── Writes ───────────────────────────────────────────────────────

#[tokio::test]
async fn insert_is_an_upsert() {
    let remote = InMemoryRemote::new();
    remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a", "title": "X", "year": 1})))
        .await
        .unwrap();
    remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a", "title": "Y"})))
        .await
        .unwrap();

    assert_eq!(
        remote.row("works", "a"),
        Some(json!({"id": "a", "title": "Y", "year": 1}))
    );
}

#[tokio::test]
async fn stale_update_is_acknowledged_but_ignored() {
    let remote = InMemoryRemote::new();
    remote.seed("works", [json!({"id": "a", "title": "new", "updated_at": 20})]);

    let ack = remote
        .write(request(ChangeOp::Update, "a", json!({"id": "a", "title": "old", "updated_at": 10})))
        .await
        .unwrap();

    assert_eq!(ack.data.unwrap()["title"], "new");
    assert_eq!(remote.row("works", "a").unwrap()["title"], "new");
}

#[tokio::test]
async fn update_of_missing_row_inserts_it() {
    let remote = InMemoryRemote::new();
    remote
        .write(request(ChangeOp::Update, "a", json!({"id": "a", "title": "X"})))
        .await
        .unwrap();
    assert_eq!(remote.rows("works"), vec![json!({"id": "a", "title": "X"})]);
}

#[tokio::test]
async fn without_version_field_last_write_wins() {
    let remote = InMemoryRemote::with_version_field(None);
    remote.seed("works", [json!({"id": "a", "updated_at": 20})]);
    remote
        .write(request(ChangeOp::Update, "a", json!({"id": "a", "updated_at": 10})))
        .await
        .unwrap();
    assert_eq!(remote.row("works", "a").unwrap()["updated_at"], 10);
}

#[tokio::test]
async fn delete_of_absent_row_succeeds() {
    let remote = InMemoryRemote::new();
    let ack = remote
        .write(request(ChangeOp::Delete, "ghost", json!({"id": "ghost"})))
        .await
        .unwrap();
    assert_eq!(ack.data, None);
}

#[tokio::test]
async fn unreachable_writes_fail_and_are_not_logged() {
    let remote = InMemoryRemote::new();
    remote.set_reachable(false);

    let err = remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a"})))
        .await
        .unwrap_err();

    assert!(err.is_unreachable());
    assert!(remote.write_log().is_empty());
    assert!(remote.rows("works").is_empty());
}

#[tokio::test]
async fn rejections_are_logged_and_not_applied() {
    let remote = InMemoryRemote::new();
    remote.reject_id("a", "nope");

    let err = remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a"})))
        .await
        .unwrap_err();
    assert_eq!(err, RemoteError::Rejected("nope".into()));
    assert_eq!(remote.write_log().len(), 1);
    assert!(remote.row("works", "a").is_none());

    remote.clear_rejections();
    remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a"})))
        .await
        .unwrap();
    assert!(remote.row("works", "a").is_some());
}

#[tokio::test]
async fn op_rejection_spares_other_ops() {
    let remote = InMemoryRemote::new();
    remote.reject_op(ChangeOp::Update, "immutable");

    remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a", "title": "X"})))
        .await
        .unwrap();
    let err = remote
        .write(request(ChangeOp::Update, "a", json!({"id": "a", "title": "Y"})))
        .await
        .unwrap_err();

    assert_eq!(err, RemoteError::Rejected("immutable".into()));
    assert_eq!(remote.row("works", "a").unwrap()["title"], "X");
}

#[tokio::test]
async fn table_rejection_spares_other_tables() {
    let remote = InMemoryRemote::new();
    remote.reject_table("works", "read only");

    assert!(
        remote
            .write(request(ChangeOp::Insert, "a", json!({"id": "a"})))
            .await
            .is_err()
    );
    let mut note = request(ChangeOp::Insert, "n", json!({"id": "n"}));
    note.table = "notes".into();
    assert!(remote.write(note).await.is_ok());
}

// ── Subscriptions ────────────────────────────────────────────────

#[tokio::test]
async fn subscription_starts_with_current_rows() {
    let remote = InMemoryRemote::new();
    remote.seed("works", [json!({"id": "a"}), json!({"id": "b"})]);

    let mut stream = remote.subscribe("works", None).await.unwrap();
    assert_eq!(next_rows(&mut stream).await.unwrap().len(), 2);
}

#[tokio::test]
async fn subscription_publishes_every_change() {
    let remote = InMemoryRemote::new();
    let mut stream = remote.subscribe("works", None).await.unwrap();
    assert!(next_rows(&mut stream).await.unwrap().is_empty());

    remote.upsert_row("works", json!({"id": "a", "title": "X"}));
    assert_eq!(
        next_rows(&mut stream).await.unwrap(),
        vec![json!({"id": "a", "title": "X"})]
    );

    remote.delete_row("works", "a");
    assert!(next_rows(&mut stream).await.unwrap().is_empty());
}

#[tokio::test]
async fn subscription_applies_filter() {
    let remote = InMemoryRemote::new();
    remote.seed(
        "works",
        [
            json!({"id": "a", "status": "reading"}),
            json!({"id": "b", "status": "done"}),
        ],
    );
    let filter = Filter::new().eq("status", "reading");

    let mut stream = remote.subscribe("works", Some(&filter)).await.unwrap();
    let rows = next_rows(&mut stream).await.unwrap();
    assert_eq!(rows, vec![json!({"id": "a", "status": "reading"})]);
}

#[tokio::test]
async fn subscription_reports_unreachable_then_recovers() {
    let remote = InMemoryRemote::new();
    remote.seed("works", [json!({"id": "a"})]);
    let mut stream = remote.subscribe("works", None).await.unwrap();
    next_rows(&mut stream).await.unwrap();

    remote.set_reachable(false);
    assert!(next_rows(&mut stream).await.unwrap_err().is_unreachable());

    remote.set_reachable(true);
    assert_eq!(next_rows(&mut stream).await.unwrap().len(), 1);
}

#[tokio::test]
async fn paused_publishing_hides_accepted_writes() {
    let remote = InMemoryRemote::new();
    remote.pause_publishing();
    remote
        .write(request(ChangeOp::Insert, "a", json!({"id": "a"})))
        .await
        .unwrap();

    let mut stream = remote.subscribe("works", None).await.unwrap();
    assert!(next_rows(&mut stream).await.unwrap().is_empty());
    assert_eq!(remote.rows("works").len(), 1);

    remote.resume_publishing();
    assert_eq!(next_rows(&mut stream).await.unwrap().len(), 1);
}
