use pretty_assertions::assert_eq;
use recall_model::EntitySchema;
use recall_storage::{LocalDb, PendingLog};
use recall_sync::mock::InMemoryRemote;
use recall_sync::{
    ChangeNotifier, ChangeReason, DispatchSetup, GarbageCollector, RemoteMirror, StatusTracker,
    SyncConfig, SyncError, WriteDispatcher,
};
use recall_types::{ChangeOp, ChangeSeq, ChangeStatus, EntityId, LocalClock};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct Harness {
    db: LocalDb,
    log: Arc<PendingLog>,
    remote: InMemoryRemote,
    status: Arc<StatusTracker>,
    notifier: Arc<ChangeNotifier>,
    clock: LocalClock,
}

impl Harness {
    fn new() -> Self {
        let db = LocalDb::open_in_memory().unwrap();
        let log = Arc::new(db.pending_log("works").unwrap());
        Self {
            db,
            log,
            remote: InMemoryRemote::new(),
            status: Arc::new(StatusTracker::new()),
            notifier: ChangeNotifier::new(),
            clock: LocalClock::new(),
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            // Long pauses: only flushes drive retries here.
            cleanup_debounce_ms: 60_000,
            retry_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            ..SyncConfig::default()
        }
    }

    fn spawn(&self) -> WriteDispatcher {
        self.spawn_with(Self::config())
    }

    fn spawn_with(&self, config: SyncConfig) -> WriteDispatcher {
        let schema = EntitySchema::new("work", "works");
        let mirror = Arc::new(
            RemoteMirror::open(
                &schema,
                self.db.mirror_table(&schema).unwrap(),
                Arc::new(LocalClock::new()),
            )
            .unwrap(),
        );
        let collector = Arc::new(GarbageCollector::new(
            "work",
            None,
            mirror,
            Arc::clone(&self.log),
            Arc::clone(&self.notifier),
            config.cleanup_debounce(),
        ));
        WriteDispatcher::spawn(DispatchSetup {
            kind: "work".into(),
            table: "works".into(),
            log: Arc::clone(&self.log),
            writer: Arc::new(self.remote.clone()),
            status: Arc::clone(&self.status),
            notifier: Arc::clone(&self.notifier),
            collector,
            config,
        })
    }

    fn append(&self, id: &str, op: ChangeOp, payload: Value) -> ChangeSeq {
        self.log
            .append(&EntityId::from(id), op, &payload, self.clock.next())
            .unwrap()
            .seq
    }

    fn status_of(&self, seq: ChangeSeq) -> ChangeStatus {
        self.log.get(seq).unwrap().unwrap().status
    }

    /// Waits for the worker to move `seq` to `status` on its own.
    async fn wait_for(&self, seq: ChangeSeq, status: ChangeStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.status_of(seq) != status {
            assert!(
                tokio::time::Instant::now() < deadline,
                "{seq} stuck at {}",
                self.status_of(seq)
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn written(&self) -> Vec<(ChangeOp, String)> {
        self.remote
            .write_log()
            .into_iter()
            .map(|w| (w.op, w.id.to_string()))
            .collect()
    }
}

// ── Delivery ─────────────────────────────────────────────────────

#[tokio::test]
async fn delivers_pending_changes_in_order() {
    let h = Harness::new();
    let insert = h.append("a", ChangeOp::Insert, json!({"title": "X"}));
    let update = h.append("a", ChangeOp::Update, json!({"title": "Y"}));
    let other = h.append("b", ChangeOp::Insert, json!({"title": "B"}));

    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();

    assert_eq!(
        h.written(),
        vec![
            (ChangeOp::Insert, "a".to_string()),
            (ChangeOp::Update, "a".to_string()),
            (ChangeOp::Insert, "b".to_string()),
        ]
    );
    for seq in [insert, update, other] {
        assert_eq!(h.status_of(seq), ChangeStatus::Synced);
    }
    assert_eq!(h.remote.row("works", "a"), Some(json!({"id": "a", "title": "Y"})));
    assert_eq!(h.status.outstanding("work"), 0);
}

#[tokio::test]
async fn changes_recorded_after_start_are_delivered() {
    let h = Harness::new();
    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();

    let seq = h.append("a", ChangeOp::Insert, json!({"title": "X"}));
    dispatcher.enqueue(seq);
    dispatcher.flush().await.unwrap();

    assert_eq!(h.status_of(seq), ChangeStatus::Synced);
}

#[tokio::test]
async fn batch_limit_does_not_leave_work_behind() {
    let h = Harness::new();
    let seqs: Vec<ChangeSeq> = (0..5)
        .map(|i| h.append(&format!("e{i}"), ChangeOp::Insert, json!({"n": i})))
        .collect();

    let dispatcher = h.spawn_with(SyncConfig {
        dispatch_batch_size: 2,
        ..Harness::config()
    });
    dispatcher.flush().await.unwrap();

    assert_eq!(h.remote.write_log().len(), 5);
    assert!(seqs.iter().all(|&s| h.status_of(s) == ChangeStatus::Synced));
}

#[tokio::test]
async fn in_flight_entries_are_resent_after_restart() {
    let h = Harness::new();
    let seq = h.append("a", ChangeOp::Insert, json!({"title": "X"}));
    h.log.set_status(seq, ChangeStatus::Syncing, None).unwrap();

    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();

    assert_eq!(h.status_of(seq), ChangeStatus::Synced);
    assert_eq!(h.remote.write_log().len(), 1);
}

#[tokio::test]
async fn every_delivery_notifies_status_change() {
    let h = Harness::new();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let _handle = h
        .notifier
        .on_change(move |e| sink.lock().unwrap().push(e.reason));

    h.append("a", ChangeOp::Insert, json!({}));
    h.append("b", ChangeOp::Insert, json!({}));
    h.spawn().flush().await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|r| **r == ChangeReason::StatusChanged)
            .count(),
        2
    );
}

// ── Rejection ────────────────────────────────────────────────────

#[tokio::test]
async fn rejected_insert_holds_back_its_entity_only() {
    let h = Harness::new();
    h.remote.reject_id("a", "title required");
    let insert = h.append("a", ChangeOp::Insert, json!({}));
    let update = h.append("a", ChangeOp::Update, json!({"title": "late"}));
    let other = h.append("b", ChangeOp::Insert, json!({"title": "B"}));

    h.spawn().flush().await.unwrap();

    let rejected = h.log.get(insert).unwrap().unwrap();
    assert_eq!(rejected.status, ChangeStatus::Error);
    assert_eq!(rejected.error.as_deref(), Some("title required"));
    assert_eq!(h.status_of(update), ChangeStatus::Pending);
    assert_eq!(h.status_of(other), ChangeStatus::Synced);
    assert_eq!(
        h.written(),
        vec![
            (ChangeOp::Insert, "a".to_string()),
            (ChangeOp::Insert, "b".to_string()),
        ]
    );
}

#[tokio::test]
async fn rejected_update_does_not_block_later_updates() {
    let h = Harness::new();
    h.remote.seed("works", [json!({"id": "a", "title": "T"})]);
    h.remote.reject_id("a", "conflict");
    let first = h.append("a", ChangeOp::Update, json!({"title": "bad"}));

    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();
    assert_eq!(h.status_of(first), ChangeStatus::Error);

    h.remote.clear_rejections();
    let second = h.append("a", ChangeOp::Update, json!({"title": "good"}));
    dispatcher.enqueue(second);
    dispatcher.flush().await.unwrap();

    assert_eq!(h.status_of(first), ChangeStatus::Error);
    assert_eq!(h.status_of(second), ChangeStatus::Synced);
    assert_eq!(h.remote.row("works", "a").unwrap()["title"], "good");
}

#[tokio::test]
async fn change_queued_behind_rejected_update_goes_out_in_same_pass() {
    let h = Harness::new();
    h.remote.seed("works", [json!({"id": "a", "title": "T"})]);
    h.remote.reject_op(ChangeOp::Update, "conflict");
    let update = h.append("a", ChangeOp::Update, json!({"title": "bad"}));
    let delete = h.append("a", ChangeOp::Delete, json!({}));

    let _dispatcher = h.spawn();
    h.wait_for(delete, ChangeStatus::Synced).await;

    assert_eq!(h.status_of(update), ChangeStatus::Error);
    assert_eq!(h.remote.row("works", "a"), None);
    assert_eq!(
        h.written(),
        vec![
            (ChangeOp::Update, "a".to_string()),
            (ChangeOp::Delete, "a".to_string()),
        ]
    );
}

#[tokio::test]
async fn rejected_changes_are_not_outstanding() {
    let h = Harness::new();
    h.remote.reject_table("works", "read only");
    h.append("a", ChangeOp::Insert, json!({}));

    h.spawn().flush().await.unwrap();
    assert_eq!(h.status.outstanding("work"), 0);
    assert!(h.status.is_reachable("work"));
}

// ── Unreachable & offline ────────────────────────────────────────

#[tokio::test]
async fn unreachable_remote_leaves_change_pending() {
    let h = Harness::new();
    h.remote.set_reachable(false);
    let seq = h.append("a", ChangeOp::Insert, json!({"title": "X"}));

    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();

    let change = h.log.get(seq).unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Pending);
    assert_eq!(change.retry_count, 1);
    assert!(!h.status.is_reachable("work"));
    assert_eq!(h.status.outstanding("work"), 1);

    h.remote.set_reachable(true);
    dispatcher.flush().await.unwrap();

    assert_eq!(h.status_of(seq), ChangeStatus::Synced);
    assert!(h.status.is_reachable("work"));
}

#[tokio::test]
async fn unreachable_stops_the_pass() {
    let h = Harness::new();
    h.remote.set_reachable(false);
    let a = h.append("a", ChangeOp::Insert, json!({}));
    let b = h.append("b", ChangeOp::Insert, json!({}));

    h.spawn().flush().await.unwrap();

    assert_eq!(h.log.get(a).unwrap().unwrap().retry_count, 1);
    assert_eq!(h.log.get(b).unwrap().unwrap().retry_count, 0);
}

#[tokio::test]
async fn retry_count_stops_growing_at_the_limit() {
    let h = Harness::new();
    h.remote.set_reachable(false);
    let seq = h.append("a", ChangeOp::Insert, json!({}));

    let dispatcher = h.spawn_with(SyncConfig {
        max_retries: 2,
        ..Harness::config()
    });
    for _ in 0..4 {
        dispatcher.flush().await.unwrap();
    }

    let change = h.log.get(seq).unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Pending);
    assert_eq!(change.retry_count, 2);
}

#[tokio::test]
async fn offline_device_sends_nothing() {
    let h = Harness::new();
    h.status.set_online(false);
    let seq = h.append("a", ChangeOp::Insert, json!({}));

    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();
    assert!(h.remote.write_log().is_empty());
    assert_eq!(h.status_of(seq), ChangeStatus::Pending);

    h.status.set_online(true);
    dispatcher.wake();
    dispatcher.flush().await.unwrap();
    assert_eq!(h.status_of(seq), ChangeStatus::Synced);
}

// ── Collapsing ───────────────────────────────────────────────────

#[tokio::test]
async fn unsent_insert_then_delete_is_dropped_locally() {
    let h = Harness::new();
    h.append("a", ChangeOp::Insert, json!({"title": "X"}));
    h.append("a", ChangeOp::Update, json!({"title": "Y"}));
    h.append("a", ChangeOp::Delete, json!({}));
    let kept = h.append("b", ChangeOp::Insert, json!({}));

    h.spawn().flush().await.unwrap();

    assert_eq!(h.written(), vec![(ChangeOp::Insert, "b".to_string())]);
    assert_eq!(h.log.count().unwrap(), 1);
    assert_eq!(h.status_of(kept), ChangeStatus::Synced);
}

#[tokio::test]
async fn interrupted_insert_then_delete_is_sent_not_dropped() {
    let h = Harness::new();
    let insert = h.append("a", ChangeOp::Insert, json!({"title": "X"}));
    // The previous run reached the remote store but stopped before the ack
    // was recorded.
    h.remote.upsert_row("works", json!({"id": "a", "title": "X"}));
    h.log.set_status(insert, ChangeStatus::Syncing, None).unwrap();
    let delete = h.append("a", ChangeOp::Delete, json!({}));

    h.spawn().flush().await.unwrap();

    assert_eq!(h.remote.row("works", "a"), None);
    assert_eq!(
        h.written(),
        vec![
            (ChangeOp::Insert, "a".to_string()),
            (ChangeOp::Delete, "a".to_string()),
        ]
    );
    assert_eq!(h.status_of(delete), ChangeStatus::Synced);
}

#[tokio::test]
async fn delete_after_delivered_insert_is_sent() {
    let h = Harness::new();
    let insert = h.append("a", ChangeOp::Insert, json!({"title": "X"}));
    let dispatcher = h.spawn();
    dispatcher.flush().await.unwrap();
    assert_eq!(h.status_of(insert), ChangeStatus::Synced);

    let delete = h.append("a", ChangeOp::Delete, json!({}));
    dispatcher.enqueue(delete);
    dispatcher.flush().await.unwrap();

    assert_eq!(h.status_of(delete), ChangeStatus::Synced);
    assert_eq!(h.remote.row("works", "a"), None);
    let request = h.remote.write_log().pop().unwrap();
    assert_eq!(request.payload, json!({"id": "a"}));
}

// ── Lifecycle ────────────────────────────────────────────────────

#[tokio::test]
async fn flush_after_shutdown_fails() {
    let h = Harness::new();
    let dispatcher = h.spawn();
    dispatcher.shutdown();

    let err = dispatcher.flush().await.unwrap_err();
    assert!(matches!(err, SyncError::ChannelClosed));
}
