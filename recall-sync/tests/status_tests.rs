use pretty_assertions::assert_eq;
use recall_sync::{StatusTracker, SyncStatus};
use std::sync::Arc;
use std::thread;

#[test]
fn fresh_tracker_is_synced() {
    let tracker = StatusTracker::new();
    assert!(tracker.is_online());
    assert!(tracker.is_reachable("work"));
    assert_eq!(tracker.status(), SyncStatus::Synced);
}

#[test]
fn outstanding_changes_mean_syncing() {
    let tracker = StatusTracker::new();
    tracker.set_outstanding("work", 2);
    assert_eq!(tracker.outstanding("work"), 2);
    assert_eq!(tracker.status(), SyncStatus::Syncing);

    tracker.set_outstanding("work", 0);
    assert_eq!(tracker.status(), SyncStatus::Synced);
}

#[test]
fn concurrent_additions_are_all_counted() {
    let tracker = Arc::new(StatusTracker::new());
    let writers: Vec<_> = (0..8)
        .map(|_| {
            let tracker = Arc::clone(&tracker);
            thread::spawn(move || {
                for _ in 0..100 {
                    tracker.add_outstanding("work");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(tracker.outstanding("work"), 800);
    assert_eq!(tracker.status(), SyncStatus::Syncing);
}

#[test]
fn any_unreachable_kind_wins_over_syncing() {
    let tracker = StatusTracker::new();
    tracker.set_outstanding("work", 1);
    tracker.set_reachable("note", false);
    assert_eq!(tracker.status(), SyncStatus::ServerUnreachable);

    tracker.set_reachable("note", true);
    assert_eq!(tracker.status(), SyncStatus::Syncing);
}

#[test]
fn offline_wins_over_everything() {
    let tracker = StatusTracker::new();
    tracker.set_outstanding("work", 1);
    tracker.set_reachable("work", false);
    tracker.set_online(false);
    assert_eq!(tracker.status(), SyncStatus::Offline);

    tracker.set_online(true);
    assert_eq!(tracker.status(), SyncStatus::ServerUnreachable);
}

#[test]
fn serialized_names() {
    assert_eq!(SyncStatus::ServerUnreachable.to_string(), "server-unreachable");
    assert_eq!(
        serde_json::to_string(&SyncStatus::ServerUnreachable).unwrap(),
        "\"server-unreachable\""
    );
    let parsed: SyncStatus = serde_json::from_str("\"offline\"").unwrap();
    assert_eq!(parsed, SyncStatus::Offline);
}
