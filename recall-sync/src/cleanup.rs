//! Garbage Collector: retires Local Changes once the mirror reflects them.

use crate::blocking;
use crate::mirror::RemoteMirror;
use crate::observer::{ChangeNotifier, ChangeReason};
use recall_model::Entity;
use recall_storage::PendingLog;
use recall_types::{ChangeOp, ChangeSeq, ChangeStatus, LocalChange};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

/// Mirror generations at which synced changes were acknowledged.
///
/// A snapshot received after a change was acknowledged had the chance to
/// reflect it. Acknowledgements of an earlier run are not recorded: they
/// predate every snapshot of this run, so they count as generation 0.
#[derive(Debug, Clone, Default)]
pub struct AckLedger {
    applied: u64,
    acked: HashMap<ChangeSeq, u64>,
}

impl AckLedger {
    /// A ledger judged against a mirror at generation `applied`.
    pub fn new(applied: u64) -> Self {
        Self {
            applied,
            acked: HashMap::new(),
        }
    }

    pub fn with_ack(mut self, seq: ChangeSeq, generation: u64) -> Self {
        self.acked.insert(seq, generation);
        self
    }

    /// Whether the applied snapshot was received after `seq` was
    /// acknowledged.
    pub fn reflects(&self, seq: ChangeSeq) -> bool {
        self.applied > self.acked.get(&seq).copied().unwrap_or(0)
    }
}

/// Selects the Local Changes that the mirror has caught up with.
///
/// Only `synced` entries are considered: unsent or in-flight entries are
/// never retired here. An insert or update of id X is settled when
/// - X's mirrored version marker is at least the change's wall time, or
/// - X has no version marker in the mirror, and either every field the
///   change touched equals the mirrored value or `acks` shows a snapshot
///   received after the acknowledgement. In the second case the mirror
///   holds whatever the remote store settled on, even if another write
///   overtook the change.
///
/// A delete is settled once X is gone from the mirror. A settled change is
/// retired together with the synced entries of X recorded before it, which
/// were delivered first.
pub fn plan_cleanup(
    mirror: &[Entity],
    changes: &[LocalChange],
    version_field: Option<&str>,
    acks: &AckLedger,
) -> Vec<ChangeSeq> {
    let rows: HashMap<&str, &Entity> = mirror.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut ordered: Vec<&LocalChange> = changes.iter().collect();
    ordered.sort_by_key(|c| c.order_key());
    let mut chains: HashMap<&str, Vec<&LocalChange>> = HashMap::new();
    for change in ordered {
        chains.entry(change.entity_id.as_str()).or_default().push(change);
    }

    let mut retired = Vec::new();
    for (id, chain) in chains {
        let row = rows.get(id).copied();
        for (i, change) in chain.iter().enumerate() {
            if change.status != ChangeStatus::Synced {
                continue;
            }
            let caught_up = match change.op {
                ChangeOp::Insert | ChangeOp::Update => settled(row, change, version_field, acks),
                ChangeOp::Delete => row.is_none(),
            };
            if caught_up {
                retired.extend(
                    chain[..=i]
                        .iter()
                        .filter(|c| c.status == ChangeStatus::Synced)
                        .map(|c| c.seq),
                );
            }
        }
    }

    retired.sort();
    retired.dedup();
    retired
}

fn settled(
    row: Option<&Entity>,
    change: &LocalChange,
    version_field: Option<&str>,
    acks: &AckLedger,
) -> bool {
    if let Some(version) = row.zip(version_field).and_then(|(row, f)| row.version(f)) {
        return version >= change.timestamp.wall_time() as i64;
    }
    acks.reflects(change.seq) || row.is_some_and(|row| fields_match(row, change))
}

fn fields_match(row: &Entity, change: &LocalChange) -> bool {
    change
        .touched_fields()
        .filter(|(name, _)| name.as_str() != "id")
        .all(|(name, value)| row.field(name).unwrap_or(&serde_json::Value::Null) == value)
}

/// Runs cleanup passes for one kind.
///
/// [`schedule`](Self::schedule) coalesces bursts of mirror refreshes into one
/// pass after a quiet window. Whatever triggers a pass, passes of one kind
/// never overlap: each holds the kind's pass lock for its whole duration.
pub struct GarbageCollector {
    kind: String,
    version_field: Option<String>,
    mirror: Arc<RemoteMirror>,
    log: Arc<PendingLog>,
    notifier: Arc<ChangeNotifier>,
    debounce: Duration,
    generation: AtomicU64,
    acks: Arc<Mutex<HashMap<ChangeSeq, u64>>>,
    pass_lock: tokio::sync::Mutex<()>,
}

impl GarbageCollector {
    pub fn new(
        kind: &str,
        version_field: Option<String>,
        mirror: Arc<RemoteMirror>,
        log: Arc<PendingLog>,
        notifier: Arc<ChangeNotifier>,
        debounce: Duration,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            version_field,
            mirror,
            log,
            notifier,
            debounce,
            generation: AtomicU64::new(0),
            acks: Arc::new(Mutex::new(HashMap::new())),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Notes that `seq` was acknowledged by the remote store. Must be called
    /// before the entry is marked `synced`.
    pub fn record_ack(&self, seq: ChangeSeq) {
        let generation = self.mirror.received_generation();
        lock_acks(&self.acks).insert(seq, generation);
    }

    /// Requests a pass after the debounce window. A later request within the
    /// window supersedes this one. Outside a Tokio runtime the request is
    /// dropped.
    pub fn schedule(self: &Arc<Self>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("{}: cleanup requested outside a runtime, skipped", self.kind);
            return;
        };
        let collector = Arc::clone(self);
        runtime.spawn(async move {
            tokio::time::sleep(collector.debounce).await;
            if collector.generation.load(Ordering::SeqCst) == generation {
                collector.collect_now().await;
            }
        });
    }

    /// Runs a pass now, waiting for any pass in progress first. Returns the
    /// number of retired entries. Faults are logged, never returned.
    pub async fn collect_now(&self) -> usize {
        let _pass = self.pass_lock.lock().await;

        let (generation, mirror) = self.mirror.generation_and_snapshot();
        let log = Arc::clone(&self.log);
        let version_field = self.version_field.clone();
        let acks = Arc::clone(&self.acks);
        let result = blocking(move || {
            let changes = log.scan()?;
            // Read after the scan: every entry seen `synced` has its ack here.
            let ledger = AckLedger {
                applied: generation,
                acked: lock_acks(&acks).clone(),
            };
            let retired = plan_cleanup(&mirror, &changes, version_field.as_deref(), &ledger);
            let removed = log.remove(&retired)?;
            let mut acks = lock_acks(&acks);
            for seq in &retired {
                acks.remove(seq);
            }
            Ok(removed)
        })
        .await;

        match result {
            Ok(0) => 0,
            Ok(removed) => {
                debug!("{}: cleanup retired {removed} changes", self.kind);
                self.notifier.notify(&self.kind, ChangeReason::Cleanup);
                removed
            }
            Err(e) => {
                warn!("{}: cleanup pass failed: {e}", self.kind);
                0
            }
        }
    }
}

fn lock_acks(acks: &Mutex<HashMap<ChangeSeq, u64>>) -> MutexGuard<'_, HashMap<ChangeSeq, u64>> {
    acks.lock().unwrap_or_else(|e| e.into_inner())
}
