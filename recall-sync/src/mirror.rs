//! Remote Mirror: local read-only cache of one kind, fed by a live
//! subscription to the remote store.

use crate::blocking;
use crate::error::SyncResult;
use crate::remote::{RemoteError, SnapshotStream};
use futures::StreamExt;
use recall_model::{Entity, EntitySchema};
use recall_storage::MirrorTable;
use recall_types::LocalClock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// What [`RemoteMirror::run`] observed on its subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorUpdate {
    /// A snapshot replaced the mirror, possibly with zero rows.
    Applied { rows: usize },
    /// The subscription reported an error; the last snapshot is still served.
    Disconnected(RemoteError),
}

struct Applied {
    rows: Arc<Vec<Entity>>,
    generation: u64,
}

/// Last confirmed snapshot of one kind.
///
/// Rows change only through [`apply_snapshot`](Self::apply_snapshot): local
/// code never edits them. Readers get a shared, immutable snapshot, so a
/// refresh never disturbs a merge already in progress.
///
/// Every snapshot received in this run gets the next generation number.
/// Generation 0 is the snapshot persisted by an earlier run.
pub struct RemoteMirror {
    kind: String,
    version_field: Option<String>,
    table: MirrorTable,
    applied: RwLock<Applied>,
    received: AtomicU64,
    connected: AtomicBool,
    clock: Arc<LocalClock>,
}

impl RemoteMirror {
    /// Opens the mirror of `schema`, serving the persisted snapshot until
    /// the first remote snapshot arrives.
    pub fn open(schema: &EntitySchema, table: MirrorTable, clock: Arc<LocalClock>) -> SyncResult<Self> {
        let rows = table.rows()?;
        let mirror = Self {
            kind: schema.kind.clone(),
            version_field: schema.version_field.clone(),
            table,
            applied: RwLock::new(Applied {
                rows: Arc::new(Vec::new()),
                generation: 0,
            }),
            received: AtomicU64::new(0),
            connected: AtomicBool::new(false),
            clock,
        };
        mirror.observe_versions(&rows);
        debug!("{}: mirror opened with {} persisted rows", mirror.kind, rows.len());
        mirror.replace(rows, 0);
        Ok(mirror)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The current snapshot. Cheap: shares the underlying rows.
    pub fn snapshot(&self) -> Arc<Vec<Entity>> {
        self.generation_and_snapshot().1
    }

    /// The current snapshot together with its generation, read atomically.
    pub fn generation_and_snapshot(&self) -> (u64, Arc<Vec<Entity>>) {
        let applied = self.applied.read().unwrap_or_else(|e| e.into_inner());
        (applied.generation, Arc::clone(&applied.rows))
    }

    /// Generation of the latest snapshot received, applied or not.
    pub fn received_generation(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Option<Entity> {
        self.snapshot().iter().find(|e| e.id == id).cloned()
    }

    /// Whether the last subscription event was a snapshot rather than an
    /// error.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            info!("{}: mirror subscription lost, serving last snapshot", self.kind);
        }
    }

    /// Replaces the mirror with a full row set from the remote store.
    ///
    /// An empty set is applied like any other. Rows without a string `id`
    /// are skipped. The in-memory snapshot is replaced before persisting, so
    /// readers see the new rows even if the persisted copy could not be
    /// written.
    pub fn apply_snapshot(&self, rows: Vec<Value>) -> SyncResult<usize> {
        let generation = self.receive();
        self.apply(rows, generation)
    }

    fn receive(&self) -> u64 {
        self.received.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn apply(&self, rows: Vec<Value>, generation: u64) -> SyncResult<usize> {
        let mut entities = Vec::with_capacity(rows.len());
        for row in rows {
            match Entity::from_row(&self.kind, &row) {
                Some(entity) => entities.push(entity),
                None => warn!("{}: skipping remote row without a string id", self.kind),
            }
        }

        self.observe_versions(&entities);
        let count = entities.len();
        let persisted = entities.clone();
        self.replace(entities, generation);
        self.connected.store(true, Ordering::SeqCst);

        self.table.replace_all(&persisted)?;
        debug!("{}: applied snapshot of {count} rows", self.kind);
        Ok(count)
    }

    /// Consumes a subscription until it ends, applying every snapshot and
    /// reporting each event to `on_update`.
    pub async fn run<F>(self: Arc<Self>, mut stream: SnapshotStream, on_update: F)
    where
        F: Fn(MirrorUpdate) + Send + Sync,
    {
        while let Some(item) = stream.next().await {
            match item {
                Ok(rows) => {
                    let generation = self.receive();
                    let mirror = Arc::clone(&self);
                    match blocking(move || mirror.apply(rows, generation)).await {
                        Ok(count) => on_update(MirrorUpdate::Applied { rows: count }),
                        Err(e) => {
                            warn!("{}: snapshot not persisted: {e}", self.kind);
                            on_update(MirrorUpdate::Applied {
                                rows: self.snapshot().len(),
                            });
                        }
                    }
                }
                Err(e) => {
                    self.mark_disconnected();
                    on_update(MirrorUpdate::Disconnected(e));
                }
            }
        }
        self.mark_disconnected();
        debug!("{}: mirror subscription ended", self.kind);
    }

    fn replace(&self, rows: Vec<Entity>, generation: u64) {
        *self.applied.write().unwrap_or_else(|e| e.into_inner()) = Applied {
            rows: Arc::new(rows),
            generation,
        };
    }

    /// Local edits made after a remote version must sort after it.
    fn observe_versions(&self, rows: &[Entity]) {
        let Some(field) = self.version_field.as_deref() else {
            return;
        };
        if let Some(max) = rows.iter().filter_map(|e| e.version(field)).max()
            && max > 0
        {
            self.clock.observe(max as u64);
        }
    }
}
