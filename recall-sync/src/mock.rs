//! In-memory authoritative store for testing.
//!
//! [`InMemoryRemote`] implements both [`RemoteSource`] and [`RemoteWriter`]
//! with the write semantics the engine expects from a real backend:
//! insert is an upsert, update is last-writer-wins on the version field
//! (an update of a missing row inserts it), and delete succeeds whether or
//! not the row exists. Reachability, rejections and publish lag are
//! controllable so tests can drive every error path.

use crate::remote::{
    RemoteError, RemoteResult, RemoteSource, RemoteWriter, SnapshotStream, WriteAck,
    WriteRequest,
};
use async_trait::async_trait;
use futures::StreamExt;
use recall_model::Filter;
use recall_types::ChangeOp;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

type Rows = BTreeMap<String, Value>;

#[derive(Default)]
struct Rejection {
    table: Option<String>,
    id: Option<String>,
    op: Option<ChangeOp>,
    message: String,
}

impl Rejection {
    fn applies_to(&self, request: &WriteRequest) -> bool {
        self.table.as_ref().is_none_or(|t| *t == request.table)
            && self.id.as_ref().is_none_or(|id| request.id == id.as_str())
            && self.op.is_none_or(|op| op == request.op)
    }
}

struct State {
    tables: HashMap<String, Rows>,
    /// What subscribers see. Trails `tables` while publishing is paused.
    published: HashMap<String, Vec<Value>>,
    reachable: bool,
    paused: bool,
    rejections: Vec<Rejection>,
    write_log: Vec<WriteRequest>,
    version_field: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    /// Bumped whenever subscribers should re-read.
    generation: watch::Sender<u64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    /// Makes the current rows visible to subscribers, unless paused.
    fn publish(&self, state: &mut State) {
        if state.paused {
            return;
        }
        state.published = state
            .tables
            .iter()
            .map(|(table, rows)| (table.clone(), rows.values().cloned().collect()))
            .collect();
        self.bump();
    }

    fn snapshot(&self, table: &str, filter: Option<&Filter>) -> RemoteResult<Vec<Value>> {
        let state = self.lock();
        if !state.reachable {
            return Err(RemoteError::Unreachable("in-memory remote is offline".into()));
        }
        Ok(state
            .published
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filter.is_none_or(|f| f.matches(row)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Authoritative store held in memory. Clones share state.
#[derive(Clone)]
pub struct InMemoryRemote {
    shared: Arc<Shared>,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    /// Creates a reachable, empty store versioning rows by `updated_at`.
    pub fn new() -> Self {
        Self::with_version_field(Some("updated_at"))
    }

    /// Creates a store using `field` for last-writer-wins, or no LWW at all.
    pub fn with_version_field(field: Option<&str>) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tables: HashMap::new(),
                    published: HashMap::new(),
                    reachable: true,
                    paused: false,
                    rejections: Vec::new(),
                    write_log: Vec::new(),
                    version_field: field.map(str::to_string),
                }),
                generation,
            }),
        }
    }

    // ── Data ─────────────────────────────────────────────────────

    /// Replaces all rows of `table`. Rows without a string `id` are skipped.
    pub fn seed(&self, table: &str, rows: impl IntoIterator<Item = Value>) {
        let mut state = self.shared.lock();
        let mut by_id = Rows::new();
        for row in rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                by_id.insert(id.to_string(), row);
            }
        }
        state.tables.insert(table.to_string(), by_id);
        self.shared.publish(&mut state);
    }

    /// Writes a row as another device would, bypassing rejection rules.
    pub fn upsert_row(&self, table: &str, row: Value) {
        let Some(id) = row.get("id").and_then(Value::as_str).map(str::to_string) else {
            return;
        };
        let mut state = self.shared.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        upsert(rows, &id, &row);
        self.shared.publish(&mut state);
    }

    /// Deletes a row as another device would.
    pub fn delete_row(&self, table: &str, id: &str) {
        let mut state = self.shared.lock();
        if let Some(rows) = state.tables.get_mut(table) {
            rows.remove(id);
        }
        self.shared.publish(&mut state);
    }

    /// Authoritative rows of `table`, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.shared
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A single authoritative row.
    pub fn row(&self, table: &str, id: &str) -> Option<Value> {
        self.shared.lock().tables.get(table)?.get(id).cloned()
    }

    // ── Failure injection ────────────────────────────────────────

    /// While unreachable, writes fail with [`RemoteError::Unreachable`] and
    /// subscriptions yield errors instead of rows.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
        self.shared.bump();
    }

    pub fn is_reachable(&self) -> bool {
        self.shared.lock().reachable
    }

    /// Rejects every write to `table`.
    pub fn reject_table(&self, table: &str, message: &str) {
        self.shared.lock().rejections.push(Rejection {
            table: Some(table.to_string()),
            message: message.to_string(),
            ..Rejection::default()
        });
    }

    /// Rejects every write to entity `id`, in any table.
    pub fn reject_id(&self, id: &str, message: &str) {
        self.shared.lock().rejections.push(Rejection {
            id: Some(id.to_string()),
            message: message.to_string(),
            ..Rejection::default()
        });
    }

    /// Rejects every write with operation `op`.
    pub fn reject_op(&self, op: ChangeOp, message: &str) {
        self.shared.lock().rejections.push(Rejection {
            op: Some(op),
            message: message.to_string(),
            ..Rejection::default()
        });
    }

    pub fn clear_rejections(&self) {
        self.shared.lock().rejections.clear();
    }

    /// Accepted writes stop reaching subscribers until
    /// [`resume_publishing`](Self::resume_publishing).
    pub fn pause_publishing(&self) {
        self.shared.lock().paused = true;
    }

    pub fn resume_publishing(&self) {
        let mut state = self.shared.lock();
        state.paused = false;
        self.shared.publish(&mut state);
    }

    /// Every write that reached the store, accepted or rejected, in order.
    pub fn write_log(&self) -> Vec<WriteRequest> {
        self.shared.lock().write_log.clone()
    }
}

fn upsert(rows: &mut Rows, id: &str, payload: &Value) -> Value {
    let row = rows
        .entry(id.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let (Some(target), Some(fields)) = (row.as_object_mut(), payload.as_object()) {
        for (k, v) in fields {
            target.insert(k.clone(), v.clone());
        }
        target.insert("id".into(), Value::String(id.to_string()));
    }
    row.clone()
}

/// Whether `incoming` carries an older version than `existing`.
fn is_stale(existing: &Value, incoming: &Value, version_field: Option<&str>) -> bool {
    let Some(field) = version_field else {
        return false;
    };
    match (
        incoming.get(field).and_then(Value::as_i64),
        existing.get(field).and_then(Value::as_i64),
    ) {
        (Some(incoming), Some(existing)) => incoming < existing,
        _ => false,
    }
}

#[async_trait]
impl RemoteSource for InMemoryRemote {
    async fn subscribe(
        &self,
        table: &str,
        filter: Option<&Filter>,
    ) -> RemoteResult<SnapshotStream> {
        let rx = self.shared.generation.subscribe();
        let shared = Arc::clone(&self.shared);
        let table = table.to_string();
        let filter = filter.cloned();

        let stream = futures::stream::unfold((rx, true), move |(mut rx, first)| {
            let shared = Arc::clone(&shared);
            let table = table.clone();
            let filter = filter.clone();
            async move {
                if !first {
                    rx.changed().await.ok()?;
                }
                let item = shared.snapshot(&table, filter.as_ref());
                Some((item, (rx, false)))
            }
        });
        Ok(stream.boxed())
    }
}

#[async_trait]
impl RemoteWriter for InMemoryRemote {
    async fn write(&self, request: WriteRequest) -> RemoteResult<WriteAck> {
        let mut state = self.shared.lock();
        if !state.reachable {
            return Err(RemoteError::Unreachable("in-memory remote is offline".into()));
        }
        state.write_log.push(request.clone());

        if let Some(rejection) = state.rejections.iter().find(|r| r.applies_to(&request)) {
            return Err(RemoteError::Rejected(rejection.message.clone()));
        }

        let version_field = state.version_field.clone();
        let id = request.id.to_string();
        let rows = state.tables.entry(request.table.clone()).or_default();
        let data = match request.op {
            ChangeOp::Insert => Some(upsert(rows, &id, &request.payload)),
            ChangeOp::Update => {
                let stale = rows.get(&id).is_some_and(|existing| {
                    is_stale(existing, &request.payload, version_field.as_deref())
                });
                if stale {
                    debug!("ignoring stale update of {}[{id}]", request.table);
                    rows.get(&id).cloned()
                } else {
                    Some(upsert(rows, &id, &request.payload))
                }
            }
            ChangeOp::Delete => {
                rows.remove(&id);
                None
            }
        };

        self.shared.publish(&mut state);
        Ok(WriteAck { data })
    }
}
