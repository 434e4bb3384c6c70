//! One entity kind: its mirror, pending log, dispatcher and collector, and
//! the local write and merged read operations over them.

use crate::cleanup::GarbageCollector;
use crate::config::SyncConfig;
use crate::dispatcher::WriteDispatcher;
use crate::error::{SyncError, SyncResult};
use crate::merge::{MergedRow, merge};
use crate::mirror::RemoteMirror;
use crate::observer::{ChangeNotifier, ChangeReason};
use crate::status::StatusTracker;
use recall_model::{Entity, EntitySchema, Filter, KindHandler, ValidationError};
use recall_storage::{LocalDb, PendingLog};
use recall_types::{
    ChangeOp, ChangeSeq, ChangeStatus, EntityId, HybridTimestamp, LocalChange, LocalClock,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// How a kind was registered on the context builder.
pub(crate) struct KindRegistration {
    pub schema: EntitySchema,
    pub handler: Option<Arc<dyn KindHandler>>,
    pub filter: Option<Filter>,
}

/// Device-wide services every collection shares.
pub(crate) struct Shared {
    pub clock: Arc<LocalClock>,
    pub notifier: Arc<ChangeNotifier>,
    pub status: Arc<StatusTracker>,
    pub config: SyncConfig,
}

/// The sync engine instance of one entity kind.
///
/// Local writes are recorded before they return and never wait on the
/// network. Reads never fail: on a storage fault they serve the last merged
/// view computed successfully.
pub struct Collection {
    schema: EntitySchema,
    handler: Option<Arc<dyn KindHandler>>,
    filter: Option<Filter>,
    mirror: Arc<RemoteMirror>,
    log: Arc<PendingLog>,
    collector: Arc<GarbageCollector>,
    dispatcher: Mutex<Option<Arc<WriteDispatcher>>>,
    clock: Arc<LocalClock>,
    notifier: Arc<ChangeNotifier>,
    status: Arc<StatusTracker>,
    last_good: Mutex<Arc<Vec<Value>>>,
}

impl Collection {
    pub(crate) fn open(
        db: &LocalDb,
        registration: KindRegistration,
        log: Arc<PendingLog>,
        shared: &Shared,
    ) -> SyncResult<Self> {
        let KindRegistration {
            schema,
            handler,
            filter,
        } = registration;

        let table = db.mirror_table(&schema)?;
        let mirror = Arc::new(RemoteMirror::open(&schema, table, Arc::clone(&shared.clock))?);
        let collector = Arc::new(GarbageCollector::new(
            &schema.kind,
            schema.version_field.clone(),
            Arc::clone(&mirror),
            Arc::clone(&log),
            Arc::clone(&shared.notifier),
            shared.config.cleanup_debounce(),
        ));

        Ok(Self {
            schema,
            handler,
            filter,
            mirror,
            log,
            collector,
            dispatcher: Mutex::new(None),
            clock: Arc::clone(&shared.clock),
            notifier: Arc::clone(&shared.notifier),
            status: Arc::clone(&shared.status),
            last_good: Mutex::new(Arc::new(Vec::new())),
        })
    }

    pub fn kind(&self) -> &str {
        &self.schema.kind
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    /// Filter the mirror subscription is narrowed by, if any.
    pub fn subscription_filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn mirror(&self) -> &Arc<RemoteMirror> {
        &self.mirror
    }

    pub fn collector(&self) -> &Arc<GarbageCollector> {
        &self.collector
    }

    pub(crate) fn log_handle(&self) -> &Arc<PendingLog> {
        &self.log
    }

    pub(crate) fn attach_dispatcher(&self, dispatcher: Arc<WriteDispatcher>) {
        *self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    pub(crate) fn detach_dispatcher(&self) -> Option<Arc<WriteDispatcher>> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn dispatcher(&self) -> Option<Arc<WriteDispatcher>> {
        self.dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    // ── Local writes ─────────────────────────────────────────────

    /// Records a new entity. Uses the payload's `id` if it has one,
    /// otherwise generates one.
    ///
    /// The entity is visible in the merged view as soon as this returns; the
    /// remote write happens in the background.
    pub fn create_local(&self, payload: Value) -> SyncResult<Entity> {
        let Value::Object(mut fields) = payload else {
            return Err(ValidationError::NotAnObject.into());
        };
        let id = match fields.remove("id") {
            None | Some(Value::Null) => EntityId::new(),
            Some(Value::String(id)) if !id.is_empty() => EntityId::from(id),
            Some(_) => {
                return Err(ValidationError::WrongType {
                    field: "id".into(),
                    expected: "a non-empty string",
                }
                .into());
            }
        };

        let mut payload = Value::Object(fields);
        self.schema.validate_insert(&payload)?;
        if let Some(handler) = &self.handler {
            handler
                .validate_insert(&payload)
                .map_err(ValidationError::Rejected)?;
        }

        let timestamp = self.clock.next();
        self.stamp_version(&mut payload, timestamp);
        let change = self.log.append(&id, ChangeOp::Insert, &payload, timestamp)?;
        self.recorded(&change);

        Ok(Entity::new(id.into_string(), self.kind(), payload))
    }

    /// Records a partial update of a visible entity.
    pub fn update_local(&self, id: &EntityId, patch: Value) -> SyncResult<()> {
        let Value::Object(mut fields) = patch else {
            return Err(ValidationError::NotAnObject.into());
        };
        fields.remove("id");
        if !self.contains(id)? {
            return Err(SyncError::NotFound(id.to_string()));
        }

        let mut patch = Value::Object(fields);
        self.schema.validate_patch(&patch)?;
        if let Some(handler) = &self.handler {
            handler
                .validate_patch(&patch)
                .map_err(ValidationError::Rejected)?;
        }

        let timestamp = self.clock.next();
        self.stamp_version(&mut patch, timestamp);
        let change = self.log.append(id, ChangeOp::Update, &patch, timestamp)?;
        self.recorded(&change);
        Ok(())
    }

    /// Records the deletion of a visible entity.
    pub fn delete_local(&self, id: &EntityId) -> SyncResult<()> {
        if !self.contains(id)? {
            return Err(SyncError::NotFound(id.to_string()));
        }
        let timestamp = self.clock.next();
        let change = self
            .log
            .append(id, ChangeOp::Delete, &Value::Object(Map::new()), timestamp)?;
        self.recorded(&change);
        Ok(())
    }

    /// Whether `id` is currently visible in the merged view.
    pub fn contains(&self, id: &EntityId) -> SyncResult<bool> {
        Ok(self.merged_row(id.as_str())?.is_some())
    }

    fn stamp_version(&self, payload: &mut Value, timestamp: HybridTimestamp) {
        if let (Some(field), Some(fields)) =
            (self.schema.version_field.as_ref(), payload.as_object_mut())
        {
            fields.insert(field.clone(), Value::from(timestamp.wall_time()));
        }
    }

    fn recorded(&self, change: &LocalChange) {
        debug!(
            "{}: recorded {} {} of {}",
            self.kind(),
            change.seq,
            change.op,
            change.entity_id
        );
        self.status.add_outstanding(self.kind());
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.enqueue(change.seq);
        }
        self.notifier.notify(self.kind(), ChangeReason::LocalWrite);
    }

    // ── Merged reads ─────────────────────────────────────────────

    /// The merged view of this kind, narrowed by `filter`.
    pub fn get_merged(&self, filter: Option<&Filter>) -> Vec<Value> {
        let rows = match self.log.scan() {
            Ok(changes) => {
                let rows: Vec<Value> = merge(self.kind(), &self.mirror.snapshot(), &changes)
                    .iter()
                    .map(|row| self.present(row))
                    .collect();
                let rows = Arc::new(rows);
                *self.last_good.lock().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&rows);
                rows
            }
            Err(e) => {
                warn!("{}: serving last merged view: {e}", self.kind());
                self.last_good()
            }
        };
        rows.iter()
            .filter(|row| filter.is_none_or(|f| f.matches(row)))
            .cloned()
            .collect()
    }

    /// A single merged entity, or `None` if it is not visible.
    pub fn get_merged_by_id(&self, id: &str) -> Option<Value> {
        match self.merged_row(id) {
            Ok(row) => row.map(|row| self.present(&row)),
            Err(e) => {
                warn!("{}: serving {id} from last merged view: {e}", self.kind());
                self.last_good()
                    .iter()
                    .find(|row| row.get("id").and_then(Value::as_str) == Some(id))
                    .cloned()
            }
        }
    }

    /// Merges only the rows of `id`; merging is independent per id.
    fn merged_row(&self, id: &str) -> SyncResult<Option<MergedRow>> {
        let changes = self.log.for_entity(&EntityId::from(id))?;
        let synced: Vec<Entity> = self.mirror.get(id).into_iter().collect();
        Ok(merge(self.kind(), &synced, &changes).into_iter().next())
    }

    fn present(&self, row: &MergedRow) -> Value {
        let mut json = row.to_json();
        if let Some(handler) = &self.handler {
            handler.on_after_merge(&mut json);
        }
        json
    }

    fn last_good(&self) -> Arc<Vec<Value>> {
        Arc::clone(&self.last_good.lock().unwrap_or_else(|e| e.into_inner()))
    }

    // ── Pending log inspection ───────────────────────────────────

    /// Local Changes the remote store rejected.
    pub fn errored_changes(&self) -> SyncResult<Vec<LocalChange>> {
        Ok(self
            .log
            .scan()?
            .into_iter()
            .filter(|c| c.status == ChangeStatus::Error)
            .collect())
    }

    /// Every unretired Local Change of `id`, in order.
    pub fn changes_for(&self, id: &EntityId) -> SyncResult<Vec<LocalChange>> {
        Ok(self.log.for_entity(id)?)
    }

    /// Sends a rejected change again. Changes in any other state are left
    /// alone.
    pub fn retry(&self, seq: ChangeSeq) -> SyncResult<()> {
        let change = self.log.get(seq)?.ok_or(SyncError::ChangeNotFound(seq))?;
        if change.status != ChangeStatus::Error {
            return Ok(());
        }
        self.log.set_status(seq, ChangeStatus::Pending, None)?;
        debug!("{}: retrying {seq}", self.kind());
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.enqueue(seq);
        }
        self.notifier.notify(self.kind(), ChangeReason::StatusChanged);
        Ok(())
    }

    /// Drops a change from the log, reverting its effect on the merged view.
    pub fn discard(&self, seq: ChangeSeq) -> SyncResult<()> {
        if self.log.get(seq)?.is_none() {
            return Err(SyncError::ChangeNotFound(seq));
        }
        self.log.remove(&[seq])?;
        debug!("{}: discarded {seq}", self.kind());
        self.outstanding();
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.wake();
        }
        self.notifier.notify(self.kind(), ChangeReason::StatusChanged);
        Ok(())
    }

    /// Number of changes not yet acknowledged by the remote store.
    pub fn outstanding(&self) -> usize {
        match self.log.scan() {
            Ok(changes) => {
                let n = changes.iter().filter(|c| c.status.is_outstanding()).count();
                self.status.set_outstanding(self.kind(), n);
                n
            }
            Err(e) => {
                warn!("{}: could not count outstanding changes: {e}", self.kind());
                self.status.outstanding(self.kind())
            }
        }
    }
}
