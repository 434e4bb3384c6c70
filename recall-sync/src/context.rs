//! `SyncContext`: the engine instance of one device.
//!
//! Owns one [`Collection`] per registered kind plus the services they share
//! (local clock, change notifier, status tracker). Construct it once with
//! [`SyncContextBuilder`] and pass it by reference to consumers.

use crate::collection::{Collection, KindRegistration, Shared};
use crate::config::SyncConfig;
use crate::dispatcher::{DispatchSetup, WriteDispatcher};
use crate::error::{SyncError, SyncResult};
use crate::mirror::MirrorUpdate;
use crate::observer::{ChangeEvent, ChangeNotifier, ChangeReason, ListenerHandle};
use crate::remote::{RemoteSource, RemoteWriter};
use crate::status::{StatusTracker, SyncStatus};
use recall_model::{Entity, EntitySchema, Filter, KindHandler, builtin};
use recall_storage::LocalDb;
use recall_types::{EntityId, HybridTimestamp, LocalClock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Collects the kinds and collaborators of a [`SyncContext`].
pub struct SyncContextBuilder {
    db: LocalDb,
    source: Arc<dyn RemoteSource>,
    writer: Arc<dyn RemoteWriter>,
    config: SyncConfig,
    kinds: Vec<KindRegistration>,
}

impl SyncContextBuilder {
    pub fn new(db: LocalDb, source: Arc<dyn RemoteSource>, writer: Arc<dyn RemoteWriter>) -> Self {
        Self {
            db,
            source,
            writer,
            config: SyncConfig::default(),
            kinds: Vec::new(),
        }
    }

    /// Uses one remote for both subscriptions and writes.
    pub fn with_remote<R>(db: LocalDb, remote: Arc<R>) -> Self
    where
        R: RemoteSource + RemoteWriter + 'static,
    {
        let source: Arc<dyn RemoteSource> = remote.clone();
        let writer: Arc<dyn RemoteWriter> = remote;
        Self::new(db, source, writer)
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register(self, schema: EntitySchema) -> Self {
        self.push(schema, None, None)
    }

    pub fn register_with_handler(self, schema: EntitySchema, handler: Arc<dyn KindHandler>) -> Self {
        self.push(schema, Some(handler), None)
    }

    /// Registers a kind whose mirror only follows rows matching `filter`.
    pub fn register_filtered(self, schema: EntitySchema, filter: Filter) -> Self {
        self.push(schema, None, Some(filter))
    }

    /// Registers every kind the application ships with.
    pub fn register_builtin(self) -> Self {
        builtin::all()
            .into_iter()
            .fold(self, |builder, schema| builder.register(schema))
    }

    fn push(
        mut self,
        schema: EntitySchema,
        handler: Option<Arc<dyn KindHandler>>,
        filter: Option<Filter>,
    ) -> Self {
        self.kinds.push(KindRegistration {
            schema,
            handler,
            filter,
        });
        self
    }

    /// Opens the persisted state of every kind. Does not touch the network;
    /// see [`SyncContext::start`].
    pub fn build(self) -> SyncResult<SyncContext> {
        let mut kinds = HashSet::new();
        let mut tables = HashSet::new();
        for registration in &self.kinds {
            let schema = &registration.schema;
            schema.validate_table()?;
            if !kinds.insert(schema.kind.clone()) {
                return Err(SyncError::DuplicateKind(schema.kind.clone()));
            }
            if !tables.insert(schema.table.clone()) {
                return Err(SyncError::DuplicateKind(schema.table.clone()));
            }
        }

        // The clock must issue timestamps after every change already logged.
        let mut logs = Vec::with_capacity(self.kinds.len());
        let mut last = HybridTimestamp::new(0, 0);
        for registration in &self.kinds {
            let log = self.db.pending_log(&registration.schema.table)?;
            if let Some(change) = log.scan()?.last() {
                last = last.max(change.timestamp);
            }
            logs.push(Arc::new(log));
        }

        let shared = Shared {
            clock: Arc::new(LocalClock::starting_at(last)),
            notifier: ChangeNotifier::new(),
            status: Arc::new(StatusTracker::new()),
            config: self.config,
        };

        let mut collections = Vec::with_capacity(self.kinds.len());
        let mut by_kind = HashMap::new();
        for (registration, log) in self.kinds.into_iter().zip(logs) {
            let collection = Collection::open(&self.db, registration, log, &shared)?;
            by_kind.insert(collection.kind().to_string(), collections.len());
            collections.push(Arc::new(collection));
        }
        for collection in &collections {
            collection.outstanding();
        }

        info!(
            "{}: sync context ready with {} kinds",
            shared.config.device_name,
            collections.len()
        );

        Ok(SyncContext {
            collections,
            by_kind,
            source: self.source,
            writer: self.writer,
            shared,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Local-first access to every registered kind.
pub struct SyncContext {
    collections: Vec<Arc<Collection>>,
    by_kind: HashMap<String, usize>,
    source: Arc<dyn RemoteSource>,
    writer: Arc<dyn RemoteWriter>,
    shared: Shared,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SyncContext {
    pub fn builder(
        db: LocalDb,
        source: Arc<dyn RemoteSource>,
        writer: Arc<dyn RemoteWriter>,
    ) -> SyncContextBuilder {
        SyncContextBuilder::new(db, source, writer)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn clock(&self) -> &Arc<LocalClock> {
        &self.shared.clock
    }

    /// The collection of `kind`.
    pub fn collection(&self, kind: &str) -> SyncResult<&Arc<Collection>> {
        self.by_kind
            .get(kind)
            .map(|&i| &self.collections[i])
            .ok_or_else(|| SyncError::UnknownKind(kind.to_string()))
    }

    // ── Local writes ─────────────────────────────────────────────

    pub fn create_local(&self, kind: &str, payload: Value) -> SyncResult<Entity> {
        self.collection(kind)?.create_local(payload)
    }

    pub fn update_local(&self, id: &str, patch: Value) -> SyncResult<()> {
        let id = EntityId::from(id);
        self.owner_of(&id)?.update_local(&id, patch)
    }

    pub fn delete_local(&self, id: &str) -> SyncResult<()> {
        let id = EntityId::from(id);
        self.owner_of(&id)?.delete_local(&id)
    }

    /// Ids are unique across kinds, so the first kind showing `id` owns it.
    fn owner_of(&self, id: &EntityId) -> SyncResult<&Arc<Collection>> {
        for collection in &self.collections {
            if collection.contains(id)? {
                return Ok(collection);
            }
        }
        Err(SyncError::NotFound(id.to_string()))
    }

    // ── Merged reads ─────────────────────────────────────────────

    /// Merged view of `kind`. Unknown kinds read as empty.
    pub fn get_merged(&self, kind: &str, filter: Option<&Filter>) -> Vec<Value> {
        match self.collection(kind) {
            Ok(collection) => collection.get_merged(filter),
            Err(e) => {
                warn!("get_merged: {e}");
                Vec::new()
            }
        }
    }

    pub fn get_merged_by_id(&self, id: &str) -> Option<Value> {
        self.collections
            .iter()
            .find_map(|collection| collection.get_merged_by_id(id))
    }

    // ── Status & notification ────────────────────────────────────

    pub fn status(&self) -> SyncStatus {
        for collection in &self.collections {
            collection.outstanding();
        }
        self.shared.status.status()
    }

    /// Reports the device's network state. Going online resumes dispatch.
    pub fn set_online(&self, online: bool) {
        if self.shared.status.is_online() == online {
            return;
        }
        info!("{}: network {}", self.shared.config.device_name, if online { "up" } else { "down" });
        self.shared.status.set_online(online);
        for collection in &self.collections {
            if online && let Some(dispatcher) = collection.dispatcher() {
                dispatcher.wake();
            }
            self.shared
                .notifier
                .notify(collection.kind(), ChangeReason::StatusChanged);
        }
    }

    pub fn on_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.shared.notifier.on_change(listener)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Subscribes every mirror and starts every dispatcher. Must be called
    /// within a Tokio runtime. Calling it again while started does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for collection in &self.collections {
            let dispatcher = WriteDispatcher::spawn(DispatchSetup {
                kind: collection.kind().to_string(),
                table: collection.schema().table.clone(),
                log: Arc::clone(collection.log_handle()),
                writer: Arc::clone(&self.writer),
                status: Arc::clone(&self.shared.status),
                notifier: Arc::clone(&self.shared.notifier),
                collector: Arc::clone(collection.collector()),
                config: self.shared.config.clone(),
            });
            collection.attach_dispatcher(Arc::new(dispatcher));
            tasks.push(self.spawn_mirror(collection));
        }
        info!("{}: sync started", self.shared.config.device_name);
    }

    fn spawn_mirror(&self, collection: &Arc<Collection>) -> JoinHandle<()> {
        let collection = Arc::clone(collection);
        let source = Arc::clone(&self.source);
        let notifier = Arc::clone(&self.shared.notifier);
        let status = Arc::clone(&self.shared.status);
        let config = self.shared.config.clone();

        tokio::spawn(async move {
            let kind = collection.kind().to_string();
            let table = collection.schema().table.clone();
            let on_update = |update: MirrorUpdate| match update {
                MirrorUpdate::Applied { rows } => {
                    debug!("{kind}: mirror refreshed with {rows} rows");
                    status.set_reachable(&kind, true);
                    notifier.notify(&kind, ChangeReason::MirrorRefreshed);
                    collection.collector().schedule();
                }
                MirrorUpdate::Disconnected(e) => {
                    debug!("{kind}: subscription error: {e}");
                    status.set_reachable(&kind, false);
                    notifier.notify(&kind, ChangeReason::StatusChanged);
                }
            };

            let mut attempt = 0;
            loop {
                match source.subscribe(&table, collection.subscription_filter()).await {
                    Ok(stream) => {
                        attempt = 0;
                        Arc::clone(collection.mirror()).run(stream, &on_update).await;
                    }
                    Err(e) => {
                        warn!("{kind}: subscribe failed: {e}");
                        collection.mirror().mark_disconnected();
                        on_update(MirrorUpdate::Disconnected(e));
                    }
                }
                attempt += 1;
                tokio::time::sleep(config.backoff_for(attempt)).await;
            }
        })
    }

    /// Attempts every outstanding write now and runs a cleanup pass on every
    /// kind. Writes that cannot be delivered stay pending.
    pub async fn flush(&self) -> SyncResult<()> {
        for collection in &self.collections {
            if let Some(dispatcher) = collection.dispatcher() {
                dispatcher.flush().await?;
            }
            collection.collector().collect_now().await;
        }
        Ok(())
    }

    /// Stops dispatchers and mirror subscriptions. Local writes keep working
    /// and are delivered after the next [`start`](Self::start).
    pub fn shutdown(&self) {
        for collection in &self.collections {
            if let Some(dispatcher) = collection.detach_dispatcher() {
                dispatcher.shutdown();
            }
        }
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        if self.started.swap(false, Ordering::SeqCst) {
            info!("{}: sync stopped", self.shared.config.device_name);
        }
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
