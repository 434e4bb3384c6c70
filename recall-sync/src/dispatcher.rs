//! Write Dispatcher: forwards pending Local Changes to the remote store.
//!
//! One worker task per kind walks the pending log in `(timestamp, seq)`
//! order, one entity chain at a time, and never sends a change of an id
//! before the earlier changes of that id have been answered. A rejected
//! change is marked `error`; a rejected insert holds back the rest of its
//! id, any other rejection lets the id's next change go out. An
//! unreachable remote pauses the worker with exponential backoff and leaves
//! the change `pending`.

use crate::blocking;
use crate::cleanup::GarbageCollector;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::observer::{ChangeNotifier, ChangeReason};
use crate::remote::{RemoteError, RemoteWriter, WriteRequest};
use crate::status::StatusTracker;
use recall_storage::{PendingLog, StorageResult};
use recall_types::{ChangeSeq, ChangeStatus, EntityId, LocalChange};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Command sent to the dispatcher worker.
enum Command {
    /// New or re-queued work may be in the log.
    Wake,
    /// Answer once every dispatchable change has been attempted.
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// What a worker needs to deliver the changes of one kind.
pub struct DispatchSetup {
    pub kind: String,
    pub table: String,
    pub log: Arc<PendingLog>,
    pub writer: Arc<dyn RemoteWriter>,
    pub status: Arc<StatusTracker>,
    pub notifier: Arc<ChangeNotifier>,
    pub collector: Arc<GarbageCollector>,
    pub config: SyncConfig,
}

/// Handle to the dispatcher worker of one kind.
pub struct WriteDispatcher {
    kind: String,
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WriteDispatcher {
    /// Spawns the worker on the current Tokio runtime. Entries left
    /// `syncing` by a previous run are reset to `pending` first.
    pub fn spawn(setup: DispatchSetup) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let kind = setup.kind.clone();
        let worker = Worker {
            setup,
            rx,
            waiters: Vec::new(),
            failures: 0,
        };
        let handle = tokio::spawn(worker.run());
        Self {
            kind,
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Signals that `seq` was recorded. Returns immediately.
    pub fn enqueue(&self, seq: ChangeSeq) {
        debug!("{}: enqueued {seq}", self.kind);
        self.wake();
    }

    /// Asks the worker to look at the log again.
    pub fn wake(&self) {
        if self.tx.send(Command::Wake).is_err() {
            debug!("{}: dispatcher stopped, wake ignored", self.kind);
        }
    }

    /// Attempts every dispatchable change now, ignoring any backoff in
    /// progress, and waits for the attempt to finish. Changes still pending
    /// afterwards are waiting on an unreachable remote or an offline device.
    pub async fn flush(&self) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(tx))
            .map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Stops the worker after the write in progress, if any.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
        self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassOutcome {
    /// Nothing left to send.
    Idle,
    /// The batch limit was hit with work remaining.
    More,
    Unreachable,
    Offline,
}

enum Delivery {
    Acked,
    Rejected,
    Unreachable,
    /// The entry vanished or could not be updated locally.
    Skipped,
}

struct Worker {
    setup: DispatchSetup,
    rx: mpsc::UnboundedReceiver<Command>,
    waiters: Vec<oneshot::Sender<()>>,
    /// Consecutive passes that ended on an unreachable remote.
    failures: u32,
}

impl Worker {
    async fn run(mut self) {
        match self.with_log(|log| log.reset_in_flight()).await {
            Ok(0) => {}
            Ok(n) => info!("{}: {n} in-flight changes returned to pending", self.setup.kind),
            Err(e) => warn!("{}: could not reset in-flight changes: {e}", self.setup.kind),
        }

        loop {
            while let Ok(command) = self.rx.try_recv() {
                if !self.handle(command) {
                    return;
                }
            }

            match self.pass().await {
                PassOutcome::More => continue,
                PassOutcome::Idle | PassOutcome::Offline => {
                    self.answer_waiters();
                    let Some(command) = self.rx.recv().await else {
                        return;
                    };
                    if !self.handle(command) {
                        return;
                    }
                }
                PassOutcome::Unreachable => {
                    self.answer_waiters();
                    let delay = self.setup.config.backoff_for(self.failures);
                    info!(
                        "{}: remote unreachable, pausing dispatch for {delay:?}",
                        self.setup.kind
                    );
                    if !self.pause(delay).await {
                        return;
                    }
                }
            }
        }
    }

    /// Returns false when the worker should stop.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Wake => true,
            Command::Flush(tx) => {
                self.waiters.push(tx);
                true
            }
            Command::Shutdown => {
                self.answer_waiters();
                debug!("{}: dispatcher stopped", self.setup.kind);
                false
            }
        }
    }

    /// Sleeps through a backoff. Wakes do not cut it short; a flush does.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.rx.recv() => match command {
                    Some(Command::Wake) => continue,
                    Some(Command::Flush(tx)) => {
                        self.waiters.push(tx);
                        return true;
                    }
                    Some(Command::Shutdown) | None => {
                        self.answer_waiters();
                        return false;
                    }
                },
            }
        }
    }

    fn answer_waiters(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn pass(&mut self) -> PassOutcome {
        if !self.setup.status.is_online() {
            return PassOutcome::Offline;
        }

        let changes = match self.with_log(|log| log.scan()).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!("{}: could not read pending log: {e}", self.setup.kind);
                return PassOutcome::Idle;
            }
        };

        let batch = self.setup.config.dispatch_batch_size.max(1);
        let mut sent = 0;
        let mut acked = false;
        let mut outcome = PassOutcome::Idle;

        'chains: for chain in into_chains(changes) {
            if never_sent(&chain) {
                self.collapse(&chain).await;
                continue;
            }

            for change in &chain {
                match change.status {
                    ChangeStatus::Synced => continue,
                    // Later changes of this id depend on the rejected insert.
                    ChangeStatus::Error if change.is_insert() => continue 'chains,
                    ChangeStatus::Error => continue,
                    ChangeStatus::Pending | ChangeStatus::Syncing => {}
                }

                if sent >= batch {
                    outcome = PassOutcome::More;
                    break 'chains;
                }
                sent += 1;

                match self.deliver(change).await {
                    Delivery::Acked => acked = true,
                    Delivery::Rejected if change.is_insert() => continue 'chains,
                    Delivery::Rejected => {}
                    Delivery::Skipped => continue 'chains,
                    Delivery::Unreachable => {
                        outcome = PassOutcome::Unreachable;
                        break 'chains;
                    }
                }
            }
        }

        self.refresh_outstanding().await;
        if acked {
            self.setup.collector.schedule();
        }
        outcome
    }

    async fn deliver(&mut self, change: &LocalChange) -> Delivery {
        let kind = self.setup.kind.clone();
        let seq = change.seq;

        match self.set_status(seq, ChangeStatus::Syncing, None).await {
            Ok(true) => {}
            Ok(false) => return Delivery::Skipped,
            Err(e) => {
                warn!("{kind}: could not mark {seq} syncing: {e}");
                return Delivery::Skipped;
            }
        }

        let request = WriteRequest::from_change(&self.setup.table, change);
        let delivery = match self.setup.writer.write(request).await {
            Ok(_) => {
                debug!("{kind}: {seq} {} {} acknowledged", change.op, change.entity_id);
                self.failures = 0;
                self.setup.status.set_reachable(&kind, true);
                self.setup.collector.record_ack(seq);
                self.mark(seq, ChangeStatus::Synced, None).await;
                Delivery::Acked
            }
            Err(RemoteError::Rejected(message)) => {
                warn!("{kind}: {seq} {} {} rejected: {message}", change.op, change.entity_id);
                self.setup.status.set_reachable(&kind, true);
                self.mark(seq, ChangeStatus::Error, Some(&message)).await;
                Delivery::Rejected
            }
            Err(RemoteError::Unreachable(message)) => {
                debug!("{kind}: {seq} not delivered: {message}");
                self.failures = self.failures.saturating_add(1);
                self.setup.status.set_reachable(&kind, false);
                self.mark(seq, ChangeStatus::Pending, None).await;
                if change.retry_count < self.setup.config.max_retries
                    && let Err(e) = self.with_log(move |log| log.record_retry(seq)).await
                {
                    warn!("{kind}: could not record retry of {seq}: {e}");
                }
                Delivery::Unreachable
            }
        };

        self.setup.notifier.notify(&kind, ChangeReason::StatusChanged);
        delivery
    }

    /// Removes an insert-to-delete chain the remote store never saw.
    async fn collapse(&self, chain: &[LocalChange]) {
        let seqs: Vec<ChangeSeq> = chain.iter().map(|c| c.seq).collect();
        match self.with_log(move |log| log.remove(&seqs)).await {
            Ok(removed) => {
                debug!(
                    "{}: dropped {removed} unsent changes of deleted {}",
                    self.setup.kind, chain[0].entity_id
                );
                self.setup.notifier.notify(&self.setup.kind, ChangeReason::Cleanup);
            }
            Err(e) => warn!("{}: could not drop unsent chain: {e}", self.setup.kind),
        }
    }

    async fn mark(&self, seq: ChangeSeq, status: ChangeStatus, error: Option<&str>) {
        if let Err(e) = self.set_status(seq, status, error).await {
            warn!("{}: could not mark {seq} {status}: {e}", self.setup.kind);
        }
    }

    async fn set_status(
        &self,
        seq: ChangeSeq,
        status: ChangeStatus,
        error: Option<&str>,
    ) -> SyncResult<bool> {
        let error = error.map(str::to_string);
        self.with_log(move |log| log.set_status(seq, status, error.as_deref()))
            .await
    }

    async fn refresh_outstanding(&self) {
        let outstanding = self
            .with_log(|log| {
                log.scan()
                    .map(|changes| changes.iter().filter(|c| c.status.is_outstanding()).count())
            })
            .await;
        match outstanding {
            Ok(n) => self.setup.status.set_outstanding(&self.setup.kind, n),
            Err(e) => warn!("{}: could not count outstanding changes: {e}", self.setup.kind),
        }
    }

    async fn with_log<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&PendingLog) -> StorageResult<T> + Send + 'static,
    {
        let log = Arc::clone(&self.setup.log);
        blocking(move || Ok(f(&log)?)).await
    }
}

/// Groups an ordered log into per-id chains, in order of each id's first
/// change.
fn into_chains(changes: Vec<LocalChange>) -> Vec<Vec<LocalChange>> {
    let mut index: HashMap<EntityId, usize> = HashMap::new();
    let mut chains: Vec<Vec<LocalChange>> = Vec::new();
    for change in changes {
        match index.get(&change.entity_id) {
            Some(&i) => chains[i].push(change),
            None => {
                index.insert(change.entity_id.clone(), chains.len());
                chains.push(vec![change]);
            }
        }
    }
    chains
}

/// An insert later deleted, with no part ever handed to the remote store.
/// Rejected entries count as unsent: the remote store did not apply them.
/// Any recorded attempt, including one interrupted by a restart, may have
/// reached it.
fn never_sent(chain: &[LocalChange]) -> bool {
    chain.first().is_some_and(LocalChange::is_insert)
        && chain.iter().any(LocalChange::is_delete)
        && chain.iter().all(|c| {
            matches!(c.status, ChangeStatus::Pending | ChangeStatus::Error) && c.retry_count == 0
        })
}
