//! Optimistic local-first sync engine for Recall.
//!
//! Reads and writes complete against local state with no network latency
//! while an authoritative remote store converges in the background.
//!
//! # Architecture
//!
//! Per entity kind, the engine combines:
//!
//! - **Remote Mirror** ([`RemoteMirror`]): read-only cache fed by a live,
//!   filtered subscription to the remote store
//! - **Local Pending Store** ([`recall_storage::PendingLog`]): append-only
//!   log of local mutations not yet confirmed
//! - **Merge Engine** ([`merge()`]): pure function producing the view
//!   consumers read from the two
//! - **Write Dispatcher** ([`WriteDispatcher`]): background worker
//!   forwarding pending mutations to the remote write endpoint
//! - **Garbage Collector** ([`GarbageCollector`]): retires mutations the
//!   mirror has caught up with
//!
//! A [`SyncContext`] owns one [`Collection`] per registered kind and exposes
//! local writes, merged reads, change notification and an aggregate
//! [`SyncStatus`].
//!
//! ## Lifecycle of a local mutation
//!
//! 1. **Record**: appended to the pending log as `pending`, visible in the
//!    merged view immediately
//! 2. **Dispatch**: marked `syncing` and sent; `synced` on acknowledgement,
//!    `error` on rejection
//! 3. **Mirror**: the remote store publishes the row to the subscription
//! 4. **Cleanup**: once the mirror reflects it, the entry is deleted
//!
//! # Example
//!
//! ```
//! use recall_model::{EntitySchema, FieldSpec};
//! use recall_storage::LocalDb;
//! use recall_sync::{mock::InMemoryRemote, SyncContextBuilder};
//! use std::sync::Arc;
//!
//! let db = LocalDb::open_in_memory().unwrap();
//! let remote = Arc::new(InMemoryRemote::new());
//! let ctx = SyncContextBuilder::with_remote(db, remote)
//!     .register(EntitySchema::new("note", "notes").with_field(FieldSpec::text("body")))
//!     .build()
//!     .unwrap();
//!
//! let note = ctx
//!     .create_local("note", serde_json::json!({"body": "hello"}))
//!     .unwrap();
//! let merged = ctx.get_merged_by_id(&note.id).unwrap();
//! assert_eq!(merged["_local"]["status"], "pending");
//! ```

pub mod cleanup;
pub mod collection;
mod config;
mod context;
pub mod dispatcher;
mod error;
pub mod merge;
pub mod mirror;
pub mod mock;
pub mod observer;
pub mod remote;
pub mod status;

pub use cleanup::{AckLedger, GarbageCollector, plan_cleanup};
pub use collection::Collection;
pub use config::SyncConfig;
pub use context::{SyncContext, SyncContextBuilder};
pub use dispatcher::{DispatchSetup, WriteDispatcher};
pub use error::{SyncError, SyncResult};
pub use merge::{LOCAL_FIELD, LocalMeta, MergedRow, merge};
pub use mirror::{MirrorUpdate, RemoteMirror};
pub use observer::{ChangeEvent, ChangeNotifier, ChangeReason, ListenerHandle};
pub use remote::{
    RemoteError, RemoteResult, RemoteSource, RemoteWriter, SnapshotStream, WriteAck,
    WriteRequest,
};
pub use status::{StatusTracker, SyncStatus};

/// Runs blocking storage work off the async worker threads.
pub(crate) async fn blocking<T, F>(f: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SyncResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SyncError::Task(e.to_string()))?
}
