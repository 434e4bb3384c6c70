//! Interfaces to the authoritative remote store.
//!
//! The engine consumes two capabilities: a push-based read subscription per
//! table and a write endpoint. Both are traits so the engine works with any
//! backend; [`crate::mock::InMemoryRemote`] implements them for tests.

use async_trait::async_trait;
use futures::stream::BoxStream;
use recall_model::Filter;
use recall_types::{ChangeOp, EntityId, LocalChange};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Live stream of full row sets for one subscription.
///
/// Each item is the complete current result set, never a delta. An empty
/// vector means no rows match. An `Err` item reports a transient loss of
/// connectivity; the stream may yield rows again afterwards.
pub type SnapshotStream = BoxStream<'static, RemoteResult<Vec<Value>>>;

/// How a remote call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote store could not be reached. The write may be retried.
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    /// The remote store refused the write (validation, conflict). Retrying
    /// the same write will not help.
    #[error("rejected by remote: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// One mutation forwarded to the remote write endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub table: String,
    pub op: ChangeOp,
    pub id: EntityId,
    /// Fields to write, always including `id`. Just `{id}` for deletes.
    pub payload: Value,
}

impl WriteRequest {
    /// Builds the request that delivers a Local Change.
    pub fn from_change(table: &str, change: &LocalChange) -> Self {
        let mut payload = match (&change.op, &change.payload) {
            (ChangeOp::Delete, _) => Map::new(),
            (_, Value::Object(fields)) => fields.clone(),
            _ => Map::new(),
        };
        payload.insert("id".into(), Value::String(change.entity_id.to_string()));

        Self {
            table: table.to_string(),
            op: change.op,
            id: change.entity_id.clone(),
            payload: Value::Object(payload),
        }
    }
}

/// Acknowledgement of an accepted write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteAck {
    /// The row as stored by the remote, if it returns one.
    pub data: Option<Value>,
}

/// Push-based read side of the remote store.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Subscribes to the rows of `table` matching `filter`.
    ///
    /// The first item may be a stale cached result. Reconnecting after the
    /// stream ends is up to the caller.
    async fn subscribe(&self, table: &str, filter: Option<&Filter>)
        -> RemoteResult<SnapshotStream>;
}

/// Write endpoint of the remote store.
///
/// Delivery is at-least-once, so implementations must treat redelivery as
/// idempotent: insert is an upsert and delete of an absent row succeeds.
#[async_trait]
pub trait RemoteWriter: Send + Sync {
    async fn write(&self, request: WriteRequest) -> RemoteResult<WriteAck>;
}
