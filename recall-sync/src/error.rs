//! Error types for the sync layer.

use crate::remote::RemoteError;
use recall_model::ValidationError;
use recall_storage::StorageError;
use recall_types::ChangeSeq;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Remote failures never surface from a local write: they are recorded on
/// the affected Local Change instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local storage fault. A write that fails with this was not recorded.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Payload refused before being recorded.
    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),

    /// No schema is registered under this kind.
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    /// Two registrations use the same kind or table.
    #[error("duplicate registration: {0}")]
    DuplicateKind(String),

    /// The entity is not visible in any merged view.
    #[error("entity not found: {0}")]
    NotFound(String),

    /// No pending-log entry with this sequence.
    #[error("change not found: {0}")]
    ChangeNotFound(ChangeSeq),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// A blocking storage task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Remote store error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
}
