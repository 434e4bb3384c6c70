//! Core type definitions for Recall.
//!
//! This crate defines the fundamental, kind-agnostic types used throughout
//! the sync engine:
//! - Entity identifiers and the pending-log sequence
//! - Hybrid Logical Clock timestamps and the local mutation clock
//! - The Local Change vocabulary (operation, status, log entry)
//!
//! Nothing here knows about a particular entity kind (works, assets, boards,
//! ...). Those are configuration, described in `recall-model`.

mod change;
mod ids;
mod timestamp;

pub use change::{ChangeOp, ChangeStatus, LocalChange};
pub use ids::{ChangeSeq, EntityId};
pub use timestamp::{HybridTimestamp, LocalClock};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("unknown change operation: {0}")]
    UnknownOp(String),

    #[error("unknown change status: {0}")]
    UnknownStatus(String),
}
