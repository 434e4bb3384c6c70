//! Local Change types.
//!
//! A Local Change records one mutation made on this device that the remote
//! store has not yet confirmed. Changes are immutable once recorded, apart
//! from their delivery status. Several changes may exist for the same
//! entity; they are replayed in `(timestamp, seq)` order and never collapsed
//! into a single "latest" entry.

use crate::{ChangeSeq, EntityId, Error, HybridTimestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The mutation a Local Change performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::UnknownOp(other.to_string())),
        }
    }
}

/// Delivery status of a Local Change.
///
/// `Pending -> Syncing -> Synced`, then retired by cleanup once the mirror
/// reflects it. `Error` is terminal until the change is retried or discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Syncing,
    Synced,
    Error,
}

impl ChangeStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    /// Whether the remote store has not acknowledged the change yet.
    pub const fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Syncing)
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "error" => Ok(Self::Error),
            other => Err(Error::UnknownStatus(other.to_string())),
        }
    }
}

/// One entry of the pending-changes log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalChange {
    /// Position in the log, assigned on append.
    pub seq: ChangeSeq,
    /// The entity this change applies to.
    pub entity_id: EntityId,
    pub op: ChangeOp,
    pub status: ChangeStatus,
    /// When the mutation was made on this device.
    pub timestamp: HybridTimestamp,
    /// Full record for inserts, the touched fields for updates, `{}` for deletes.
    pub payload: serde_json::Value,
    /// Rejection message from the remote store, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// How many times delivery was attempted without an acknowledgement.
    #[serde(default)]
    pub retry_count: u32,
}

impl LocalChange {
    /// Key that totally orders changes of one log.
    pub fn order_key(&self) -> (HybridTimestamp, ChangeSeq) {
        (self.timestamp, self.seq)
    }

    pub fn is_insert(&self) -> bool {
        self.op == ChangeOp::Insert
    }

    pub fn is_update(&self) -> bool {
        self.op == ChangeOp::Update
    }

    pub fn is_delete(&self) -> bool {
        self.op == ChangeOp::Delete
    }

    /// Top-level fields this change writes. Empty for deletes.
    pub fn touched_fields(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.payload.as_object().into_iter().flat_map(|m| m.iter())
    }
}
