//! Append-only log of local changes for one entity kind.

use crate::error::{StorageError, StorageResult};
use crate::{checked_table, lock};
use duckdb::{params, Connection, Row};
use recall_types::{ChangeOp, ChangeSeq, ChangeStatus, EntityId, HybridTimestamp, LocalChange};
use std::sync::{Arc, Mutex};
use tracing::debug;

const COLUMNS: &str =
    "seq, entity_id, op, status, wall_time, logical, payload_json, error, retry_count";

/// Columns as stored, before decoding into a [`LocalChange`].
type RawChange = (i64, String, String, String, i64, i64, String, Option<String>, i64);

/// Pending-changes log backed by a DuckDB table.
///
/// Entries are only ever appended, have their delivery status updated, or
/// are removed as a whole. The op, payload and timestamp of an entry never
/// change after `append`.
pub struct PendingLog {
    conn: Arc<Mutex<Connection>>,
    name: String,
    next_seq: Mutex<ChangeSeq>,
}

impl PendingLog {
    pub(crate) fn open(conn: Arc<Mutex<Connection>>, table: &str) -> StorageResult<Self> {
        let name = checked_table("pending", table)?;
        let last_seq = {
            let guard = lock(&conn)?;
            guard.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    seq BIGINT NOT NULL,
                    entity_id VARCHAR NOT NULL,
                    op VARCHAR NOT NULL,
                    status VARCHAR NOT NULL,
                    wall_time BIGINT NOT NULL,
                    logical BIGINT NOT NULL,
                    payload_json TEXT NOT NULL,
                    error TEXT,
                    retry_count BIGINT NOT NULL DEFAULT 0
                );"
            ))?;
            guard.query_row(&format!("SELECT COALESCE(MAX(seq), 0) FROM {name}"), [], |row| {
                row.get::<_, i64>(0)
            })?
        };

        Ok(Self {
            conn,
            name,
            next_seq: Mutex::new(ChangeSeq::new(last_seq as u64).next()),
        })
    }

    /// Name of the underlying DuckDB table.
    pub fn table_name(&self) -> &str {
        &self.name
    }

    /// Records a new change with status `pending`.
    ///
    /// Returns only once the entry is stored; an error means the change was
    /// not recorded.
    pub fn append(
        &self,
        entity_id: &EntityId,
        op: ChangeOp,
        payload: &serde_json::Value,
        timestamp: HybridTimestamp,
    ) -> StorageResult<LocalChange> {
        let payload_json = serde_json::to_string(payload)?;
        let guard = lock(&self.conn)?;
        let mut next_seq = self.next_seq.lock().map_err(|_| StorageError::LockPoisoned)?;
        let seq = *next_seq;

        guard.execute(
            &format!(
                "INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 0)",
                self.name
            ),
            params![
                seq.value() as i64,
                entity_id.as_str(),
                op.as_str(),
                ChangeStatus::Pending.as_str(),
                timestamp.wall_time() as i64,
                timestamp.logical() as i64,
                payload_json,
            ],
        )?;
        *next_seq = seq.next();

        debug!("{}: appended {} {} for {}", self.name, seq, op, entity_id);
        Ok(LocalChange {
            seq,
            entity_id: entity_id.clone(),
            op,
            status: ChangeStatus::Pending,
            timestamp,
            payload: payload.clone(),
            error: None,
            retry_count: 0,
        })
    }

    /// Every entry, ordered by `(timestamp, seq)`.
    pub fn scan(&self) -> StorageResult<Vec<LocalChange>> {
        self.select("", params![])
    }

    /// All entries of one entity, ordered by `(timestamp, seq)`.
    pub fn for_entity(&self, entity_id: &EntityId) -> StorageResult<Vec<LocalChange>> {
        self.select("WHERE entity_id = ?", params![entity_id.as_str()])
    }

    /// A single entry.
    pub fn get(&self, seq: ChangeSeq) -> StorageResult<Option<LocalChange>> {
        Ok(self
            .select("WHERE seq = ?", params![seq.value() as i64])?
            .into_iter()
            .next())
    }

    /// Updates the delivery status of an entry. Returns false if the entry no
    /// longer exists (e.g. it was retired concurrently).
    pub fn set_status(
        &self,
        seq: ChangeSeq,
        status: ChangeStatus,
        error: Option<&str>,
    ) -> StorageResult<bool> {
        let guard = lock(&self.conn)?;
        let updated = guard.execute(
            &format!("UPDATE {} SET status = ?, error = ? WHERE seq = ?", self.name),
            params![status.as_str(), error, seq.value() as i64],
        )?;
        Ok(updated > 0)
    }

    /// Counts one more delivery attempt that did not reach the remote store.
    pub fn record_retry(&self, seq: ChangeSeq) -> StorageResult<()> {
        let guard = lock(&self.conn)?;
        guard.execute(
            &format!(
                "UPDATE {} SET retry_count = retry_count + 1 WHERE seq = ?",
                self.name
            ),
            params![seq.value() as i64],
        )?;
        Ok(())
    }

    /// Entries left `syncing` by a previous run go back to `pending`, since
    /// their acknowledgement was never recorded. The interrupted attempt may
    /// have reached the remote store, so it counts as a retry: an entry with
    /// a non-zero `retry_count` is never treated as unsent.
    pub fn reset_in_flight(&self) -> StorageResult<usize> {
        let guard = lock(&self.conn)?;
        let n = guard.execute(
            &format!(
                "UPDATE {} SET status = ?, retry_count = retry_count + 1 WHERE status = ?",
                self.name
            ),
            params![ChangeStatus::Pending.as_str(), ChangeStatus::Syncing.as_str()],
        )?;
        Ok(n)
    }

    /// Removes entries. Unknown sequences are ignored.
    pub fn remove(&self, seqs: &[ChangeSeq]) -> StorageResult<usize> {
        if seqs.is_empty() {
            return Ok(0);
        }
        let mut guard = lock(&self.conn)?;
        let tx = guard.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare(&format!("DELETE FROM {} WHERE seq = ?", self.name))?;
            for seq in seqs {
                removed += stmt.execute(params![seq.value() as i64])?;
            }
        }
        tx.commit()?;
        debug!("{}: removed {} entries", self.name, removed);
        Ok(removed)
    }

    /// Number of entries in the log.
    pub fn count(&self) -> StorageResult<usize> {
        let guard = lock(&self.conn)?;
        let count: i64 = guard.query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    fn select(&self, clause: &str, params: &[&dyn duckdb::ToSql]) -> StorageResult<Vec<LocalChange>> {
        let guard = lock(&self.conn)?;
        let mut stmt = guard.prepare(&format!(
            "SELECT {COLUMNS} FROM {} {clause} ORDER BY wall_time, logical, seq",
            self.name
        ))?;
        let raw: Vec<RawChange> = stmt
            .query_map(params, read_row)?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(guard);

        raw.into_iter().map(decode).collect()
    }
}

fn read_row(row: &Row<'_>) -> duckdb::Result<RawChange> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn decode(raw: RawChange) -> StorageResult<LocalChange> {
    let (seq, entity_id, op, status, wall_time, logical, payload_json, error, retry_count) = raw;
    let payload = serde_json::from_str(&payload_json)
        .map_err(|e| StorageError::InvalidData(format!("payload of #{seq}: {e}")))?;
    Ok(LocalChange {
        seq: ChangeSeq::new(seq as u64),
        entity_id: EntityId::from(entity_id),
        op: op.parse()?,
        status: status.parse()?,
        timestamp: HybridTimestamp::new(wall_time as u64, logical as u32),
        payload,
        error,
        retry_count: retry_count as u32,
    })
}
