//! DuckDB storage layer for Recall.
//!
//! Persists, per entity kind, the two logical tables the sync engine needs:
//!
//! - `mirror_<table>`: one row per id, the last snapshot confirmed by the
//!   remote store, replaced wholesale on every refresh (including the empty
//!   refresh)
//! - `pending_<table>`: append-only log of local mutations not yet retired,
//!   keyed by an internal sequence plus the entity id
//!
//! All tables of a device share one DuckDB connection behind a mutex, so
//! appends from unrelated mutations are serialized rather than interleaved.

mod error;
mod mirror_table;
mod pending_log;

pub use error::{StorageError, StorageResult};
pub use mirror_table::MirrorTable;
pub use pending_log::PendingLog;

use duckdb::Connection;
use recall_model::EntitySchema;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Open a DuckDB connection with stale WAL recovery.
///
/// If the initial open fails and a `.wal` file exists alongside the database,
/// it is removed and the open is retried once. This handles the common case
/// where an unclean shutdown leaves a WAL file that prevents reopening.
pub fn open_duckdb_with_wal_recovery(path: &Path) -> StorageResult<Connection> {
    match Connection::open(path) {
        Ok(conn) => Ok(conn),
        Err(first_err) => {
            let wal_path = path.with_extension(
                path.extension()
                    .map(|ext| format!("{}.wal", ext.to_string_lossy()))
                    .unwrap_or_else(|| "wal".to_string()),
            );
            if wal_path.exists() {
                warn!(
                    "DuckDB open failed, removing stale WAL and retrying: {}",
                    wal_path.display()
                );
                if std::fs::remove_file(&wal_path).is_ok() {
                    return Connection::open(path).map_err(Into::into);
                }
            }
            Err(first_err.into())
        }
    }
}

/// The device-local database holding every mirror table and pending log.
#[derive(Clone)]
pub struct LocalDb {
    conn: Arc<Mutex<Connection>>,
}

impl LocalDb {
    /// Opens or creates the local database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let conn = open_duckdb_with_wal_recovery(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory database (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens (creating if needed) the mirror table of a kind.
    pub fn mirror_table(&self, schema: &EntitySchema) -> StorageResult<MirrorTable> {
        MirrorTable::open(self.conn.clone(), schema)
    }

    /// Opens (creating if needed) the pending-changes log of `table`.
    pub fn pending_log(&self, table: &str) -> StorageResult<PendingLog> {
        PendingLog::open(self.conn.clone(), table)
    }
}

pub(crate) fn lock(conn: &Mutex<Connection>) -> StorageResult<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| StorageError::LockPoisoned)
}

/// Table names are interpolated into SQL, so only plain identifiers pass.
pub(crate) fn checked_table(prefix: &str, table: &str) -> StorageResult<String> {
    let mut chars = table.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if head_ok && tail_ok {
        Ok(format!("{prefix}_{table}"))
    } else {
        Err(StorageError::InvalidTable(table.to_string()))
    }
}
