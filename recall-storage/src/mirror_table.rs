//! Persisted Remote Mirror snapshot of one entity kind.

use crate::error::{StorageError, StorageResult};
use crate::{checked_table, lock};
use duckdb::{params, Connection};
use recall_model::{Entity, EntitySchema};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One row per entity id, exactly as last delivered by the remote store.
///
/// Rows are never edited individually: each refresh replaces the whole
/// table, and an empty refresh leaves it empty.
#[derive(Clone)]
pub struct MirrorTable {
    conn: Arc<Mutex<Connection>>,
    name: String,
    kind: String,
    version_field: Option<String>,
}

impl MirrorTable {
    pub(crate) fn open(conn: Arc<Mutex<Connection>>, schema: &EntitySchema) -> StorageResult<Self> {
        let name = checked_table("mirror", &schema.table)?;
        {
            let guard = lock(&conn)?;
            // No PRIMARY KEY: rows are deleted and re-inserted under the same id
            // in one transaction, and ids are deduplicated before insert.
            guard.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {name} (
                    id VARCHAR NOT NULL,
                    data_json TEXT NOT NULL,
                    version BIGINT
                );"
            ))?;
        }
        Ok(Self {
            conn,
            name,
            kind: schema.kind.clone(),
            version_field: schema.version_field.clone(),
        })
    }

    /// Name of the underlying DuckDB table.
    pub fn table_name(&self) -> &str {
        &self.name
    }

    /// Replaces the stored snapshot with `rows`. Later duplicates of an id win.
    pub fn replace_all(&self, rows: &[Entity]) -> StorageResult<()> {
        let mut by_id: BTreeMap<&str, &Entity> = BTreeMap::new();
        for row in rows {
            by_id.insert(row.id.as_str(), row);
        }

        let mut guard = lock(&self.conn)?;
        let tx = guard.transaction()?;
        tx.execute(&format!("DELETE FROM {}", self.name), [])?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (id, data_json, version) VALUES (?, ?, ?)",
                self.name
            ))?;
            for (id, entity) in &by_id {
                let data_json = serde_json::to_string(&entity.data)?;
                let version = self
                    .version_field
                    .as_deref()
                    .and_then(|f| entity.version(f));
                stmt.execute(params![*id, data_json, version])?;
            }
        }
        tx.commit()?;

        debug!("{}: replaced snapshot with {} rows", self.name, by_id.len());
        Ok(())
    }

    /// All rows, ordered by id.
    pub fn rows(&self) -> StorageResult<Vec<Entity>> {
        let guard = lock(&self.conn)?;
        let mut stmt = guard.prepare(&format!(
            "SELECT id, data_json FROM {} ORDER BY id",
            self.name
        ))?;
        let raw: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        drop(guard);

        raw.into_iter()
            .map(|(id, data_json)| self.decode(id, &data_json))
            .collect()
    }

    /// A single row by id.
    pub fn get(&self, id: &str) -> StorageResult<Option<Entity>> {
        let guard = lock(&self.conn)?;
        let result = guard.query_row(
            &format!("SELECT data_json FROM {} WHERE id = ?", self.name),
            params![id],
            |row| row.get::<_, String>(0),
        );
        drop(guard);

        match result {
            Ok(data_json) => Ok(Some(self.decode(id.to_string(), &data_json)?)),
            Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Number of mirrored rows.
    pub fn count(&self) -> StorageResult<usize> {
        let guard = lock(&self.conn)?;
        let count: i64 = guard.query_row(&format!("SELECT COUNT(*) FROM {}", self.name), [], |row| {
            row.get(0)
        })?;
        Ok(count as usize)
    }

    fn decode(&self, id: String, data_json: &str) -> StorageResult<Entity> {
        let data: serde_json::Value = serde_json::from_str(data_json)
            .map_err(|e| StorageError::InvalidData(format!("{}[{id}]: {e}", self.name)))?;
        Ok(Entity::new(id, self.kind.clone(), data))
    }
}
