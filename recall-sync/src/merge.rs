//! Merge Engine: combines mirrored rows with the pending log into the view
//! consumers read.
//!
//! [`merge`] is a pure function of its inputs. It keeps no state between
//! calls and takes its inputs by shared reference, so any number of readers
//! may run it concurrently over the same snapshot.

use recall_model::Entity;
use recall_types::{ChangeOp, ChangeSeq, ChangeStatus, HybridTimestamp, LocalChange};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// Name of the field carrying local sync state in a merged row.
pub const LOCAL_FIELD: &str = "_local";

/// Local sync state of a merged row: that of its most recent Local Change.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalMeta {
    pub status: ChangeStatus,
    pub timestamp: HybridTimestamp,
    pub error: Option<String>,
}

impl LocalMeta {
    fn from_change(change: &LocalChange) -> Self {
        Self {
            status: change.status,
            timestamp: change.timestamp,
            error: change.error.clone(),
        }
    }

    /// `{status, timestamp, error?}` with the timestamp in wall-clock ms.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("status".into(), Value::String(self.status.to_string()));
        obj.insert("timestamp".into(), Value::from(self.timestamp.wall_time()));
        if let Some(error) = &self.error {
            obj.insert("error".into(), Value::String(error.clone()));
        }
        Value::Object(obj)
    }
}

/// An entity as exposed to consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedRow {
    pub id: String,
    pub kind: String,
    /// Fields, without `id`.
    pub data: Value,
    /// Present when unconfirmed Local Changes contributed to this row.
    pub local: Option<LocalMeta>,
}

impl MergedRow {
    fn synced(entity: &Entity) -> Self {
        Self {
            id: entity.id.clone(),
            kind: entity.kind.clone(),
            data: entity.data.clone(),
            local: None,
        }
    }

    /// The flattened `{id, ...fields, _local?}` representation.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.clone()));
        if let Some(fields) = self.data.as_object() {
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        if let Some(local) = &self.local {
            obj.insert(LOCAL_FIELD.into(), local.to_json());
        }
        Value::Object(obj)
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn into_entity(self) -> Entity {
        Entity::new(self.id, self.kind, self.data)
    }
}

/// Local Changes of one id, partitioned for merging.
struct Chain<'a> {
    insert: Option<&'a LocalChange>,
    updates: Vec<&'a LocalChange>,
    deleted: bool,
    latest: &'a LocalChange,
}

impl<'a> Chain<'a> {
    fn new(first: &'a LocalChange) -> Self {
        Self {
            insert: None,
            updates: Vec::new(),
            deleted: false,
            latest: first,
        }
    }

    fn push(&mut self, change: &'a LocalChange) {
        match change.op {
            // Several inserts for one id should not happen; the latest wins.
            ChangeOp::Insert => self.insert = Some(change),
            ChangeOp::Update => self.updates.push(change),
            ChangeOp::Delete => self.deleted = true,
        }
        self.latest = change;
    }

    /// Applies every update, in order, onto `base`.
    fn fold_onto(&self, base: &Entity) -> MergedRow {
        let mut entity = base.clone();
        for update in &self.updates {
            entity.apply_patch(&update.payload);
        }
        MergedRow {
            id: entity.id,
            kind: entity.kind,
            data: entity.data,
            local: Some(LocalMeta::from_change(self.latest)),
        }
    }
}

/// Merges the mirrored rows of one kind with its pending log.
///
/// Output order: rows created locally first (by creation order), then the
/// synced rows in their input order. Ids with any unretired delete are
/// absent. Updates with neither a pending insert nor a synced row to apply
/// to are dropped.
pub fn merge(kind: &str, synced: &[Entity], changes: &[LocalChange]) -> Vec<MergedRow> {
    let mut ordered: Vec<&LocalChange> = changes.iter().collect();
    ordered.sort_by_key(|c| c.order_key());

    let mut chains: HashMap<&str, Chain<'_>> = HashMap::new();
    for &change in &ordered {
        chains
            .entry(change.entity_id.as_str())
            .or_insert_with(|| Chain::new(change))
            .push(change);
    }

    let mut inserted: Vec<(&str, &Chain<'_>, (HybridTimestamp, ChangeSeq))> = chains
        .iter()
        .filter(|(_, chain)| !chain.deleted)
        .filter_map(|(id, chain)| chain.insert.map(|ins| (*id, chain, ins.order_key())))
        .collect();
    inserted.sort_by_key(|(_, _, key)| *key);

    let mut out = Vec::with_capacity(synced.len() + inserted.len());
    for (id, chain, _) in &inserted {
        let Some(insert) = chain.insert else {
            continue;
        };
        let seed = Entity::new(*id, kind, insert.payload.clone());
        out.push(chain.fold_onto(&seed));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for row in synced {
        if !seen.insert(row.id.as_str()) {
            continue;
        }
        match chains.get(row.id.as_str()) {
            None => out.push(MergedRow::synced(row)),
            Some(chain) if chain.deleted || chain.insert.is_some() => {}
            Some(chain) if chain.updates.is_empty() => out.push(MergedRow::synced(row)),
            Some(chain) => out.push(chain.fold_onto(row)),
        }
    }

    out
}
