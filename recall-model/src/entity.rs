use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A generic entity handled by the Recall sync engine.
///
/// All entity kinds flow through this type. `data` holds the record's
/// fields as a JSON object; the id is kept separately because every
/// reconciliation step keys off it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub kind: String,
    pub data: Value,
}

impl Entity {
    /// Creates an entity, normalizing `data` to an object and stripping a
    /// redundant `id` field from it.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, data: Value) -> Self {
        let mut data = match data {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(Map::new()),
        };
        if let Some(obj) = data.as_object_mut() {
            obj.remove("id");
        }
        Self {
            id: id.into(),
            kind: kind.into(),
            data,
        }
    }

    /// Parses a row as delivered by the remote store: a JSON object with a
    /// string `id`. Returns `None` for anything else.
    pub fn from_row(kind: &str, row: &Value) -> Option<Self> {
        let id = row.get("id")?.as_str()?;
        if !row.is_object() {
            return None;
        }
        Some(Self::new(id, kind, row.clone()))
    }

    /// The flattened `{id, ...fields}` representation.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), Value::String(self.id.clone()));
        if let Some(fields) = self.data.as_object() {
            for (k, v) in fields {
                obj.insert(k.clone(), v.clone());
            }
        }
        Value::Object(obj)
    }

    /// Reads a top-level field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        if name == "id" {
            return None;
        }
        self.data.get(name)
    }

    /// The version marker of this row, if the field holds an integer
    /// (milliseconds since epoch).
    pub fn version(&self, field: &str) -> Option<i64> {
        self.field(field).and_then(|v| v.as_i64())
    }

    /// Shallow-merges the top-level fields of `patch` onto this entity.
    /// An `id` in the patch is ignored.
    pub fn apply_patch(&mut self, patch: &Value) {
        let Some(patch) = patch.as_object() else {
            return;
        };
        if !self.data.is_object() {
            self.data = Value::Object(Map::new());
        }
        if let Some(obj) = self.data.as_object_mut() {
            for (k, v) in patch {
                if k == "id" {
                    continue;
                }
                obj.insert(k.clone(), v.clone());
            }
        }
    }

    /// Extract a string value from `data` using a JSON pointer (e.g., "/title").
    pub fn get_str(&self, pointer: &str) -> Option<&str> {
        self.data.pointer(pointer).and_then(|v| v.as_str())
    }

    /// Extract a boolean value from `data` using a JSON pointer.
    pub fn get_bool(&self, pointer: &str) -> Option<bool> {
        self.data.pointer(pointer).and_then(|v| v.as_bool())
    }

    /// Extract a numeric value from `data` using a JSON pointer.
    pub fn get_number(&self, pointer: &str) -> Option<f64> {
        self.data.pointer(pointer).and_then(|v| v.as_f64())
    }
}
