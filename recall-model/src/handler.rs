use serde_json::Value;

/// Optional per-kind hooks for logic the schema cannot express.
///
/// Most kinds do NOT need this: declared field specs cover presence and
/// type checks. Implement it only for:
/// - cross-field validation (e.g., an edge may not point at itself)
/// - derived fields computed on every read (e.g., a display label)
pub trait KindHandler: Send + Sync {
    /// Validates the payload of a local insert, after schema validation.
    /// Return `Err(message)` to refuse the write.
    fn validate_insert(&self, payload: &Value) -> Result<(), String> {
        let _ = payload;
        Ok(())
    }

    /// Validates a local partial update, after schema validation.
    fn validate_patch(&self, patch: &Value) -> Result<(), String> {
        let _ = patch;
        Ok(())
    }

    /// Called on each merged row before it is handed to a reader.
    /// `row` is the flattened `{id, ...fields}` object. Must be pure.
    fn on_after_merge(&self, row: &mut Value) {
        let _ = row;
    }
}
