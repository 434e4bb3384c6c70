//! Field predicates over entities.
//!
//! The same filter is handed to the remote subscription (which narrows the
//! mirrored row set) and applied to merged rows on read, so a row created
//! locally shows up under the same filter it will later be mirrored under.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single predicate on a top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterClause {
    /// Field equals the value.
    Eq { field: String, value: Value },
    /// Field equals any of the values.
    In { field: String, values: Vec<Value> },
    /// Field is absent or null.
    IsNull { field: String },
}

impl FilterClause {
    fn matches(&self, row: &Value) -> bool {
        match self {
            Self::Eq { field, value } => row.get(field).is_some_and(|v| v == value),
            Self::In { field, values } => row
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Self::IsNull { field } => row.get(field).is_none_or(Value::is_null),
        }
    }
}

/// Conjunction of clauses. The empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub clauses: Vec<FilterClause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push(FilterClause::Eq {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn any_of<V: Into<Value>>(
        mut self,
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.clauses.push(FilterClause::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn is_null(mut self, field: impl Into<String>) -> Self {
        self.clauses.push(FilterClause::IsNull {
            field: field.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Tests a flattened `{id, ...fields}` row.
    pub fn matches(&self, row: &Value) -> bool {
        self.clauses.iter().all(|c| c.matches(row))
    }
}
