use crate::{ValidationError, ValidationResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Describes one entity kind: where it lives and what its payload looks like.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Name consumers use for the kind (e.g. "work").
    pub kind: String,
    /// Remote table the kind is mirrored from and written to (e.g. "works").
    pub table: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Integer millisecond field that the remote store bumps on every write.
    /// Local mutations stamp it, and cleanup uses it to detect convergence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_field: Option<String>,
}

impl EntitySchema {
    /// A schema with no declared fields and no version marker.
    pub fn new(kind: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            table: table.into(),
            fields: Vec::new(),
            version_field: None,
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_version_field(mut self, field: impl Into<String>) -> Self {
        self.version_field = Some(field.into());
        self
    }

    /// Looks up the spec of a top-level field.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Checks that the table name is safe to use as a storage identifier.
    pub fn validate_table(&self) -> ValidationResult<()> {
        let mut chars = self.table.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if head_ok && tail_ok {
            Ok(())
        } else {
            Err(ValidationError::InvalidTable(self.table.clone()))
        }
    }

    /// Validates the full payload of a new entity: every required field must
    /// be present and every declared field must have the right type.
    pub fn validate_insert(&self, payload: &Value) -> ValidationResult<()> {
        let obj = payload.as_object().ok_or(ValidationError::NotAnObject)?;
        for spec in self.fields.iter().filter(|f| f.required) {
            match obj.get(&spec.name) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::MissingField(spec.name.clone()));
                }
                Some(_) => {}
            }
        }
        self.validate_types(payload)
    }

    /// Validates a partial update: only the fields present are checked, and
    /// required fields may not be cleared.
    pub fn validate_patch(&self, patch: &Value) -> ValidationResult<()> {
        let obj = patch.as_object().ok_or(ValidationError::NotAnObject)?;
        for (name, value) in obj {
            if value.is_null() && self.field(name).is_some_and(|f| f.required) {
                return Err(ValidationError::MissingField(name.clone()));
            }
        }
        self.validate_types(patch)
    }

    fn validate_types(&self, payload: &Value) -> ValidationResult<()> {
        let Some(obj) = payload.as_object() else {
            return Err(ValidationError::NotAnObject);
        };
        for (name, value) in obj {
            if value.is_null() {
                continue;
            }
            if let Some(spec) = self.field(name) {
                spec.check(value)?;
            }
        }
        Ok(())
    }
}

/// A declared top-level field of an entity kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Allowed values. Only meaningful when the type is `Enum`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(alias = "options")]
    pub enum_options: Option<Vec<String>>,
}

impl FieldSpec {
    fn simple(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            enum_options: None,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::simple(name, FieldType::Text)
    }

    /// Array of strings.
    pub fn tags(name: &str) -> Self {
        Self::simple(name, FieldType::Tag)
    }

    /// Milliseconds since epoch, or an RFC 3339 string.
    pub fn datetime(name: &str) -> Self {
        Self::simple(name, FieldType::DateTime)
    }

    pub fn number(name: &str) -> Self {
        Self::simple(name, FieldType::Number)
    }

    pub fn bool(name: &str) -> Self {
        Self::simple(name, FieldType::Bool)
    }

    /// Id of another entity.
    pub fn relation(name: &str) -> Self {
        Self::simple(name, FieldType::Relation)
    }

    pub fn json(name: &str) -> Self {
        Self::simple(name, FieldType::Json)
    }

    pub fn enumeration(name: &str, options: &[&str]) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Enum,
            required: false,
            enum_options: Some(options.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// Marks the field as required on insert.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    fn check(&self, value: &Value) -> ValidationResult<()> {
        let ok = match self.field_type {
            FieldType::Text | FieldType::Relation => value.is_string(),
            FieldType::Tag => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            FieldType::DateTime => value.is_i64() || value.is_u64() || value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
            FieldType::Enum => {
                let Some(s) = value.as_str() else {
                    return Err(self.wrong_type());
                };
                let allowed = self
                    .enum_options
                    .as_ref()
                    .is_none_or(|opts| opts.iter().any(|o| o == s));
                if !allowed {
                    return Err(ValidationError::InvalidOption {
                        field: self.name.clone(),
                        value: s.to_string(),
                    });
                }
                true
            }
        };
        if ok { Ok(()) } else { Err(self.wrong_type()) }
    }

    fn wrong_type(&self) -> ValidationError {
        ValidationError::WrongType {
            field: self.name.clone(),
            expected: self.field_type.expected(),
        }
    }
}

/// The data type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Tag,
    DateTime,
    Number,
    Bool,
    Relation,
    Json,
    Enum,
}

impl FieldType {
    fn expected(&self) -> &'static str {
        match self {
            Self::Text => "a string",
            Self::Tag => "an array of strings",
            Self::DateTime => "a timestamp",
            Self::Number => "a number",
            Self::Bool => "a boolean",
            Self::Relation => "an entity id",
            Self::Json => "JSON",
            Self::Enum => "one of the declared options",
        }
    }
}
