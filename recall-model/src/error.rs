use thiserror::Error;

/// Result type for payload validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Why a payload was refused before being recorded locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("field `{field}` must be {expected}")]
    WrongType { field: String, expected: &'static str },

    #[error("field `{field}` has value `{value}` outside the allowed options")]
    InvalidOption { field: String, value: String },

    #[error("invalid table name `{0}`")]
    InvalidTable(String),

    #[error("{0}")]
    Rejected(String),
}
