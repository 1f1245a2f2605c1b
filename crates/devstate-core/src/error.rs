//! Error types for DevState core.

use thiserror::Error;

/// Errors raised by the pure primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid JSON schema: {0}")]
    InvalidSchema(String),

    #[error("signing secret must not be empty")]
    EmptySecret,

    #[error("invalid keyring: {0}")]
    InvalidKeyring(String),

    #[error("hex decoding error: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Name of a JSON value's type, for error messages.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
