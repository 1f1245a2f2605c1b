//! The schema-validator contract consumed by the engine.
//!
//! The engine only needs a pass/fail verdict with human-readable errors.
//! [`JsonSchemaValidator`] provides it for JSON Schema documents; any
//! `Fn(&Value) -> SchemaVerdict` closure works too.

use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Result of validating a candidate state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaVerdict {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl SchemaVerdict {
    pub fn pass() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn fail(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// Validates candidate state documents.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, document: &Value) -> SchemaVerdict;
}

impl<F> SchemaValidator for F
where
    F: Fn(&Value) -> SchemaVerdict + Send + Sync,
{
    fn validate(&self, document: &Value) -> SchemaVerdict {
        self(document)
    }
}

/// JSON Schema validator for the state document.
pub struct JsonSchemaValidator {
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator").finish_non_exhaustive()
    }
}

impl JsonSchemaValidator {
    /// Compile a JSON Schema.
    pub fn new(schema: &Value) -> Result<Self> {
        let validator = jsonschema::options()
            .build(schema)
            .map_err(|e| CoreError::InvalidSchema(e.to_string()))?;
        Ok(Self { validator })
    }

    /// Parse and compile a JSON Schema from text.
    pub fn from_json_str(schema: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(schema).map_err(|e| CoreError::InvalidSchema(e.to_string()))?;
        Self::new(&value)
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, document: &Value) -> SchemaVerdict {
        let errors: Vec<String> = self
            .validator
            .iter_errors(document)
            .map(|e| e.to_string())
            .collect();

        if errors.is_empty() {
            SchemaVerdict::pass()
        } else {
            SchemaVerdict::fail(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["project"],
            "properties": {
                "project": {"type": "string"},
                "version": {"type": "integer"}
            }
        })
    }

    #[test]
    fn test_accepts_valid_document() {
        let validator = JsonSchemaValidator::new(&schema()).unwrap();
        let verdict = validator.validate(&json!({"project": "p", "version": 1}));
        assert_eq!(verdict, SchemaVerdict::pass());
    }

    #[test]
    fn test_rejects_type_mismatch_and_missing_field() {
        let validator = JsonSchemaValidator::new(&schema()).unwrap();

        let verdict = validator.validate(&json!({"project": "p", "version": "one"}));
        assert!(!verdict.valid);
        assert_eq!(verdict.errors.len(), 1);

        let verdict = validator.validate(&json!({"version": 1}));
        assert!(!verdict.valid);
    }

    #[test]
    fn test_invalid_schema_is_an_error() {
        let err = JsonSchemaValidator::new(&json!({"type": 12})).unwrap_err();
        assert!(matches!(err, CoreError::InvalidSchema(_)));
        assert!(JsonSchemaValidator::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_closure_validator() {
        let validator = |doc: &Value| {
            if doc.get("frozen").is_some() {
                SchemaVerdict::fail(vec!["frozen is read-only".into()])
            } else {
                SchemaVerdict::pass()
            }
        };
        assert!(validator.validate(&json!({})).valid);
        assert!(!SchemaValidator::validate(&validator, &json!({"frozen": 1})).valid);
    }
}
