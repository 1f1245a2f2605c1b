//! The state document and its patch semantics.
//!
//! Patches are applied with [`shallow_merge`]: top-level keys of the patch
//! replace the document's keys wholesale. Nested objects are never merged
//! recursively; `{a: {x: 1}}` applied to `{a: {x: 1, y: 2}}` yields
//! `{a: {x: 1}}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::state_checksum;
use crate::error::{json_type_name, CoreError, Result};

/// The singleton project-state document.
///
/// `checksum` is always the content hash of the canonical serialization of
/// `json`; constructors compute it, so a document built here is never stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub json: Map<String, Value>,
    pub checksum: String,
    pub updated_at: i64,
}

impl StateDocument {
    /// Build a document and compute its checksum.
    pub fn new(json: Map<String, Value>, updated_at: i64) -> Self {
        let checksum = state_checksum(&Value::Object(json.clone()));
        Self {
            json,
            checksum,
            updated_at,
        }
    }

    /// Build a document from an arbitrary JSON value, which must be an object.
    pub fn from_value(value: Value, updated_at: i64) -> Result<Self> {
        Ok(Self::new(into_object(value)?, updated_at))
    }

    /// The document body as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.json.clone())
    }

    /// Whether `checksum` matches the current body.
    pub fn checksum_is_current(&self) -> bool {
        state_checksum(&self.to_value()) == self.checksum
    }

    /// The document that results from applying `patch` at time `now`.
    pub fn patched(&self, patch: &Map<String, Value>, now: i64) -> StateDocument {
        StateDocument::new(shallow_merge(&self.json, patch), now)
    }
}

/// Merge `patch` into `base` by top-level key replacement.
///
/// Every key in `patch` overwrites the same key in `base` with the patch's
/// value, whatever either value's type. Keys absent from `patch` are kept.
/// This is deliberately non-recursive.
pub fn shallow_merge(base: &Map<String, Value>, patch: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in patch {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

/// Require a JSON object.
pub fn into_object(value: Value) -> Result<Map<String, Value>> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::NotAnObject(json_type_name(&other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        into_object(value).unwrap()
    }

    #[test]
    fn test_nested_object_replaced_not_merged() {
        let base = obj(json!({"a": {"x": 1, "y": 2}}));
        let patch = obj(json!({"a": {"x": 1}}));
        assert_eq!(Value::Object(shallow_merge(&base, &patch)), json!({"a": {"x": 1}}));
    }

    #[test]
    fn test_untouched_keys_survive() {
        let base = obj(json!({"a": 1, "b": [1, 2]}));
        let patch = obj(json!({"c": true}));
        assert_eq!(
            Value::Object(shallow_merge(&base, &patch)),
            json!({"a": 1, "b": [1, 2], "c": true})
        );
    }

    #[test]
    fn test_null_overwrites_rather_than_deletes() {
        let base = obj(json!({"a": 1}));
        let patch = obj(json!({"a": null}));
        assert_eq!(Value::Object(shallow_merge(&base, &patch)), json!({"a": null}));
    }

    #[test]
    fn test_checksum_follows_content() {
        let doc = StateDocument::from_value(json!({"project": "x"}), 1).unwrap();
        assert!(doc.checksum_is_current());

        let patched = doc.patched(&obj(json!({"version": 2})), 2);
        assert!(patched.checksum_is_current());
        assert_ne!(patched.checksum, doc.checksum);
        assert_eq!(patched.updated_at, 2);

        let mut stale = patched.clone();
        stale.json.insert("drift".into(), json!(true));
        assert!(!stale.checksum_is_current());
    }

    #[test]
    fn test_from_value_requires_object() {
        let err = StateDocument::from_value(json!([1, 2]), 0).unwrap_err();
        assert!(matches!(err, CoreError::NotAnObject("array")));
    }
}
