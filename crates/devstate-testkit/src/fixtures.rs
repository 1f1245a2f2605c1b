//! Test fixtures and helpers.

use std::path::PathBuf;
use std::time::Duration;

use devstate_core::{HmacKey, JsonSchemaValidator, SigningSecret};
use devstate_engine::{Engine, EngineOptions};
use devstate_store::{MemoryStore, SqliteStore};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Secret every fixture engine signs with.
pub const TEST_SECRET: &[u8] = b"devstate-test-secret";

/// Id of the fixture signing key.
pub const TEST_KEY_ID: &str = "primary";

/// Actor recorded by fixture writes.
pub const TEST_ACTOR: &str = "tester";

/// Schema used by fixture engines.
///
/// Any object is accepted, except that `bad_field` and `count` must be
/// numbers and `project` must be a string when present.
pub fn test_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "type": "object",
        "properties": {
            "project": {"type": "string"},
            "count": {"type": "number"},
            "bad_field": {"type": "number"}
        }
    })
}

/// Compiled [`test_schema`].
pub fn test_validator() -> JsonSchemaValidator {
    JsonSchemaValidator::new(&test_schema()).expect("test schema compiles")
}

/// The fixture signing key.
pub fn test_key() -> HmacKey {
    key_with_secret(TEST_KEY_ID, TEST_SECRET)
}

/// A key with the given id and secret, created at the epoch.
pub fn key_with_secret(id: &str, secret: &[u8]) -> HmacKey {
    HmacKey::new(id, SigningSecret::new(secret.to_vec()).expect("non-empty secret"), 0)
}

/// Options suitable for tests: a short writer timeout and the given export root.
pub fn test_options(export_root: PathBuf) -> EngineOptions {
    EngineOptions {
        update_timeout: Duration::from_secs(5),
        export_root,
    }
}

/// An unseeded engine over a fresh in-memory store.
pub async fn memory_engine() -> Engine<MemoryStore> {
    Engine::open(
        MemoryStore::new(),
        test_validator(),
        test_key(),
        EngineOptions::default(),
    )
    .await
    .expect("open memory engine")
}

/// An in-memory engine seeded with `json`.
pub async fn seeded_memory_engine(json: Value) -> Engine<MemoryStore> {
    let engine = memory_engine().await;
    engine.seed(json, TEST_ACTOR).await.expect("seed state");
    engine
}

/// A temporary directory holding a SQLite database and an export root.
///
/// The directory is removed when the fixture is dropped, so keep the
/// fixture alive as long as its engines.
pub struct TestFixture {
    pub dir: TempDir,
}

impl TestFixture {
    /// Create a fixture in a new temporary directory.
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
        }
    }

    /// Path of the fixture database.
    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("devstate.db")
    }

    /// Path of the fixture export root.
    pub fn export_root(&self) -> PathBuf {
        self.dir.path().join("export")
    }

    /// Open an engine over the fixture database.
    ///
    /// Opening twice yields two engines over the same file.
    pub async fn sqlite_engine(&self) -> Engine<SqliteStore> {
        let store = SqliteStore::open(self.db_path()).expect("open sqlite store");
        Engine::open(store, test_validator(), test_key(), test_options(self.export_root()))
            .await
            .expect("open sqlite engine")
    }

    /// An in-memory engine sharing this fixture's export root.
    pub async fn memory_engine(&self) -> Engine<MemoryStore> {
        Engine::open(
            MemoryStore::new(),
            test_validator(),
            test_key(),
            test_options(self.export_root()),
        )
        .await
        .expect("open memory engine")
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_rejects_non_numeric_bad_field() {
        use devstate_core::SchemaValidator;

        let validator = test_validator();
        assert!(validator.validate(&json!({"bad_field": 3})).valid);
        assert!(!validator.validate(&json!({"bad_field": "x"})).valid);
        assert!(validator.validate(&json!({"anything": [1, "two"]})).valid);
    }

    #[test]
    fn test_fixture_paths() {
        let fixture = TestFixture::new();
        assert!(fixture.db_path().starts_with(fixture.dir.path()));
        assert!(fixture.export_root().starts_with(fixture.dir.path()));
    }
}
