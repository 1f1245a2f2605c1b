//! Engine configuration.
//!
//! Configuration is loaded once at process start, validated, and then
//! handed to the engine by value. Nothing reads the environment after
//! startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use devstate_core::{now_millis, HmacKey, JsonSchemaValidator, SigningSecret};

use crate::error::{EngineError, Result};

pub const ENV_DB: &str = "DEVSTATE_DB";
pub const ENV_SECRET: &str = "HMAC_SECRET";
pub const ENV_KEY_ID: &str = "DEVSTATE_KEY_ID";
pub const ENV_SCHEMA: &str = "DEVSTATE_SCHEMA";
pub const ENV_EXPORT_ROOT: &str = "DEVSTATE_EXPORT_ROOT";
pub const ENV_UPDATE_TIMEOUT_MS: &str = "DEVSTATE_UPDATE_TIMEOUT_MS";

pub const DEFAULT_DB: &str = "devstate.db";
pub const DEFAULT_KEY_ID: &str = "primary";
pub const DEFAULT_EXPORT_ROOT: &str = ".devstate";
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Runtime options of a running engine.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long a mutation waits for the writer hold.
    pub update_timeout: Duration,
    /// Directory holding export/import artifacts.
    pub export_root: PathBuf,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            export_root: PathBuf::from(DEFAULT_EXPORT_ROOT),
        }
    }
}

/// Process-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Signing secret. Required.
    pub secret: Option<SigningSecret>,
    /// Identifier of `secret` in the keyring.
    pub key_id: String,
    /// JSON Schema of the state document. Required.
    pub schema_path: Option<PathBuf>,
    pub options: EngineOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB),
            secret: None,
            key_id: DEFAULT_KEY_ID.to_string(),
            schema_path: None,
            options: EngineOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// Unset and empty variables are treated alike.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(db) = var(ENV_DB) {
            config.db_path = PathBuf::from(db);
        }
        if let Some(secret) = var(ENV_SECRET) {
            config.secret = Some(secret.parse()?);
        }
        if let Some(key_id) = var(ENV_KEY_ID) {
            config.key_id = key_id;
        }
        config.schema_path = var(ENV_SCHEMA).map(PathBuf::from);
        if let Some(root) = var(ENV_EXPORT_ROOT) {
            config.options.export_root = PathBuf::from(root);
        }
        if let Some(ms) = var(ENV_UPDATE_TIMEOUT_MS) {
            let ms: u64 = ms.parse().map_err(|_| {
                EngineError::Configuration(format!(
                    "{} must be a whole number of milliseconds, got {:?}",
                    ENV_UPDATE_TIMEOUT_MS, ms
                ))
            })?;
            config.options.update_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Check that everything the engine needs to start is present.
    pub fn validate(&self) -> Result<()> {
        if self.secret.is_none() {
            return Err(EngineError::Configuration(format!(
                "{} is not set; refusing to run unsigned",
                ENV_SECRET
            )));
        }
        if self.key_id.trim().is_empty() {
            return Err(EngineError::Configuration("key id must not be blank".into()));
        }
        if self.schema_path.is_none() {
            return Err(EngineError::Configuration(format!("{} is not set", ENV_SCHEMA)));
        }
        if self.options.update_timeout.is_zero() {
            return Err(EngineError::Configuration(
                "update timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    /// The configured signing key.
    pub fn signing_key(&self) -> Result<HmacKey> {
        let secret = self.secret.clone().ok_or_else(|| {
            EngineError::Configuration(format!("{} is not set", ENV_SECRET))
        })?;
        Ok(HmacKey::new(self.key_id.clone(), secret, now_millis()))
    }

    /// Read and compile the state document schema.
    pub fn load_validator(&self) -> Result<JsonSchemaValidator> {
        let path = self
            .schema_path
            .as_deref()
            .ok_or_else(|| EngineError::Configuration(format!("{} is not set", ENV_SCHEMA)))?;
        load_schema(path)
    }
}

/// Read and compile a JSON Schema file.
pub fn load_schema(path: &Path) -> Result<JsonSchemaValidator> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        EngineError::Configuration(format!("cannot read schema {}: {}", path.display(), e))
    })?;
    JsonSchemaValidator::from_json_str(&text).map_err(|e| {
        EngineError::Configuration(format!("schema {}: {}", path.display(), e))
    })
}
