//! # DevState Engine
//!
//! The unified API for DevState: one canonical project-state document and a
//! tamper-evident, append-only audit ledger shared by cooperating agents.
//!
//! ## Overview
//!
//! - **State**: a singleton JSON document, patched by top-level key
//!   replacement and validated against a schema before every write
//! - **Ledger**: every mutation appends an entry whose HMAC covers its
//!   fields and its predecessor's HMAC, forming a hash chain
//! - **Verification**: recomputes the chain and reports the first break
//! - **Leases**: advisory, time-bounded locks over named scopes
//! - **Snapshots**: export/import of state and ledger as one trust-checked unit
//! - **Keys and archival**: key rotation with per-entry key ids, and
//!   relocation of old entries to cold storage
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devstate_engine::{Engine, EngineConfig};
//! use serde_json::json;
//!
//! async fn example() -> devstate_engine::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let engine = Engine::from_config(&config).await?;
//!
//!     engine.seed(json!({"project": "demo"}), "provisioner").await?;
//!     let receipt = engine.update(json!({"phase": "build"}), "agent-1").await?;
//!     println!("entry {} -> {}", receipt.entry_id, receipt.checksum);
//!
//!     assert!(engine.verify(0).await?.ok);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `devstate_engine::core` - Pure primitives (entries, keyring, chain verification)
//! - `devstate_engine::store` - Storage abstraction and SQLite

pub mod config;
pub mod engine;
pub mod error;
pub mod snapshot;

// Re-export component crates
pub use devstate_core as core;
pub use devstate_store as store;

// Re-export main types for convenience
pub use config::{EngineConfig, EngineOptions};
pub use engine::{ArchiveReport, Engine, ImportReport, SeedOutcome, UpdateReceipt};
pub use error::{EngineError, ErrorKind, Result};
pub use snapshot::{ExportBundle, ExportPaths, HistorySnapshot};

// Re-export commonly used core and store types
pub use devstate_core::{
    Action, BreakReason, ChainBreak, EntryDraft, HistoryEntry, KeyInfo, Lease, LockId,
    SigningSecret, StateDocument, VerifyReport,
};
pub use devstate_store::{EntryFilter, MemoryStore, SqliteStore, Store};
