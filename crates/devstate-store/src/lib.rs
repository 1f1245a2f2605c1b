//! # DevState Store
//!
//! Storage abstraction for the DevState engine. Provides a trait-based
//! interface for the state document, the hash-chained ledger, its archive,
//! signing keys and leases, with SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`AppendResult`] - Result of appending a sealed entry
//! - [`EntryFilter`] - Ledger search criteria
//!
//! ## Usage
//!
//! ```rust,no_run
//! use devstate_store::{SqliteStore, Store};
//!
//! async fn example() {
//!     let store = SqliteStore::open("devstate.db").unwrap();
//!     let tail = store.chain_tail().await.unwrap();
//!     println!("tail: {:?}", tail.map(|e| e.id));
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **No forks**: appends compare the entry's `hmac_prev` with the chain
//!   tail inside the write transaction and return `Conflict` on mismatch
//! - **Atomic units**: a state write and the entry describing it commit
//!   together or not at all; the same holds for archive and key rotation
//! - **Ids survive archival**: archived entries keep their ids, and new ids
//!   continue after the largest id in either table

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    tombstoned_ids, AppendResult, ArchivePlan, EntryFilter, Snapshot, Store, TailWindow,
    DEFAULT_SEARCH_LIMIT,
};
