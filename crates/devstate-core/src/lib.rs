//! # DevState Core
//!
//! Pure primitives for the DevState engine: the state document, the
//! hash-chained history entry, the keyed-hash keyring, and the chain
//! verification algorithm.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over JSON documents and keyed hashes.
//!
//! ## Key Types
//!
//! - [`StateDocument`] - The singleton project-state document and its checksum
//! - [`HistoryEntry`] - One link of the append-only audit ledger
//! - [`EntryDraft`] - Caller-supplied fields of an entry, sealed with [`EntryDraft::seal`]
//! - [`Keyring`] - The set of signing keys, exactly one of them active
//! - [`Lease`] - An advisory, time-bounded lock over a named scope
//!
//! ## Canonicalization
//!
//! Checksums and keyed hashes are computed over canonical JSON. See the
//! [`canonical`] module.

pub mod canonical;
pub mod chain;
pub mod clock;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod lease;
pub mod schema;
pub mod state;

pub use canonical::{canonical_bytes, canonical_json};
pub use chain::{verify_chain, Anchor, BreakReason, ChainBreak, VerifyReport};
pub use clock::now_millis;
pub use crypto::{keyed_hash, state_checksum, HmacKey, KeyInfo, Keyring, SigningSecret};
pub use entry::{Action, EntryDraft, HistoryEntry, SealedEntry, TOMBSTONE_TARGET};
pub use error::{CoreError, Result};
pub use lease::{Lease, LockId};
pub use schema::{JsonSchemaValidator, SchemaValidator, SchemaVerdict};
pub use state::{into_object, shallow_merge, StateDocument};
