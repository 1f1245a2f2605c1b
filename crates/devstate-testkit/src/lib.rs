//! # DevState Testkit
//!
//! Testing utilities for DevState.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: engines over in-memory or temporary SQLite stores, with
//!   a small test schema and a fixed signing key
//! - **Generators**: Proptest strategies for JSON documents, patches and
//!   ledger operation sequences
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use devstate_testkit::generators::json_object;
//!
//! proptest! {
//!     #[test]
//!     fn merge_keeps_patch_values(base in json_object(), patch in json_object()) {
//!         let merged = devstate_core::shallow_merge(&base, &patch);
//!         for (k, v) in &patch {
//!             prop_assert_eq!(&merged[k], v);
//!         }
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! ```rust,ignore
//! use devstate_testkit::fixtures::{memory_engine, TestFixture};
//!
//! let engine = memory_engine().await;
//! let fixture = TestFixture::new();
//! let durable = fixture.sqlite_engine().await;
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{memory_engine, seeded_memory_engine, test_key, test_schema, TestFixture};
pub use generators::{apply_op, json_object, json_value, ledger_op, LedgerOp};
