//! Store trait: the abstract interface for state and ledger persistence.
//!
//! This trait allows the engine to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use std::collections::BTreeSet;

use async_trait::async_trait;
use devstate_core::{Action, HistoryEntry, HmacKey, Lease, LockId, SealedEntry, StateDocument};

use crate::error::Result;

/// Default cap on search results.
pub const DEFAULT_SEARCH_LIMIT: usize = 1000;

/// Result of appending a sealed entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendResult {
    /// The entry was committed with the returned id.
    Appended(HistoryEntry),
    /// The entry's `hmac_prev` is not the current chain tail. Nothing was
    /// written.
    Conflict {
        /// The tail hmac found at commit time.
        tail: Option<String>,
    },
}

/// A consistent read of the state document, the archive and the live
/// ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: Option<StateDocument>,
    /// Archived entries in ascending id order.
    pub archived: Vec<HistoryEntry>,
    /// Live entries in ascending id order.
    pub entries: Vec<HistoryEntry>,
}

/// The newest live entries together with the entry that precedes them,
/// read in one transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TailWindow {
    /// The entry immediately before `entries[0]`, live or archived.
    pub predecessor: Option<HistoryEntry>,
    /// Live entries in ascending id order.
    pub entries: Vec<HistoryEntry>,
}

/// The live prefix that an archive cutoff would relocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchivePlan {
    pub count: usize,
    /// Id of the last entry in the prefix.
    pub through_id: Option<u64>,
}

/// Ledger search criteria. Every criterion is optional; results are newest
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    pub actor: Option<String>,
    pub action: Option<Action>,
    /// Inclusive lower bound on `ts` (Unix ms).
    pub since: Option<i64>,
    /// Inclusive upper bound on `ts` (Unix ms).
    pub until: Option<i64>,
    pub limit: usize,
    /// Skip entries that a `delete_history` entry tombstones.
    pub hide_tombstoned: bool,
}

impl Default for EntryFilter {
    fn default() -> Self {
        Self {
            actor: None,
            action: None,
            since: None,
            until: None,
            limit: DEFAULT_SEARCH_LIMIT,
            hide_tombstoned: false,
        }
    }
}

impl EntryFilter {
    /// Whether `entry` satisfies every field criterion.
    ///
    /// Tombstone hiding and the limit are applied by the caller.
    pub fn matches(&self, entry: &HistoryEntry) -> bool {
        if let Some(actor) = &self.actor {
            if &entry.actor != actor {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &entry.action != action {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.ts > until {
                return false;
            }
        }
        true
    }
}

/// Ids targeted by tombstones among `entries`.
pub fn tombstoned_ids<'a, I>(entries: I) -> BTreeSet<u64>
where
    I: IntoIterator<Item = &'a HistoryEntry>,
{
    entries
        .into_iter()
        .filter_map(HistoryEntry::tombstone_target)
        .collect()
}

/// The Store trait: async interface for state and ledger persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, we use `spawn_blocking` internally to avoid blocking the runtime.
///
/// # Design Notes
///
/// - **Compare-and-append**: every write that appends to the ledger checks,
///   inside its transaction, that the entry's `hmac_prev` is the current
///   chain tail. A stale link returns [`AppendResult::Conflict`] and writes
///   nothing, so the chain cannot fork.
/// - **Ids** are assigned by the store: one more than the largest id in the
///   live ledger or the archive.
/// - **Chain tail** is the entry with the largest id, live or archived.
#[async_trait]
pub trait Store: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // State Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Load the singleton state document.
    async fn load_state(&self) -> Result<Option<StateDocument>>;

    /// Write the state document and append the entry describing the write,
    /// in one transaction.
    async fn commit_state(&self, doc: &StateDocument, entry: &SealedEntry)
        -> Result<AppendResult>;

    // ─────────────────────────────────────────────────────────────────────────
    // Ledger Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append a sealed entry to the ledger.
    async fn append_entry(&self, entry: &SealedEntry) -> Result<AppendResult>;

    /// The latest entry, live or archived.
    async fn chain_tail(&self) -> Result<Option<HistoryEntry>>;

    /// Get a live entry by id.
    async fn get_entry(&self, id: u64) -> Result<Option<HistoryEntry>>;

    /// The last `limit` live entries (all when `None`), in ascending id order.
    async fn tail_entries(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>>;

    /// The last `limit` live entries (all when `None`) and their
    /// predecessor, read consistently.
    async fn tail_window(&self, limit: Option<usize>) -> Result<TailWindow>;

    /// Read the state document, the archive and the live ledger
    /// consistently.
    async fn snapshot(&self) -> Result<Snapshot>;

    /// Search live entries, newest first.
    async fn search_entries(&self, filter: &EntryFilter) -> Result<Vec<HistoryEntry>>;

    /// Ids that live tombstone entries mark as deleted.
    async fn tombstoned_ids(&self) -> Result<BTreeSet<u64>>;

    /// Replace the state document, the archive and the live ledger with the
    /// given contents, in one transaction.
    async fn replace_all(
        &self,
        doc: &StateDocument,
        archived: &[HistoryEntry],
        entries: &[HistoryEntry],
    ) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Archive Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Measure the longest live prefix whose entries all have `ts < cutoff`.
    async fn plan_archive(&self, cutoff: i64) -> Result<ArchivePlan>;

    /// Move live entries with `id <= through_id` to the archive and append
    /// the audit entry, in one transaction.
    async fn archive_through(&self, through_id: u64, audit: &SealedEntry)
        -> Result<AppendResult>;

    /// All archived entries in ascending id order.
    async fn archived_entries(&self) -> Result<Vec<HistoryEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Key Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// All persisted signing keys.
    async fn load_keys(&self) -> Result<Vec<HmacKey>>;

    /// Persist `key` as the only active key without a ledger entry.
    ///
    /// Used to initialize an empty keyring.
    async fn install_key(&self, key: &HmacKey) -> Result<()>;

    /// Persist `key` as the only active key and append the audit entry that
    /// records the rotation, in one transaction.
    async fn rotate_key(&self, key: &HmacKey, audit: &SealedEntry) -> Result<AppendResult>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lease Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_lease(&self, lease: &Lease) -> Result<()>;

    /// Delete a lease. Returns whether it existed.
    async fn remove_lease(&self, lock_id: &LockId) -> Result<bool>;

    /// Delete every lease with `expires_at <= now`. Returns how many.
    async fn remove_expired_leases(&self, now: i64) -> Result<usize>;

    /// Unexpired leases, optionally restricted to one scope, soonest
    /// expiry first.
    async fn list_leases(&self, scope: Option<&str>, now: i64) -> Result<Vec<Lease>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstate_core::{EntryDraft, Keyring, SigningSecret};

    fn entry(id: u64, actor: &str, action: &str, ts: i64) -> HistoryEntry {
        let ring = Keyring::new(HmacKey::new("k", SigningSecret::generate(), 0));
        EntryDraft::new(actor, action)
            .seal(ts, None, ring.active())
            .into_entry(id)
    }

    #[test]
    fn test_filter_bounds_are_inclusive() {
        let e = entry(1, "alice", "note", 100);
        let filter = EntryFilter {
            since: Some(100),
            until: Some(100),
            ..Default::default()
        };
        assert!(filter.matches(&e));

        let filter = EntryFilter {
            since: Some(101),
            ..Default::default()
        };
        assert!(!filter.matches(&e));
    }

    #[test]
    fn test_filter_actor_and_action() {
        let e = entry(1, "alice", "update_state", 0);
        let filter = EntryFilter {
            actor: Some("alice".into()),
            action: Some(Action::UpdateState),
            ..Default::default()
        };
        assert!(filter.matches(&e));

        let filter = EntryFilter {
            actor: Some("bob".into()),
            ..Default::default()
        };
        assert!(!filter.matches(&e));
    }

    #[test]
    fn test_tombstoned_ids() {
        let ring = Keyring::new(HmacKey::new("k", SigningSecret::generate(), 0));
        let entries = vec![
            entry(1, "a", "note", 0),
            EntryDraft::tombstone("a", 1)
                .seal(1, None, ring.active())
                .into_entry(2),
        ];
        assert_eq!(tombstoned_ids(&entries), BTreeSet::from([1]));
    }
}
