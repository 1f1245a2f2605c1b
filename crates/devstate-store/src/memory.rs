//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence. Each call holds the
//! write lock for its whole body, which gives the same all-or-nothing
//! behavior as a SQLite transaction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use devstate_core::{HistoryEntry, HmacKey, Lease, LockId, SealedEntry, StateDocument};

use crate::error::{Result, StoreError};
use crate::traits::{self, AppendResult, ArchivePlan, EntryFilter, Snapshot, Store, TailWindow};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    state: Option<StateDocument>,

    /// Live ledger indexed by id.
    entries: BTreeMap<u64, HistoryEntry>,

    /// Archived entries indexed by id.
    archive: BTreeMap<u64, HistoryEntry>,

    /// Signing keys by id.
    keys: BTreeMap<String, HmacKey>,

    /// Leases by lock id.
    leases: HashMap<LockId, Lease>,
}

impl MemoryStoreInner {
    /// The entry with the largest id below `before`, live or archived.
    fn latest_before(&self, before: u64) -> Option<&HistoryEntry> {
        let live = self.entries.range(..before).next_back().map(|(_, e)| e);
        let archived = self.archive.range(..before).next_back().map(|(_, e)| e);
        match (live, archived) {
            (Some(a), Some(b)) => Some(if a.id > b.id { a } else { b }),
            (a, b) => a.or(b),
        }
    }

    fn tail(&self) -> Option<&HistoryEntry> {
        self.latest_before(u64::MAX)
    }

    fn live_tail(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let skip = match limit {
            Some(limit) => self.entries.len().saturating_sub(limit),
            None => 0,
        };
        self.entries.values().skip(skip).cloned().collect()
    }

    /// Append `entry` if it links to the current tail.
    fn append(&mut self, entry: &SealedEntry) -> AppendResult {
        let tail = self.tail();
        let tail_hmac = tail.map(|e| e.hmac.clone());
        if tail_hmac != entry.hmac_prev {
            return AppendResult::Conflict { tail: tail_hmac };
        }

        let id = tail.map(|e| e.id + 1).unwrap_or(1);
        let committed = entry.clone().into_entry(id);
        self.entries.insert(id, committed.clone());
        AppendResult::Appended(committed)
    }

    fn activate_key(&mut self, key: &HmacKey) {
        for existing in self.keys.values_mut() {
            existing.active = false;
        }
        let mut key = key.clone();
        key.active = true;
        if let Some(existing) = self.keys.get(&key.id) {
            key.created_at = existing.created_at;
        }
        self.keys.insert(key.id.clone(), key);
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_state(&self) -> Result<Option<StateDocument>> {
        Ok(self.read()?.state.clone())
    }

    async fn commit_state(
        &self,
        doc: &StateDocument,
        entry: &SealedEntry,
    ) -> Result<AppendResult> {
        let mut inner = self.write()?;
        let result = inner.append(entry);
        if let AppendResult::Appended(_) = result {
            inner.state = Some(doc.clone());
        }
        Ok(result)
    }

    async fn append_entry(&self, entry: &SealedEntry) -> Result<AppendResult> {
        Ok(self.write()?.append(entry))
    }

    async fn chain_tail(&self) -> Result<Option<HistoryEntry>> {
        Ok(self.read()?.tail().cloned())
    }

    async fn get_entry(&self, id: u64) -> Result<Option<HistoryEntry>> {
        Ok(self.read()?.entries.get(&id).cloned())
    }

    async fn tail_entries(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        Ok(self.read()?.live_tail(limit))
    }

    async fn tail_window(&self, limit: Option<usize>) -> Result<TailWindow> {
        let inner = self.read()?;
        let entries = inner.live_tail(limit);
        let predecessor = entries
            .first()
            .and_then(|first| inner.latest_before(first.id))
            .cloned();
        Ok(TailWindow {
            predecessor,
            entries,
        })
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        let inner = self.read()?;
        Ok(Snapshot {
            state: inner.state.clone(),
            archived: inner.archive.values().cloned().collect(),
            entries: inner.entries.values().cloned().collect(),
        })
    }

    async fn search_entries(&self, filter: &EntryFilter) -> Result<Vec<HistoryEntry>> {
        let inner = self.read()?;
        let hidden = if filter.hide_tombstoned {
            traits::tombstoned_ids(inner.entries.values())
        } else {
            BTreeSet::new()
        };

        Ok(inner
            .entries
            .values()
            .rev()
            .filter(|e| filter.matches(e) && !hidden.contains(&e.id))
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn tombstoned_ids(&self) -> Result<BTreeSet<u64>> {
        Ok(traits::tombstoned_ids(self.read()?.entries.values()))
    }

    async fn replace_all(
        &self,
        doc: &StateDocument,
        archived: &[HistoryEntry],
        entries: &[HistoryEntry],
    ) -> Result<()> {
        let mut inner = self.write()?;
        inner.state = Some(doc.clone());
        inner.archive = archived.iter().map(|e| (e.id, e.clone())).collect();
        inner.entries = entries.iter().map(|e| (e.id, e.clone())).collect();
        Ok(())
    }

    async fn plan_archive(&self, cutoff: i64) -> Result<ArchivePlan> {
        let inner = self.read()?;
        let mut plan = ArchivePlan::default();
        for entry in inner.entries.values().take_while(|e| e.ts < cutoff) {
            plan.count += 1;
            plan.through_id = Some(entry.id);
        }
        Ok(plan)
    }

    async fn archive_through(
        &self,
        through_id: u64,
        audit: &SealedEntry,
    ) -> Result<AppendResult> {
        let mut inner = self.write()?;

        // The tail is unaffected by moving a prefix, so checking it first
        // keeps a conflict free of side effects.
        if inner.tail().map(|e| &e.hmac) != audit.hmac_prev.as_ref() {
            return Ok(inner.append(audit));
        }

        let remaining = inner.entries.split_off(&through_id.saturating_add(1));
        let moved = std::mem::replace(&mut inner.entries, remaining);
        inner.archive.extend(moved);
        Ok(inner.append(audit))
    }

    async fn archived_entries(&self) -> Result<Vec<HistoryEntry>> {
        Ok(self.read()?.archive.values().cloned().collect())
    }

    async fn load_keys(&self) -> Result<Vec<HmacKey>> {
        Ok(self.read()?.keys.values().cloned().collect())
    }

    async fn install_key(&self, key: &HmacKey) -> Result<()> {
        self.write()?.activate_key(key);
        Ok(())
    }

    async fn rotate_key(&self, key: &HmacKey, audit: &SealedEntry) -> Result<AppendResult> {
        let mut inner = self.write()?;
        let result = inner.append(audit);
        if let AppendResult::Appended(_) = result {
            inner.activate_key(key);
        }
        Ok(result)
    }

    async fn insert_lease(&self, lease: &Lease) -> Result<()> {
        self.write()?
            .leases
            .insert(lease.lock_id.clone(), lease.clone());
        Ok(())
    }

    async fn remove_lease(&self, lock_id: &LockId) -> Result<bool> {
        Ok(self.write()?.leases.remove(lock_id).is_some())
    }

    async fn remove_expired_leases(&self, now: i64) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.leases.len();
        inner.leases.retain(|_, lease| !lease.is_expired(now));
        Ok(before - inner.leases.len())
    }

    async fn list_leases(&self, scope: Option<&str>, now: i64) -> Result<Vec<Lease>> {
        let inner = self.read()?;
        let mut leases: Vec<Lease> = inner
            .leases
            .values()
            .filter(|lease| !lease.is_expired(now))
            .filter(|lease| scope.map_or(true, |s| lease.scope == s))
            .cloned()
            .collect();
        leases.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.lock_id.cmp(&b.lock_id))
        });
        Ok(leases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use devstate_core::{verify_chain, Action, Anchor, EntryDraft, Keyring, SigningSecret};
    use serde_json::json;

    fn keyring() -> Keyring {
        Keyring::new(HmacKey::new("k1", "test-secret".parse().unwrap(), 0))
    }

    async fn append(store: &MemoryStore, ring: &Keyring, draft: EntryDraft, ts: i64) -> HistoryEntry {
        let prev = store.chain_tail().await.unwrap().map(|e| e.hmac);
        match store
            .append_entry(&draft.seal(ts, prev, ring.active()))
            .await
            .unwrap()
        {
            AppendResult::Appended(entry) => entry,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_append_and_verify() {
        let store = MemoryStore::new();
        let ring = keyring();
        for ts in 1..=4 {
            append(&store, &ring, EntryDraft::new("agent", "note"), ts).await;
        }

        let entries = store.tail_entries(None).await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(verify_chain(&entries, Anchor::Unanchored, &ring).ok);

        let last = store.tail_entries(Some(1)).await.unwrap();
        assert_eq!(last[0].id, 4);
    }

    #[tokio::test]
    async fn test_stale_link_is_a_conflict() {
        let store = MemoryStore::new();
        let ring = keyring();
        append(&store, &ring, EntryDraft::new("agent", "note"), 1).await;

        let stale = EntryDraft::new("agent", "late").seal(2, None, ring.active());
        let doc = StateDocument::from_value(json!({"x": 1}), 2).unwrap();
        let result = store.commit_state(&doc, &stale).await.unwrap();

        assert!(matches!(result, AppendResult::Conflict { .. }));
        assert!(store.load_state().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_archive_matches_sqlite_semantics() {
        let store = MemoryStore::new();
        let ring = keyring();
        for ts in [10, 20, 30, 15] {
            append(&store, &ring, EntryDraft::new("agent", "note"), ts).await;
        }

        let plan = store.plan_archive(25).await.unwrap();
        assert_eq!(plan.count, 2);
        assert_eq!(plan.through_id, Some(2));

        // A stale audit entry moves nothing.
        let stale = EntryDraft::new("agent", Action::ArchiveHistory).seal(50, None, ring.active());
        let result = store.archive_through(2, &stale).await.unwrap();
        assert!(matches!(result, AppendResult::Conflict { .. }));
        assert!(store.archived_entries().await.unwrap().is_empty());

        let tail = store.chain_tail().await.unwrap().map(|e| e.hmac);
        let audit = EntryDraft::new("agent", Action::ArchiveHistory).seal(50, tail, ring.active());
        let result = store.archive_through(2, &audit).await.unwrap();
        assert!(matches!(result, AppendResult::Appended(ref e) if e.id == 5));

        assert_eq!(store.archived_entries().await.unwrap().len(), 2);
        let window = store.tail_window(Some(3)).await.unwrap();
        assert_eq!(window.predecessor.unwrap().id, 2);
        assert_eq!(window.entries.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(store.chain_tail().await.unwrap().unwrap().id, 5);

        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.archived.len(), 2);
        assert_eq!(snapshot.entries.len(), 3);

        let copy = MemoryStore::new();
        let doc = StateDocument::from_value(json!({"x": 1}), 60).unwrap();
        copy.replace_all(&doc, &snapshot.archived, &snapshot.entries)
            .await
            .unwrap();
        assert_eq!(copy.archived_entries().await.unwrap(), snapshot.archived);
        assert_eq!(copy.chain_tail().await.unwrap().unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_search_hides_tombstoned() {
        let store = MemoryStore::new();
        let ring = keyring();
        append(&store, &ring, EntryDraft::new("alice", "note"), 1).await;
        append(&store, &ring, EntryDraft::new("bob", "note"), 2).await;
        append(&store, &ring, EntryDraft::tombstone("alice", 2), 3).await;

        let all = store.search_entries(&EntryFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        let visible = store
            .search_entries(&EntryFilter {
                hide_tombstoned: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(visible.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3, 1]);
    }

    #[tokio::test]
    async fn test_rotation_keeps_one_active_key() {
        let store = MemoryStore::new();
        let ring = keyring();
        store.install_key(ring.active()).await.unwrap();

        let next = HmacKey::new("k2", SigningSecret::generate(), 5);
        let audit = EntryDraft::new("admin", Action::RotateKey).seal(5, None, &next);
        store.rotate_key(&next, &audit).await.unwrap();

        let keys = store.load_keys().await.unwrap();
        assert_eq!(keys.iter().filter(|k| k.active).count(), 1);
        assert!(Keyring::from_keys(keys).is_ok());
    }

    #[tokio::test]
    async fn test_lease_expiry() {
        let store = MemoryStore::new();
        let lease = Lease::new("global", "agent", Duration::from_secs(1), 0);
        store.insert_lease(&lease).await.unwrap();

        assert_eq!(store.list_leases(Some("global"), 500).await.unwrap().len(), 1);
        assert!(store.list_leases(Some("other"), 500).await.unwrap().is_empty());
        assert_eq!(store.remove_expired_leases(1_000).await.unwrap(), 1);
        assert!(!store.remove_lease(&lease.lock_id).await.unwrap());
    }
}
