//! The Engine: unified API for DevState.
//!
//! The engine brings the state document, the hash-chained ledger, leases,
//! snapshots and key management together behind one interface.
//!
//! Every mutation that touches the ledger runs under a single writer hold
//! and commits through one store call, so a state write and the entry that
//! describes it land together or not at all. Reads never take the hold.

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use devstate_core::{
    into_object, now_millis, state_checksum, verify_chain, Action, Anchor, EntryDraft,
    HistoryEntry, HmacKey, KeyInfo, Keyring, Lease, LockId, SchemaValidator, SigningSecret,
    StateDocument, VerifyReport,
};
use devstate_store::{AppendResult, EntryFilter, Snapshot, SqliteStore, Store, TailWindow};

use crate::config::{EngineConfig, EngineOptions};
use crate::error::{EngineError, Result};
use crate::snapshot::{self, ExportBundle, ExportPaths, HistorySnapshot};

/// What `update` and `seed` report about the committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReceipt {
    pub checksum: String,
    pub entry_id: u64,
    pub hmac: String,
}

/// Outcome of provisioning the state document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SeedOutcome {
    Seeded(UpdateReceipt),
    /// The document already existed and was left unchanged.
    AlreadyPresent { checksum: String },
}

/// Outcome of a successful import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub checksum: String,
    /// Entries restored to the archive.
    pub archived: usize,
    /// Entries restored to the live ledger.
    pub entries: usize,
}

/// Outcome of an archive pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub cutoff: i64,
    pub archived: usize,
    /// Last archived id.
    pub through_id: Option<u64>,
    /// The `archive_history` entry, absent when nothing moved.
    pub entry_id: Option<u64>,
}

/// The main Engine struct.
///
/// Provides a unified API for:
/// - Reading, seeding and patching the state document
/// - Appending to, tombstoning and querying the ledger
/// - Verifying the chain
/// - Advisory leases
/// - Export and import
/// - Key rotation and archival
pub struct Engine<S: Store> {
    /// The storage backend.
    store: Arc<S>,
    /// Validates every candidate state document.
    validator: Arc<dyn SchemaValidator>,
    /// Signing keys. Swapped wholesale on rotation.
    keyring: RwLock<Arc<Keyring>>,
    /// Serializes every ledger-affecting mutation.
    writer: Mutex<()>,
    options: EngineOptions,
}

impl Engine<SqliteStore> {
    /// Open the SQLite-backed engine described by `config`.
    ///
    /// Fails with a configuration error before touching the database if
    /// the secret or schema is missing.
    pub async fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let validator = config.load_validator()?;
        let key = config.signing_key()?;
        let store = SqliteStore::open(&config.db_path)?;
        Self::open(store, validator, key, config.options.clone()).await
    }
}

impl<S: Store> Engine<S> {
    /// Create an engine over `store`.
    ///
    /// `key` is the configured signing key. An empty keyring is initialized
    /// with it; otherwise the persisted keyring must already hold `key.id`
    /// with the same secret.
    pub async fn open<V>(store: S, validator: V, key: HmacKey, options: EngineOptions) -> Result<Self>
    where
        V: SchemaValidator + 'static,
    {
        let persisted = store.load_keys().await?;

        let keyring = if persisted.is_empty() {
            store.install_key(&key).await?;
            info!(key_id = %key.id, fingerprint = %key.fingerprint(), "initialized keyring");
            Keyring::new(key)
        } else {
            let keyring = Keyring::from_keys(persisted)?;
            match keyring.get(&key.id) {
                None => {
                    return Err(EngineError::Configuration(format!(
                        "configured key {} is not in the keyring",
                        key.id
                    )))
                }
                Some(known) if known.secret != key.secret => {
                    return Err(EngineError::Configuration(format!(
                        "configured secret does not match stored key {}",
                        key.id
                    )))
                }
                Some(_) => {}
            }
            debug!(
                active = %keyring.active().id,
                keys = keyring.len(),
                "loaded keyring"
            );
            keyring
        };

        Ok(Self {
            store: Arc::new(store),
            validator: Arc::new(validator),
            keyring: RwLock::new(Arc::new(keyring)),
            writer: Mutex::new(()),
            options,
        })
    }

    /// Get the store reference.
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// The current keyring.
    fn keyring(&self) -> Arc<Keyring> {
        // The lock only guards an Arc swap, so a poisoned lock still holds
        // a complete keyring.
        let guard = self.keyring.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&*guard)
    }

    fn install_keyring(&self, keyring: Keyring) {
        let mut guard = self.keyring.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(keyring);
    }

    /// Acquire the writer hold within the configured timeout.
    async fn write_guard(&self) -> Result<MutexGuard<'_, ()>> {
        let timeout = self.options.update_timeout;
        tokio::time::timeout(timeout, self.writer.lock())
            .await
            .map_err(|_| {
                warn!(?timeout, "writer hold timed out");
                EngineError::Concurrency(format!(
                    "could not acquire the writer hold within {} ms",
                    timeout.as_millis()
                ))
            })
    }

    fn validate(&self, document: &Value) -> Result<()> {
        let verdict = self.validator.validate(document);
        if verdict.valid {
            Ok(())
        } else {
            debug!(errors = ?verdict.errors, "schema validation failed");
            Err(EngineError::Validation {
                errors: verdict.errors,
            })
        }
    }

    /// The hmac of the current chain tail.
    async fn tail_hmac(&self) -> Result<Option<String>> {
        Ok(self.store.chain_tail().await?.map(|e| e.hmac))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the current state document.
    pub async fn get(&self) -> Result<StateDocument> {
        self.store
            .load_state()
            .await?
            .ok_or_else(|| EngineError::NotFound("state document".into()))
    }

    /// Provision the state document.
    ///
    /// Seeding happens once: if the document already exists nothing is
    /// written and [`SeedOutcome::AlreadyPresent`] is returned.
    pub async fn seed(&self, json: Value, actor: &str) -> Result<SeedOutcome> {
        let json = into_object(json)?;
        let _guard = self.write_guard().await?;

        if let Some(existing) = self.store.load_state().await? {
            debug!(checksum = %existing.checksum, "state already seeded");
            return Ok(SeedOutcome::AlreadyPresent {
                checksum: existing.checksum,
            });
        }

        let now = now_millis();
        let doc = StateDocument::new(json, now);
        self.validate(&doc.to_value())?;

        let keyring = self.keyring();
        let sealed = EntryDraft::new(actor, Action::SeedState)
            .state_checksum(doc.checksum.clone())
            .seal(now, self.tail_hmac().await?, keyring.active());
        let entry = committed(self.store.commit_state(&doc, &sealed).await?)?;

        info!(actor, entry_id = entry.id, checksum = %doc.checksum, "seeded state");
        Ok(SeedOutcome::Seeded(UpdateReceipt {
            checksum: doc.checksum,
            entry_id: entry.id,
            hmac: entry.hmac,
        }))
    }

    /// Patch the state document by top-level key replacement.
    ///
    /// The merged document is validated, persisted and recorded as an
    /// `update_state` entry in one atomic unit. A validation failure
    /// discards the merge.
    pub async fn update(&self, patch: Value, actor: &str) -> Result<UpdateReceipt> {
        let patch = into_object(patch)?;
        let _guard = self.write_guard().await?;

        let current = self.get().await?;
        let now = now_millis();
        let candidate = current.patched(&patch, now);
        self.validate(&candidate.to_value())?;

        let mut patch_keys: Vec<&String> = patch.keys().collect();
        patch_keys.sort();

        let keyring = self.keyring();
        let sealed = EntryDraft::new(actor, Action::UpdateState)
            .state_checksum(candidate.checksum.clone())
            .meta("patch_keys", json!(patch_keys))
            .seal(now, self.tail_hmac().await?, keyring.active());
        let entry = committed(self.store.commit_state(&candidate, &sealed).await?)?;

        info!(
            actor,
            entry_id = entry.id,
            checksum = %candidate.checksum,
            keys = patch_keys.len(),
            "updated state"
        );
        Ok(UpdateReceipt {
            checksum: candidate.checksum,
            entry_id: entry.id,
            hmac: entry.hmac,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Ledger Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Append an entry to the ledger.
    pub async fn append(&self, draft: EntryDraft) -> Result<HistoryEntry> {
        if draft.actor.trim().is_empty() {
            return Err(EngineError::validation("actor must not be empty"));
        }
        if draft.action.as_str().trim().is_empty() {
            return Err(EngineError::validation("action must not be empty"));
        }

        let _guard = self.write_guard().await?;
        let entry = self.append_locked(draft).await?;
        info!(
            actor = %entry.actor,
            action = %entry.action,
            entry_id = entry.id,
            "appended entry"
        );
        Ok(entry)
    }

    /// Append while the caller holds the writer hold.
    async fn append_locked(&self, draft: EntryDraft) -> Result<HistoryEntry> {
        let keyring = self.keyring();
        let sealed = draft.seal(now_millis(), self.tail_hmac().await?, keyring.active());
        committed(self.store.append_entry(&sealed).await?)
    }

    /// Mark entry `id` as deleted by appending a `delete_history` entry.
    ///
    /// The target entry itself is never touched.
    pub async fn tombstone(&self, id: u64, actor: &str) -> Result<HistoryEntry> {
        let _guard = self.write_guard().await?;

        if self.store.get_entry(id).await?.is_none() {
            return Err(EngineError::NotFound(format!("history entry {}", id)));
        }

        let entry = self.append_locked(EntryDraft::tombstone(actor, id)).await?;
        info!(actor, target_id = id, entry_id = entry.id, "tombstoned entry");
        Ok(entry)
    }

    /// Get a live entry by id.
    pub async fn get_entry(&self, id: u64) -> Result<HistoryEntry> {
        self.store
            .get_entry(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("history entry {}", id)))
    }

    /// Search live entries, newest first.
    pub async fn search(&self, filter: &EntryFilter) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.search_entries(filter).await?)
    }

    /// Ids that tombstones mark as deleted.
    pub async fn tombstoned_ids(&self) -> Result<Vec<u64>> {
        Ok(self.store.tombstoned_ids().await?.into_iter().collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Verification
    // ─────────────────────────────────────────────────────────────────────────

    /// Verify the live ledger, or its last `limit` entries when `limit > 0`.
    ///
    /// The first scanned entry is checked against its predecessor, live or
    /// archived. Entries appended after the scan starts are not examined.
    pub async fn verify(&self, limit: usize) -> Result<VerifyReport> {
        let window = (limit > 0).then_some(limit);
        let TailWindow {
            predecessor,
            entries,
        } = self.store.tail_window(window).await?;

        let report = verify_chain(&entries, Anchor::after(predecessor.as_ref()), &self.keyring());
        log_report("ledger", &report);
        Ok(report)
    }

    /// Verify the archived segment and its link to the live ledger.
    ///
    /// The report counts the first live entry when there is one.
    pub async fn verify_archive(&self) -> Result<VerifyReport> {
        let Snapshot {
            archived, entries, ..
        } = self.store.snapshot().await?;
        if archived.is_empty() {
            return Ok(verify_chain(&archived, Anchor::Unanchored, &self.keyring()));
        }

        let report = verify_chain(
            archived.iter().chain(entries.first()),
            Anchor::Unanchored,
            &self.keyring(),
        );
        log_report("archive", &report);
        Ok(report)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lease Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Take an advisory lease on `scope` for `ttl`.
    ///
    /// Leases never block engine operations, and several may share a scope.
    /// A zero `ttl` yields a lease that is already expired.
    pub async fn acquire(&self, scope: &str, ttl: Duration, actor: &str) -> Result<Lease> {
        if scope.trim().is_empty() {
            return Err(EngineError::validation("scope must not be empty"));
        }

        let lease = Lease::new(scope, actor, ttl, now_millis());
        self.store.insert_lease(&lease).await?;
        info!(lock_id = %lease.lock_id, scope, actor, expires_at = lease.expires_at, "acquired lease");
        Ok(lease)
    }

    /// Release a lease. Releasing an unknown or already-released id succeeds.
    pub async fn release(&self, lock_id: &LockId) -> Result<()> {
        let removed = self.store.remove_lease(lock_id).await?;
        debug!(%lock_id, removed, "released lease");
        Ok(())
    }

    /// Delete every expired lease. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let removed = self.store.remove_expired_leases(now_millis()).await?;
        if removed > 0 {
            info!(removed, "removed expired leases");
        }
        Ok(removed)
    }

    /// Unexpired leases, optionally for one scope.
    pub async fn locks(&self, scope: Option<&str>) -> Result<Vec<Lease>> {
        Ok(self.store.list_leases(scope, now_millis()).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Import / Export
    // ─────────────────────────────────────────────────────────────────────────

    /// Snapshot the state document, the archive and the live ledger.
    pub async fn export(&self) -> Result<ExportBundle> {
        let snapshot = self.store.snapshot().await?;
        let state = snapshot
            .state
            .ok_or_else(|| EngineError::NotFound("state document".into()))?;
        Ok(ExportBundle {
            state,
            history: HistorySnapshot {
                archived: snapshot.archived,
                entries: snapshot.entries,
            },
        })
    }

    /// Replace the state document, the archive and the live ledger with a
    /// snapshot.
    ///
    /// The snapshot is accepted only if
    /// - its document passes the schema and its checksum matches its content,
    /// - its archived and live entries form one chain from the genesis entry
    ///   that verifies under the keyring,
    /// - the newest entry recording a state checksum records this document.
    ///
    /// Otherwise nothing changes.
    pub async fn import(&self, bundle: ExportBundle) -> Result<ImportReport> {
        let ExportBundle { state, history } = bundle;
        let HistorySnapshot {
            mut archived,
            mut entries,
        } = history;
        let _guard = self.write_guard().await?;

        self.validate(&state.to_value())?;

        let recomputed = state_checksum(&state.to_value());
        if recomputed != state.checksum {
            warn!(recorded = %state.checksum, %recomputed, "import rejected: stale checksum");
            return Err(EngineError::ChainIntegrity {
                position: None,
                reason: format!(
                    "state checksum {} does not match content ({})",
                    state.checksum, recomputed
                ),
            });
        }

        let keyring = self.keyring();
        let report = verify_chain(archived.iter().chain(&entries), Anchor::Genesis, &keyring);
        if let Some(failure) = report.failure {
            warn!(position = failure.position, reason = %failure.reason, "import rejected");
            return Err(EngineError::chain_break(failure));
        }

        let recorded = archived
            .iter()
            .chain(&entries)
            .rev()
            .find_map(|e| e.state_checksum.as_deref());
        if recorded != Some(state.checksum.as_str()) {
            warn!(checksum = %state.checksum, ?recorded, "import rejected: state not in ledger");
            return Err(EngineError::ChainIntegrity {
                position: None,
                reason: format!(
                    "state checksum {} is not the latest one recorded in the ledger",
                    state.checksum
                ),
            });
        }

        let active = &keyring.active().id;
        for entry in archived.iter_mut().chain(entries.iter_mut()) {
            entry.key_id.get_or_insert_with(|| active.clone());
        }

        self.store.replace_all(&state, &archived, &entries).await?;
        info!(
            archived = archived.len(),
            entries = entries.len(),
            checksum = %state.checksum,
            "imported snapshot"
        );
        Ok(ImportReport {
            checksum: state.checksum,
            archived: archived.len(),
            entries: entries.len(),
        })
    }

    /// Export to `state.json` and `history.json` under the export root.
    pub async fn export_files(&self) -> Result<ExportPaths> {
        let bundle = self.export().await?;
        let root = self.options.export_root.clone();
        let paths = blocking(move || snapshot::write_bundle(&root, &bundle)).await?;
        info!(state = %paths.state.display(), history = %paths.history.display(), "exported snapshot");
        Ok(paths)
    }

    /// Import the artifacts under the export root.
    pub async fn import_files(&self) -> Result<ImportReport> {
        self.import_from(&self.options.export_root).await
    }

    /// Import the artifacts under `root`.
    pub async fn import_from(&self, root: &Path) -> Result<ImportReport> {
        let root = root.to_path_buf();
        let bundle = blocking(move || snapshot::read_bundle(&root)).await?;
        self.import(bundle).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Keys and Archival
    // ─────────────────────────────────────────────────────────────────────────

    /// Make `secret` the active signing key under `id`.
    ///
    /// Earlier entries keep their recorded hmac and key id. The rotation is
    /// recorded as a `rotate_key` entry signed by the new key. Reusing an
    /// existing id with a different secret is rejected.
    pub async fn rotate_key(&self, id: &str, secret: SigningSecret, actor: &str) -> Result<KeyInfo> {
        if id.trim().is_empty() {
            return Err(EngineError::validation("key id must not be empty"));
        }

        let _guard = self.write_guard().await?;
        let keyring = self.keyring();

        let now = now_millis();
        let created_at = match keyring.get(id) {
            Some(existing) if existing.secret != secret => {
                return Err(EngineError::validation(format!(
                    "key id {} is already bound to a different secret",
                    id
                )))
            }
            Some(existing) => existing.created_at,
            None => now,
        };

        let rotated = keyring.rotated(HmacKey::new(id, secret, created_at));
        let key = rotated.active();
        let sealed = EntryDraft::new(actor, Action::RotateKey)
            .meta("key_id", json!(key.id))
            .meta("fingerprint", json!(key.fingerprint()))
            .seal(now, self.tail_hmac().await?, key);
        let entry = committed(self.store.rotate_key(key, &sealed).await?)?;

        let info = key.info();
        self.install_keyring(rotated);
        info!(
            actor,
            key_id = %info.id,
            fingerprint = %info.fingerprint,
            entry_id = entry.id,
            "rotated signing key"
        );
        Ok(info)
    }

    /// Public descriptions of every key.
    pub fn keys(&self) -> Vec<KeyInfo> {
        self.keyring().keys().map(HmacKey::info).collect()
    }

    /// Move the longest live prefix with `ts < cutoff` to cold storage.
    ///
    /// Archived entries keep their ids and chain fields. The first remaining
    /// live entry still links into the archive. An `archive_history` entry
    /// records the move.
    pub async fn archive(&self, cutoff: i64, actor: &str) -> Result<ArchiveReport> {
        let _guard = self.write_guard().await?;

        let plan = self.store.plan_archive(cutoff).await?;
        let Some(through_id) = plan.through_id else {
            debug!(cutoff, "nothing to archive");
            return Ok(ArchiveReport {
                cutoff,
                archived: 0,
                through_id: None,
                entry_id: None,
            });
        };

        let keyring = self.keyring();
        let sealed = EntryDraft::new(actor, Action::ArchiveHistory)
            .meta("cutoff", json!(cutoff))
            .meta("archived", json!(plan.count))
            .meta("through_id", json!(through_id))
            .seal(now_millis(), self.tail_hmac().await?, keyring.active());
        let entry = committed(self.store.archive_through(through_id, &sealed).await?)?;

        info!(cutoff, archived = plan.count, through_id, entry_id = entry.id, "archived history");
        Ok(ArchiveReport {
            cutoff,
            archived: plan.count,
            through_id: Some(through_id),
            entry_id: Some(entry.id),
        })
    }
}

/// The committed entry, or a concurrency error if the tail moved.
fn committed(result: AppendResult) -> Result<HistoryEntry> {
    match result {
        AppendResult::Appended(entry) => Ok(entry),
        AppendResult::Conflict { tail } => {
            warn!(?tail, "chain tail moved under the writer");
            Err(EngineError::Concurrency(
                "chain tail moved before the entry was committed".into(),
            ))
        }
    }
}

fn log_report(segment: &str, report: &VerifyReport) {
    match &report.failure {
        Some(failure) => warn!(
            segment,
            position = failure.position,
            reason = %failure.reason,
            checked = report.checked,
            "chain verification failed"
        ),
        None => debug!(segment, checked = report.checked, "chain verified"),
    }
}

/// Run blocking file I/O off the async runtime.
async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        EngineError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("blocking task failed: {}", e),
        ))
    })?
}
