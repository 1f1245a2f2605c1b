//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for DevState. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking. Every write
//! that touches the ledger runs in an IMMEDIATE transaction, so the tail
//! read and the insert of the next entry cannot interleave with another
//! writer, even one in a different process.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, ToSql, TransactionBehavior,
};
use tracing::{debug, warn};

use devstate_core::{
    now_millis, Action, HistoryEntry, HmacKey, Lease, LockId, SealedEntry, SigningSecret,
    StateDocument,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{self, AppendResult, ArchivePlan, EntryFilter, Snapshot, Store, TailWindow};

const ENTRY_COLUMNS: &str =
    "id, ts, actor, action, cp_from, cp_to, state_checksum, hmac_prev, hmac, key_id, metadata";

/// How long SQLite waits on a lock held by another connection.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a blocking operation on the connection.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Worker(format!("spawn_blocking failed: {}", e)))?;

        if let Err(err) = &result {
            if err.is_busy() {
                warn!(error = %err, timeout = ?BUSY_TIMEOUT, "database stayed locked");
            }
        }
        result
    }
}

// ─── Row mapping ───────────────────────────────────────────────────────────

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    let id: i64 = row.get("id")?;
    let action: String = row.get("action")?;
    let metadata: String = row.get("metadata")?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    Ok(HistoryEntry {
        id: id as u64,
        ts: row.get("ts")?,
        actor: row.get("actor")?,
        action: Action::from(action),
        cp_from: row.get("cp_from")?,
        cp_to: row.get("cp_to")?,
        state_checksum: row.get("state_checksum")?,
        hmac_prev: row.get("hmac_prev")?,
        hmac: row.get("hmac")?,
        key_id: row.get("key_id")?,
        metadata,
    })
}

fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| StoreError::InvalidData(format!("entry id {} out of range", id)))
}

/// Insert `entry` into the live ledger, or into the archive when
/// `archived_at` is set.
fn insert_entry(conn: &Connection, entry: &HistoryEntry, archived_at: Option<i64>) -> Result<()> {
    let id = sql_id(entry.id)?;
    let action = entry.action.as_str();
    let metadata = serde_json::to_string(&entry.metadata)?;
    let mut values: Vec<&dyn ToSql> = vec![
        &id,
        &entry.ts,
        &entry.actor,
        &action,
        &entry.cp_from,
        &entry.cp_to,
        &entry.state_checksum,
        &entry.hmac_prev,
        &entry.hmac,
        &entry.key_id,
        &metadata,
    ];

    let sql = match &archived_at {
        None => format!(
            "INSERT INTO history_entries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            ENTRY_COLUMNS
        ),
        Some(at) => {
            values.push(at);
            format!(
                "INSERT INTO history_archive ({}, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                ENTRY_COLUMNS
            )
        }
    };
    conn.execute(&sql, values.as_slice())?;
    Ok(())
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<HistoryEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let entries = stmt
        .query_map(params, row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(entries)
}

/// The last `limit` live entries (all when `None`), ascending.
fn live_tail(conn: &Connection, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
    match limit {
        None => query_entries(
            conn,
            &format!("SELECT {} FROM history_entries ORDER BY id", ENTRY_COLUMNS),
            [],
        ),
        Some(limit) => query_entries(
            conn,
            &format!(
                "SELECT * FROM (
                    SELECT {} FROM history_entries ORDER BY id DESC LIMIT ?1
                 ) ORDER BY id",
                ENTRY_COLUMNS
            ),
            params![i64::try_from(limit).unwrap_or(i64::MAX)],
        ),
    }
}

/// The entry with the largest id below `before`, live or archived.
fn latest_entry(conn: &Connection, before: i64) -> Result<Option<HistoryEntry>> {
    let sql = format!(
        "SELECT {cols} FROM history_entries WHERE id < ?1
         UNION ALL
         SELECT {cols} FROM history_archive WHERE id < ?1
         ORDER BY id DESC LIMIT 1",
        cols = ENTRY_COLUMNS
    );
    conn.query_row(&sql, params![before], row_to_entry)
        .optional()
        .map_err(StoreError::from)
}

fn load_state(conn: &Connection) -> Result<Option<StateDocument>> {
    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT json, checksum, updated_at FROM state_current WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let Some((json, checksum, updated_at)) = row else {
        return Ok(None);
    };

    Ok(Some(StateDocument {
        json: serde_json::from_str(&json)?,
        checksum,
        updated_at,
    }))
}

fn put_state(conn: &Connection, doc: &StateDocument) -> Result<()> {
    conn.execute(
        "INSERT INTO state_current (id, json, checksum, updated_at) VALUES (1, ?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET
            json = excluded.json,
            checksum = excluded.checksum,
            updated_at = excluded.updated_at",
        params![serde_json::to_string(&doc.json)?, doc.checksum, doc.updated_at],
    )?;
    Ok(())
}

/// Append `entry` if it links to the current tail.
fn append_sealed(conn: &Connection, entry: &SealedEntry) -> Result<AppendResult> {
    let tail = latest_entry(conn, i64::MAX)?;
    let tail_hmac = tail.as_ref().map(|e| e.hmac.clone());
    if tail_hmac != entry.hmac_prev {
        debug!(tail = ?tail_hmac, link = ?entry.hmac_prev, "append rejected: stale link");
        return Ok(AppendResult::Conflict { tail: tail_hmac });
    }

    let id = tail.map(|e| e.id + 1).unwrap_or(1);
    let committed = entry.clone().into_entry(id);
    insert_entry(conn, &committed, None)?;
    Ok(AppendResult::Appended(committed))
}

fn put_active_key(conn: &Connection, key: &HmacKey) -> Result<()> {
    conn.execute("UPDATE hmac_keys SET active = 0 WHERE active = 1", [])?;
    conn.execute(
        "INSERT INTO hmac_keys (id, secret, active, created_at) VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(id) DO UPDATE SET secret = excluded.secret, active = 1",
        params![key.id, key.secret.to_hex(), key.created_at],
    )?;
    Ok(())
}

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    Ok(Lease {
        lock_id: LockId::from(row.get::<_, String>("lock_id")?),
        scope: row.get("scope")?,
        actor: row.get("actor")?,
        expires_at: row.get("expires_at")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_state(&self) -> Result<Option<StateDocument>> {
        self.run(|conn| load_state(conn)).await
    }

    async fn commit_state(
        &self,
        doc: &StateDocument,
        entry: &SealedEntry,
    ) -> Result<AppendResult> {
        let doc = doc.clone();
        let entry = entry.clone();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = append_sealed(&tx, &entry)?;
            if let AppendResult::Appended(_) = result {
                put_state(&tx, &doc)?;
                tx.commit()?;
            }
            Ok(result)
        })
        .await
    }

    async fn append_entry(&self, entry: &SealedEntry) -> Result<AppendResult> {
        let entry = entry.clone();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = append_sealed(&tx, &entry)?;
            if let AppendResult::Appended(_) = result {
                tx.commit()?;
            }
            Ok(result)
        })
        .await
    }

    async fn chain_tail(&self) -> Result<Option<HistoryEntry>> {
        self.run(|conn| latest_entry(conn, i64::MAX)).await
    }

    async fn get_entry(&self, id: u64) -> Result<Option<HistoryEntry>> {
        self.run(move |conn| {
            let Ok(id) = i64::try_from(id) else {
                return Ok(None);
            };
            conn.query_row(
                &format!("SELECT {} FROM history_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                row_to_entry,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn tail_entries(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        self.run(move |conn| live_tail(conn, limit)).await
    }

    async fn tail_window(&self, limit: Option<usize>) -> Result<TailWindow> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let entries = live_tail(&tx, limit)?;
            let predecessor = match entries.first() {
                Some(first) => latest_entry(&tx, sql_id(first.id)?)?,
                None => None,
            };
            tx.commit()?;
            Ok(TailWindow {
                predecessor,
                entries,
            })
        })
        .await
    }

    async fn snapshot(&self) -> Result<Snapshot> {
        self.run(|conn| {
            let tx = conn.transaction()?;
            let state = load_state(&tx)?;
            let archived = query_entries(
                &tx,
                &format!("SELECT {} FROM history_archive ORDER BY id", ENTRY_COLUMNS),
                [],
            )?;
            let entries = live_tail(&tx, None)?;
            tx.commit()?;
            Ok(Snapshot {
                state,
                archived,
                entries,
            })
        })
        .await
    }

    async fn search_entries(&self, filter: &EntryFilter) -> Result<Vec<HistoryEntry>> {
        let filter = filter.clone();

        self.run(move |conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<rusqlite::types::Value> = Vec::new();

            if let Some(actor) = &filter.actor {
                values.push(actor.clone().into());
                clauses.push(format!("actor = ?{}", values.len()));
            }
            if let Some(action) = &filter.action {
                values.push(action.as_str().to_string().into());
                clauses.push(format!("action = ?{}", values.len()));
            }
            if let Some(since) = filter.since {
                values.push(since.into());
                clauses.push(format!("ts >= ?{}", values.len()));
            }
            if let Some(until) = filter.until {
                values.push(until.into());
                clauses.push(format!("ts <= ?{}", values.len()));
            }

            let mut sql = format!("SELECT {} FROM history_entries", ENTRY_COLUMNS);
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY id DESC");

            let hidden = if filter.hide_tombstoned {
                tombstoned_ids(conn)?
            } else {
                BTreeSet::new()
            };

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_entry)?;

            let mut results = Vec::new();
            for row in rows {
                if results.len() >= filter.limit {
                    break;
                }
                let entry = row?;
                if !hidden.contains(&entry.id) {
                    results.push(entry);
                }
            }
            Ok(results)
        })
        .await
    }

    async fn tombstoned_ids(&self) -> Result<BTreeSet<u64>> {
        self.run(|conn| tombstoned_ids(conn)).await
    }

    async fn replace_all(
        &self,
        doc: &StateDocument,
        archived: &[HistoryEntry],
        entries: &[HistoryEntry],
    ) -> Result<()> {
        let doc = doc.clone();
        let archived = archived.to_vec();
        let entries = entries.to_vec();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute("DELETE FROM history_entries", [])?;
            tx.execute("DELETE FROM history_archive", [])?;
            put_state(&tx, &doc)?;
            let archived_at = now_millis();
            for entry in &archived {
                insert_entry(&tx, entry, Some(archived_at))?;
            }
            for entry in &entries {
                insert_entry(&tx, entry, None)?;
            }
            tx.commit()?;
            debug!(
                archived = archived.len(),
                entries = entries.len(),
                "replaced state and ledger"
            );
            Ok(())
        })
        .await
    }

    async fn plan_archive(&self, cutoff: i64) -> Result<ArchivePlan> {
        self.run(move |conn| {
            let boundary: Option<i64> = conn.query_row(
                "SELECT MIN(id) FROM history_entries WHERE ts >= ?1",
                params![cutoff],
                |row| row.get(0),
            )?;
            let (count, through): (i64, Option<i64>) = conn.query_row(
                "SELECT COUNT(*), MAX(id) FROM history_entries WHERE id < ?1",
                params![boundary.unwrap_or(i64::MAX)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(ArchivePlan {
                count: count as usize,
                through_id: through.map(|id| id as u64),
            })
        })
        .await
    }

    async fn archive_through(
        &self,
        through_id: u64,
        audit: &SealedEntry,
    ) -> Result<AppendResult> {
        let audit = audit.clone();

        self.run(move |conn| {
            let through = sql_id(through_id)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                &format!(
                    "INSERT INTO history_archive ({cols}, archived_at)
                     SELECT {cols}, ?2 FROM history_entries WHERE id <= ?1",
                    cols = ENTRY_COLUMNS
                ),
                params![through, now_millis()],
            )?;
            tx.execute("DELETE FROM history_entries WHERE id <= ?1", params![through])?;

            let result = append_sealed(&tx, &audit)?;
            if let AppendResult::Appended(_) = result {
                tx.commit()?;
            }
            Ok(result)
        })
        .await
    }

    async fn archived_entries(&self) -> Result<Vec<HistoryEntry>> {
        self.run(|conn| {
            query_entries(
                conn,
                &format!("SELECT {} FROM history_archive ORDER BY id", ENTRY_COLUMNS),
                [],
            )
        })
        .await
    }

    async fn load_keys(&self) -> Result<Vec<HmacKey>> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, secret, active, created_at FROM hmac_keys ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter()
                .map(|(id, secret, active, created_at)| {
                    let secret = SigningSecret::from_hex(&secret).map_err(|e| {
                        StoreError::InvalidData(format!("secret of key {}: {}", id, e))
                    })?;
                    Ok(HmacKey {
                        id,
                        secret,
                        active,
                        created_at,
                    })
                })
                .collect()
        })
        .await
    }

    async fn install_key(&self, key: &HmacKey) -> Result<()> {
        let key = key.clone();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            put_active_key(&tx, &key)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn rotate_key(&self, key: &HmacKey, audit: &SealedEntry) -> Result<AppendResult> {
        let key = key.clone();
        let audit = audit.clone();

        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let result = append_sealed(&tx, &audit)?;
            if let AppendResult::Appended(_) = result {
                put_active_key(&tx, &key)?;
                tx.commit()?;
            }
            Ok(result)
        })
        .await
    }

    async fn insert_lease(&self, lease: &Lease) -> Result<()> {
        let lease = lease.clone();

        self.run(move |conn| {
            conn.execute(
                "INSERT INTO leases (lock_id, scope, actor, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![lease.lock_id.as_str(), lease.scope, lease.actor, lease.expires_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove_lease(&self, lock_id: &LockId) -> Result<bool> {
        let lock_id = lock_id.clone();

        self.run(move |conn| {
            let removed =
                conn.execute("DELETE FROM leases WHERE lock_id = ?1", params![lock_id.as_str()])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn remove_expired_leases(&self, now: i64) -> Result<usize> {
        self.run(move |conn| {
            let removed = conn.execute("DELETE FROM leases WHERE expires_at <= ?1", params![now])?;
            Ok(removed)
        })
        .await
    }

    async fn list_leases(&self, scope: Option<&str>, now: i64) -> Result<Vec<Lease>> {
        let scope = scope.map(str::to_string);

        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT lock_id, scope, actor, expires_at FROM leases
                 WHERE expires_at > ?1 AND (?2 IS NULL OR scope = ?2)
                 ORDER BY expires_at, lock_id",
            )?;
            let leases = stmt
                .query_map(params![now, scope], row_to_lease)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(leases)
        })
        .await
    }
}

fn tombstoned_ids(conn: &Connection) -> Result<BTreeSet<u64>> {
    let tombstones = query_entries(
        conn,
        &format!("SELECT {} FROM history_entries WHERE action = ?1", ENTRY_COLUMNS),
        params![Action::DeleteHistory.as_str()],
    )?;
    Ok(traits::tombstoned_ids(&tombstones))
}
