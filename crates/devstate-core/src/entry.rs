//! History entries: the links of the audit ledger.
//!
//! An entry goes through three shapes:
//!
//! 1. [`EntryDraft`] - what the caller supplies (actor, action, metadata...)
//! 2. [`SealedEntry`] - the draft plus timestamp, chain link and hmac
//! 3. [`HistoryEntry`] - the sealed entry plus the id the store assigned
//!
//! The hmac covers the canonical JSON of
//! `{action, actor, cp_from, cp_to, hmac_prev, metadata, state_checksum, ts}`.
//! `hmac_prev` is part of the signed message, so a link cannot be rewritten
//! without the secret.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::canonical::canonical_bytes;
use crate::crypto::HmacKey;

/// Metadata key naming the entry a `delete_history` entry tombstones.
pub const TOMBSTONE_TARGET: &str = "target_id";

/// What a ledger entry records.
///
/// Well-known actions get their own variant; anything else supplied to
/// `append` is carried verbatim as [`Action::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    /// The state document was provisioned.
    SeedState,
    /// The state document was patched.
    UpdateState,
    /// Tombstone: a later entry marking `metadata.target_id` as deleted.
    DeleteHistory,
    /// A new signing key became active.
    RotateKey,
    /// A prefix of the ledger moved to cold storage.
    ArchiveHistory,
    /// Caller-defined action.
    Custom(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::SeedState => "seed_state",
            Action::UpdateState => "update_state",
            Action::DeleteHistory => "delete_history",
            Action::RotateKey => "rotate_key",
            Action::ArchiveHistory => "archive_history",
            Action::Custom(s) => s,
        }
    }
}

impl From<&str> for Action {
    fn from(s: &str) -> Self {
        match s {
            "seed_state" => Action::SeedState,
            "update_state" => Action::UpdateState,
            "delete_history" => Action::DeleteHistory,
            "rotate_key" => Action::RotateKey,
            "archive_history" => Action::ArchiveHistory,
            other => Action::Custom(other.to_string()),
        }
    }
}

impl From<String> for Action {
    fn from(s: String) -> Self {
        match Action::from(s.as_str()) {
            Action::Custom(_) => Action::Custom(s),
            known => known,
        }
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Custom(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied fields of a new ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDraft {
    pub actor: String,
    pub action: Action,
    #[serde(default)]
    pub cp_from: Option<String>,
    #[serde(default)]
    pub cp_to: Option<String>,
    #[serde(default)]
    pub state_checksum: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Map<String, Value>,
}

impl EntryDraft {
    pub fn new(actor: impl Into<String>, action: impl Into<Action>) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            cp_from: None,
            cp_to: None,
            state_checksum: None,
            metadata: Map::new(),
        }
    }

    /// A tombstone for entry `target_id`.
    pub fn tombstone(actor: impl Into<String>, target_id: u64) -> Self {
        Self::new(actor, Action::DeleteHistory).meta(TOMBSTONE_TARGET, json!(target_id))
    }

    /// Set the checkpoint references.
    pub fn checkpoints(mut self, cp_from: Option<String>, cp_to: Option<String>) -> Self {
        self.cp_from = cp_from;
        self.cp_to = cp_to;
        self
    }

    /// Set the state checksum this entry describes.
    pub fn state_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.state_checksum = Some(checksum.into());
        self
    }

    /// Replace the metadata mapping.
    pub fn metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Add one metadata key.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Seal the draft into the chain after `hmac_prev`, signing with `key`.
    pub fn seal(self, ts: i64, hmac_prev: Option<String>, key: &HmacKey) -> SealedEntry {
        let message = signed_message(&SignedFields {
            ts,
            actor: &self.actor,
            action: &self.action,
            cp_from: self.cp_from.as_deref(),
            cp_to: self.cp_to.as_deref(),
            state_checksum: self.state_checksum.as_deref(),
            metadata: &self.metadata,
            hmac_prev: hmac_prev.as_deref(),
        });
        let hmac = key.sign(&message);

        SealedEntry {
            ts,
            actor: self.actor,
            action: self.action,
            cp_from: self.cp_from,
            cp_to: self.cp_to,
            state_checksum: self.state_checksum,
            metadata: self.metadata,
            hmac_prev,
            hmac,
            key_id: key.id.clone(),
        }
    }
}

/// An entry sealed into the chain, waiting for the store to assign its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedEntry {
    pub ts: i64,
    pub actor: String,
    pub action: Action,
    pub cp_from: Option<String>,
    pub cp_to: Option<String>,
    pub state_checksum: Option<String>,
    pub metadata: Map<String, Value>,
    pub hmac_prev: Option<String>,
    pub hmac: String,
    pub key_id: String,
}

impl SealedEntry {
    pub fn into_entry(self, id: u64) -> HistoryEntry {
        HistoryEntry {
            id,
            ts: self.ts,
            actor: self.actor,
            action: self.action,
            cp_from: self.cp_from,
            cp_to: self.cp_to,
            state_checksum: self.state_checksum,
            hmac_prev: self.hmac_prev,
            hmac: self.hmac,
            key_id: Some(self.key_id),
            metadata: self.metadata,
        }
    }
}

/// One committed link of the ledger.
///
/// Entries are immutable once committed. `key_id` names the key that sealed
/// the entry; it is absent only on entries imported from snapshots that
/// predate key tagging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub ts: i64,
    pub actor: String,
    pub action: Action,
    #[serde(default)]
    pub cp_from: Option<String>,
    #[serde(default)]
    pub cp_to: Option<String>,
    #[serde(default)]
    pub state_checksum: Option<String>,
    #[serde(default)]
    pub hmac_prev: Option<String>,
    pub hmac: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub metadata: Map<String, Value>,
}

impl HistoryEntry {
    /// The canonical message this entry's hmac covers.
    pub fn signed_message(&self) -> Vec<u8> {
        signed_message(&SignedFields {
            ts: self.ts,
            actor: &self.actor,
            action: &self.action,
            cp_from: self.cp_from.as_deref(),
            cp_to: self.cp_to.as_deref(),
            state_checksum: self.state_checksum.as_deref(),
            metadata: &self.metadata,
            hmac_prev: self.hmac_prev.as_deref(),
        })
    }

    /// Recompute the hmac from the recorded fields under `key`.
    pub fn recompute_hmac(&self, key: &HmacKey) -> String {
        key.sign(&self.signed_message())
    }

    /// Whether the recorded hmac matches the recorded fields under `key`.
    pub fn digest_matches(&self, key: &HmacKey) -> bool {
        key.verify(&self.signed_message(), &self.hmac)
    }

    /// The id this entry tombstones, if it is a tombstone.
    pub fn tombstone_target(&self) -> Option<u64> {
        if self.action != Action::DeleteHistory {
            return None;
        }
        self.metadata.get(TOMBSTONE_TARGET).and_then(Value::as_u64)
    }
}

/// `metadata: null` reads as an empty mapping.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

struct SignedFields<'a> {
    ts: i64,
    actor: &'a str,
    action: &'a Action,
    cp_from: Option<&'a str>,
    cp_to: Option<&'a str>,
    state_checksum: Option<&'a str>,
    metadata: &'a Map<String, Value>,
    hmac_prev: Option<&'a str>,
}

fn signed_message(fields: &SignedFields<'_>) -> Vec<u8> {
    let value = json!({
        "action": fields.action.as_str(),
        "actor": fields.actor,
        "cp_from": fields.cp_from,
        "cp_to": fields.cp_to,
        "hmac_prev": fields.hmac_prev,
        "metadata": fields.metadata,
        "state_checksum": fields.state_checksum,
        "ts": fields.ts,
    });
    canonical_bytes(&value)
}
