//! Chain verification: recompute and check the ledger's hash chain.
//!
//! Verification is a prefix scan. It walks entries in ascending id order and
//! stops at the first break, reporting where and why. A break is a normal
//! result, not an error.

use serde::{Deserialize, Serialize};

use crate::crypto::Keyring;
use crate::entry::HistoryEntry;

/// Why the chain broke at an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakReason {
    /// `hmac_prev` does not equal the previous entry's `hmac`, or ids are
    /// out of order.
    LinkMismatch,
    /// The recomputed keyed hash does not equal the stored `hmac`, or the
    /// entry's key is unknown.
    DigestMismatch,
}

impl BreakReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakReason::LinkMismatch => "LINK_MISMATCH",
            BreakReason::DigestMismatch => "DIGEST_MISMATCH",
        }
    }
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The first break found by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainBreak {
    /// Id of the entry where the chain broke.
    pub position: u64,
    pub reason: BreakReason,
}

/// Outcome of a verification scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    /// Entries that passed before the scan stopped.
    pub checked: usize,
    #[serde(flatten)]
    pub failure: Option<ChainBreak>,
}

impl VerifyReport {
    fn intact(checked: usize) -> Self {
        Self {
            ok: true,
            checked,
            failure: None,
        }
    }

    fn broken(checked: usize, position: u64, reason: BreakReason) -> Self {
        Self {
            ok: false,
            checked,
            failure: Some(ChainBreak { position, reason }),
        }
    }
}

/// What the first scanned entry must link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    /// The hmac of the entry immediately preceding the scan.
    Hmac(String),
    /// No predecessor is available. The first entry is accepted as linked
    /// to data outside the scan, unless its id is 1, in which case it must
    /// be the genesis entry with no `hmac_prev`.
    Unanchored,
    /// The scan must begin with the genesis entry: id 1, no `hmac_prev`.
    Genesis,
}

impl Anchor {
    /// Anchor on an optional predecessor.
    pub fn after(previous: Option<&HistoryEntry>) -> Self {
        match previous {
            Some(entry) => Anchor::Hmac(entry.hmac.clone()),
            None => Anchor::Unanchored,
        }
    }
}

/// Verify a run of entries in ascending id order.
///
/// For each entry this checks that
/// - ids strictly increase,
/// - `hmac_prev` equals the previous entry's `hmac` (the anchor for the
///   first entry),
/// - the keyed hash recomputed under the entry's own key equals `hmac`.
///
/// Entries without a `key_id` are checked against the active key.
pub fn verify_chain<'a, I>(entries: I, anchor: Anchor, keyring: &Keyring) -> VerifyReport
where
    I: IntoIterator<Item = &'a HistoryEntry>,
{
    let mut expected_prev: Option<Option<&str>> = match &anchor {
        Anchor::Hmac(hmac) => Some(Some(hmac.as_str())),
        Anchor::Genesis => Some(None),
        Anchor::Unanchored => None,
    };
    let mut last_id: Option<u64> = None;
    let mut checked = 0;

    for entry in entries {
        if last_id.is_none() {
            if anchor == Anchor::Genesis && entry.id != 1 {
                return VerifyReport::broken(checked, entry.id, BreakReason::LinkMismatch);
            }
            if expected_prev.is_none() && entry.id == 1 {
                expected_prev = Some(None);
            }
        }

        if let Some(last) = last_id {
            if entry.id <= last {
                return VerifyReport::broken(checked, entry.id, BreakReason::LinkMismatch);
            }
        }

        if let Some(expected) = expected_prev {
            if entry.hmac_prev.as_deref() != expected {
                return VerifyReport::broken(checked, entry.id, BreakReason::LinkMismatch);
            }
        }

        let digest_ok = keyring
            .resolve(entry.key_id.as_deref())
            .map(|key| entry.digest_matches(key))
            .unwrap_or(false);
        if !digest_ok {
            return VerifyReport::broken(checked, entry.id, BreakReason::DigestMismatch);
        }

        checked += 1;
        last_id = Some(entry.id);
        expected_prev = Some(Some(entry.hmac.as_str()));
    }

    VerifyReport::intact(checked)
}
