//! Golden test vectors for cross-implementation verification.
//!
//! Every implementation of DevState must produce identical:
//! - canonical JSON of the state document
//! - state checksum
//! - canonical signed message of an entry
//! - entry hmac (HMAC-SHA-256, lowercase hex)

use devstate_core::{
    canonical_json, state_checksum, verify_chain, Anchor, EntryDraft, HistoryEntry, HmacKey,
    Keyring, SigningSecret,
};
use serde_json::{json, Value};

const SECRET: &[u8] = b"golden-secret";

const STATE_CANONICAL: &str =
    r#"{"agents":["planner","coder"],"phase":{"name":"build","step":2},"project":"devstate"}"#;
const STATE_CHECKSUM: &str =
    "sha256:ce26717bb7854c88e0c5fde3766fef8188a78c12ac0ae5615bd2454ae35abced";

const SEED_MESSAGE: &str = r#"{"action":"seed_state","actor":"provisioner","cp_from":null,"cp_to":null,"hmac_prev":null,"metadata":{},"state_checksum":"sha256:ce26717bb7854c88e0c5fde3766fef8188a78c12ac0ae5615bd2454ae35abced","ts":1700000000000}"#;
const SEED_HMAC: &str = "a6b40b08094e53323d8c375bafdfd3f5a9163f633cf10155f23f6b8f12c8c45e";

const DEPLOY_MESSAGE: &str = "{\"action\":\"deploy\",\"actor\":\"agent-1\",\"cp_from\":\"abc123\",\"cp_to\":\"def456\",\"hmac_prev\":\"a6b40b08094e53323d8c375bafdfd3f5a9163f633cf10155f23f6b8f12c8c45e\",\"metadata\":{\"env\":\"prod\",\"note\":\"h\u{e9}llo\\n\"},\"state_checksum\":null,\"ts\":1700000000500}";
const DEPLOY_HMAC: &str = "b860054cffdb275e9f441c65f696900e14c430c615c8579c53fc4416e5860e8c";

fn state() -> Value {
    // Deliberately out of key order.
    json!({
        "project": "devstate",
        "phase": {"step": 2, "name": "build"},
        "agents": ["planner", "coder"]
    })
}

fn key() -> HmacKey {
    HmacKey::new("golden", SigningSecret::new(SECRET.to_vec()).unwrap(), 0)
}

fn golden_chain() -> Vec<HistoryEntry> {
    let key = key();
    let seed = EntryDraft::new("provisioner", "seed_state")
        .state_checksum(state_checksum(&state()))
        .seal(1_700_000_000_000, None, &key)
        .into_entry(1);
    let deploy = EntryDraft::new("agent-1", "deploy")
        .checkpoints(Some("abc123".into()), Some("def456".into()))
        .meta("env", json!("prod"))
        .meta("note", json!("h\u{e9}llo\n"))
        .seal(1_700_000_000_500, Some(seed.hmac.clone()), &key)
        .into_entry(2);
    vec![seed, deploy]
}

#[test]
fn golden_state_checksum() {
    assert_eq!(canonical_json(&state()), STATE_CANONICAL);
    assert_eq!(state_checksum(&state()), STATE_CHECKSUM);
}

#[test]
fn golden_entry_messages_and_hmacs() {
    let chain = golden_chain();

    assert_eq!(String::from_utf8(chain[0].signed_message()).unwrap(), SEED_MESSAGE);
    assert_eq!(chain[0].hmac, SEED_HMAC);

    assert_eq!(String::from_utf8(chain[1].signed_message()).unwrap(), DEPLOY_MESSAGE);
    assert_eq!(chain[1].hmac, DEPLOY_HMAC);
}

#[test]
fn golden_chain_verifies() {
    let chain = golden_chain();
    let report = verify_chain(&chain, Anchor::Unanchored, &Keyring::new(key()));
    assert!(report.ok);
    assert_eq!(report.checked, 2);
}

#[test]
fn golden_entries_parse_from_wire_form() {
    // Entries as another implementation would export them, without key ids.
    let wire = json!([
        {
            "id": 1, "ts": 1_700_000_000_000i64, "actor": "provisioner", "action": "seed_state",
            "cp_from": null, "cp_to": null, "state_checksum": STATE_CHECKSUM,
            "hmac_prev": null, "hmac": SEED_HMAC, "metadata": {}
        },
        {
            "id": 2, "ts": 1_700_000_000_500i64, "actor": "agent-1", "action": "deploy",
            "cp_from": "abc123", "cp_to": "def456", "state_checksum": null,
            "hmac_prev": SEED_HMAC, "hmac": DEPLOY_HMAC,
            "metadata": {"note": "h\u{e9}llo\n", "env": "prod"}
        }
    ]);
    let entries: Vec<HistoryEntry> = serde_json::from_value(wire).unwrap();
    assert!(entries.iter().all(|e| e.key_id.is_none()));

    let report = verify_chain(&entries, Anchor::Unanchored, &Keyring::new(key()));
    assert!(report.ok);
}
