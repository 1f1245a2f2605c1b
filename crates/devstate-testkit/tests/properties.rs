//! Property tests over randomly generated documents and operation sequences.

use devstate_core::{canonical_json, shallow_merge, state_checksum, Action, HistoryEntry};
use devstate_testkit::fixtures::seeded_memory_engine;
use devstate_testkit::generators::{apply_op, json_object, json_value, ledger_ops};
use proptest::prelude::*;
use serde_json::{json, Value};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Every entry links to the hmac of the one before it.
fn assert_linked(entries: &[HistoryEntry]) {
    assert!(entries[0].hmac_prev.is_none());
    for pair in entries.windows(2) {
        assert!(pair[1].id > pair[0].id);
        assert_eq!(pair[1].hmac_prev.as_deref(), Some(pair[0].hmac.as_str()));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn chain_verifies_after_any_operations(ops in ledger_ops(12)) {
        runtime().block_on(async {
            let engine = seeded_memory_engine(json!({"project": "prop"})).await;
            for op in &ops {
                apply_op(&engine, op).await.unwrap();
            }

            let report = engine.verify(0).await.unwrap();
            assert!(report.ok, "chain broke: {:?}", report.failure);

            let entries = engine.export().await.unwrap().history.entries;
            assert_eq!(report.checked, entries.len());
            assert_eq!(entries.len(), ops.len() + 1);
            assert_linked(&entries);
        });
    }

    #[test]
    fn state_checksum_tracks_latest_update(ops in ledger_ops(10)) {
        runtime().block_on(async {
            let engine = seeded_memory_engine(json!({})).await;
            for op in &ops {
                apply_op(&engine, op).await.unwrap();
            }

            let state = engine.get().await.unwrap();
            assert!(state.checksum_is_current());

            let entries = engine.export().await.unwrap().history.entries;
            let last_write = entries
                .iter()
                .rev()
                .find(|e| matches!(e.action, Action::SeedState | Action::UpdateState))
                .unwrap();
            assert_eq!(last_write.state_checksum.as_deref(), Some(state.checksum.as_str()));
        });
    }

    #[test]
    fn tombstones_reference_live_entries(ops in ledger_ops(12)) {
        runtime().block_on(async {
            let engine = seeded_memory_engine(json!({})).await;
            for op in &ops {
                apply_op(&engine, op).await.unwrap();
            }

            for id in engine.tombstoned_ids().await.unwrap() {
                // Tombstoned entries stay readable and unchanged.
                engine.get_entry(id).await.unwrap();
            }
        });
    }

    #[test]
    fn merge_replaces_patched_keys_only(base in json_object(), patch in json_object()) {
        let merged = shallow_merge(&base, &patch);

        for (key, value) in &patch {
            prop_assert_eq!(&merged[key], value);
        }
        for (key, value) in &base {
            if !patch.contains_key(key) {
                prop_assert_eq!(&merged[key], value);
            }
        }
        prop_assert!(merged.keys().all(|k| base.contains_key(k) || patch.contains_key(k)));
    }

    #[test]
    fn merge_is_idempotent(base in json_object(), patch in json_object()) {
        let once = shallow_merge(&base, &patch);
        let twice = shallow_merge(&once, &patch);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn canonical_form_is_stable(value in json_value()) {
        let text = canonical_json(&value);
        let reparsed: Value = serde_json::from_str(&text).unwrap();

        prop_assert_eq!(&reparsed, &value);
        prop_assert_eq!(canonical_json(&reparsed), text);
        prop_assert_eq!(state_checksum(&reparsed), state_checksum(&value));
    }
}
