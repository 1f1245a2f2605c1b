//! Proptest generators for property-based testing.

use devstate_core::EntryDraft;
use devstate_engine::{Engine, Result};
use devstate_store::Store;
use proptest::prelude::*;
use proptest::sample::Index;
use serde_json::{Map, Value};

/// Generate a top-level key that never collides with the typed keys of the
/// test schema.
pub fn patch_key() -> impl Strategy<Value = String> {
    "k[a-z0-9_]{0,6}"
}

/// Generate a JSON leaf. Numbers are integers so values survive a
/// serialize/parse cycle unchanged.
pub fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "\\PC{0,12}".prop_map(Value::String),
    ]
}

/// Generate an arbitrary JSON value, nested up to three levels.
pub fn json_value() -> impl Strategy<Value = Value> {
    json_leaf().prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("\\PC{0,8}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Generate a JSON object suitable as a state document or patch.
pub fn json_object() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map(patch_key(), json_value(), 0..6)
        .prop_map(|m| m.into_iter().collect())
}

/// Generate an actor name.
pub fn actor() -> impl Strategy<Value = String> {
    "(agent|bot|user)-[0-9]{1,2}"
}

/// Generate a caller-defined action name.
pub fn custom_action() -> impl Strategy<Value = String> {
    "(deploy|note|checkpoint|review)(_[a-z]{1,4})?"
}

/// One ledger-affecting engine call.
#[derive(Debug, Clone)]
pub enum LedgerOp {
    /// Patch the state document.
    Update {
        actor: String,
        patch: Map<String, Value>,
    },
    /// Append a caller-defined entry.
    Append {
        actor: String,
        action: String,
        checkpoints: Option<(String, String)>,
        metadata: Map<String, Value>,
    },
    /// Tombstone an existing entry, picked by position in the live ledger.
    Tombstone { actor: String, target: Index },
}

/// Generate a single [`LedgerOp`].
pub fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        (actor(), json_object()).prop_map(|(actor, patch)| LedgerOp::Update { actor, patch }),
        (
            actor(),
            custom_action(),
            proptest::option::of(("[0-9a-f]{7}", "[0-9a-f]{7}")),
            json_object(),
        )
            .prop_map(|(actor, action, checkpoints, metadata)| LedgerOp::Append {
                actor,
                action,
                checkpoints,
                metadata,
            }),
        (actor(), any::<Index>()).prop_map(|(actor, target)| LedgerOp::Tombstone { actor, target }),
    ]
}

/// Generate a sequence of up to `max` operations.
pub fn ledger_ops(max: usize) -> impl Strategy<Value = Vec<LedgerOp>> {
    prop::collection::vec(ledger_op(), 0..=max)
}

impl Arbitrary for LedgerOp {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        ledger_op().boxed()
    }
}

/// Run `op` against a seeded engine.
///
/// A tombstone against an empty ledger is skipped.
pub async fn apply_op<S: Store>(engine: &Engine<S>, op: &LedgerOp) -> Result<()> {
    match op {
        LedgerOp::Update { actor, patch } => {
            engine.update(Value::Object(patch.clone()), actor).await?;
        }
        LedgerOp::Append {
            actor,
            action,
            checkpoints,
            metadata,
        } => {
            let mut draft = EntryDraft::new(actor.as_str(), action.as_str()).metadata(metadata.clone());
            if let Some((from, to)) = checkpoints {
                draft = draft.checkpoints(Some(from.clone()), Some(to.clone()));
            }
            engine.append(draft).await?;
        }
        LedgerOp::Tombstone { actor, target } => {
            let live = engine.store().tail_entries(None).await?;
            if !live.is_empty() {
                let id = live[target.index(live.len())].id;
                engine.tombstone(id, actor).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn patch_keys_avoid_typed_fields(key in patch_key()) {
            prop_assert!(key.starts_with('k'));
            prop_assert!(key != "count" && key != "bad_field" && key != "project");
        }

        #[test]
        fn generated_objects_pass_test_schema(obj in json_object()) {
            use devstate_core::SchemaValidator;
            let verdict = crate::fixtures::test_validator().validate(&Value::Object(obj));
            prop_assert!(verdict.valid);
        }

        #[test]
        fn custom_actions_are_not_reserved(action in custom_action()) {
            let action = devstate_core::Action::from(action.as_str());
            prop_assert!(matches!(action, devstate_core::Action::Custom(_)));
        }
    }
}
