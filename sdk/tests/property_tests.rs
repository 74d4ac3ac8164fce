use proptest::prelude::*;
use sdk::entities::{CanonicalName, Stub};
use sdk::errors::{CurateError, CurateErrorExt};
use sdk::translator::{decode_table, encode_table, IntendedFor, TranslatorEntry};
use std::collections::BTreeMap;

// Every error carries a non-empty, static hint
proptest! {
    #[test]
    fn test_error_user_hint_completeness(error_str in "\\PC*") {
        let errs = vec![
            CurateError::Config(error_str.clone()),
            CurateError::TranslatorFormat(error_str.clone()),
            CurateError::TranslatorDecode { key: error_str.clone(), reason: error_str.clone() },
            CurateError::MissingDependency(error_str.clone()),
            CurateError::NameCollision(error_str.clone()),
            CurateError::PathProtected(std::path::PathBuf::from(&error_str)),
            CurateError::Unpack(error_str.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!err.to_string().is_empty());
        }
    }
}

fn entity_value() -> impl Strategy<Value = String> {
    "[A-Za-z0-9]{1,8}"
}

fn stub_strategy() -> impl Strategy<Value = String> {
    (
        proptest::option::of(entity_value()),
        proptest::option::of(entity_value()),
        proptest::option::of(1u32..20),
        "(T1w|T2w|bold|dwi|epi|phasediff|magnitude1)",
    )
        .prop_map(|(task, acq, run, suffix)| {
            let mut parts = Vec::new();
            if let Some(task) = task {
                parts.push(format!("task-{}", task));
            }
            if let Some(acq) = acq {
                parts.push(format!("acq-{}", acq));
            }
            if let Some(run) = run {
                parts.push(format!("run-{:02}", run));
            }
            parts.push(suffix);
            parts.join("_")
        })
}

// Well-formed stubs survive parse/display untouched
proptest! {
    #[test]
    fn test_stub_display_is_stable(raw in stub_strategy()) {
        let stub = Stub::parse(&raw).unwrap();
        prop_assert_eq!(stub.to_string(), raw.clone());

        let name = CanonicalName::new("S1", Some("2".to_string()), stub.clone());
        let parsed = CanonicalName::parse(&name.to_string()).unwrap();
        prop_assert_eq!(parsed, name);
    }

    #[test]
    fn test_with_run_replaces_existing_run(raw in stub_strategy(), run in 1u32..100) {
        let stub = Stub::parse(&raw).unwrap().with_run(run);
        prop_assert_eq!(stub.run(), Some(run));
        prop_assert_eq!(stub.without_run().run(), None);
        prop_assert_eq!(stub.to_string().matches("run-").count(), 1);
    }
}

// A translator document written by encode_table reads back to the same table
proptest! {
    #[test]
    fn test_translator_table_survives_save(
        keys in proptest::collection::btree_set("[A-Za-z0-9_ ]{1,16}", 1..8),
        stubs in proptest::collection::vec(stub_strategy(), 8),
        links in proptest::collection::vec(proptest::bool::ANY, 8),
    ) {
        let mut table = BTreeMap::new();
        for (idx, key) in keys.iter().enumerate() {
            let entry = if idx % 3 == 0 {
                TranslatorEntry::placeholder()
            } else if links[idx] {
                TranslatorEntry::new("fmap", "acq-x", IntendedFor::Targets(vec![stubs[idx].clone()])).unwrap()
            } else {
                TranslatorEntry::new("anat", stubs[idx].clone(), IntendedFor::Unassigned).unwrap()
            };
            table.insert(key.clone(), entry);
        }

        let text = encode_table(&table).unwrap();
        prop_assert!(text.ends_with('\n'));
        let decoded = decode_table(&text).unwrap();
        prop_assert_eq!(&decoded, &table);
        prop_assert_eq!(encode_table(&decoded).unwrap(), text);
    }
}
