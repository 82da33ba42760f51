//! Re-running reconciliation converges instead of duplicating.

use std::collections::HashMap;

use chrono::Utc;
use haul_core::catalog::{self, CollectionSpec};
use haul_core::log::RunLog;
use haul_core::reconcile::{ReconcileOptions, reconcile_collection};
use haul_core::source::SourceValue;
use haul_core::store::memory::MemoryStore;
use haul_core::store::{DocKey, Document, DocumentStore, Filter, WriteOp};
use proptest::prelude::*;
use serde_json::{Value, json};

fn bins() -> &'static CollectionSpec {
    catalog::find("bins").expect("bins registered")
}

/// Documents keyed by `_id`, for whole-state comparison.
fn state(store: &MemoryStore, collection: &str) -> HashMap<String, Document> {
    store
        .documents(collection)
        .into_iter()
        .map(|doc| (doc["_id"].to_string(), doc))
        .collect()
}

fn arb_record() -> impl Strategy<Value = Value> {
    let key = prop_oneof![
        "[a-d]{1,2}".prop_map(Value::from),
        (0u8..6).prop_map(Value::from),
    ];
    prop_oneof![
        4 => (key, 0u32..100).prop_map(|(id, fill)| json!({"id": id, "fill": fill})),
        1 => (0u32..100).prop_map(|fill| json!({"fill": fill})),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn second_run_inserts_nothing_and_changes_nothing(
        records in prop::collection::vec(arb_record(), 0..40),
        batch_size in 1usize..8,
    ) {
        let source = SourceValue::classify(Value::Array(records));
        let mut options = ReconcileOptions::new(Utc::now());
        options.batch_size = batch_size;
        let mut log = RunLog::new();

        let mut once = MemoryStore::new("t");
        reconcile_collection(&mut once, bins(), &source, &options, &mut log).expect("run once");

        let mut twice = MemoryStore::new("t");
        reconcile_collection(&mut twice, bins(), &source, &options, &mut log).expect("first");
        let second = reconcile_collection(&mut twice, bins(), &source, &options, &mut log)
            .expect("second");

        prop_assert_eq!(second.inserted, 0);
        prop_assert_eq!(state(&once, "bins"), state(&twice, "bins"));
    }
}

#[test]
fn restart_after_outage_leaves_every_record_exactly_once() {
    let records: Vec<Value> = (0..10).map(|i| json!({"id": format!("B{i}"), "fill": i})).collect();
    let source = SourceValue::classify(Value::Array(records));
    let mut options = ReconcileOptions::new(Utc::now());
    options.batch_size = 3;
    let mut log = RunLog::new();

    let mut store = MemoryStore::new("t");
    store.faults_mut().outage_after_batches = Some(2);
    let interrupted = reconcile_collection(&mut store, bins(), &source, &options, &mut log)
        .expect("interrupted run");
    assert_eq!(interrupted.inserted, 6);
    assert_eq!(interrupted.skipped, 4);

    store.clear_faults();
    let resumed = reconcile_collection(&mut store, bins(), &source, &options, &mut log)
        .expect("resumed run");
    assert_eq!((resumed.inserted, resumed.updated, resumed.skipped), (4, 6, 0));

    assert_eq!(store.count("bins").expect("count"), 10);
    for i in 0..10 {
        let id = DocKey::String(format!("B{i}"));
        let matches = store
            .documents("bins")
            .iter()
            .filter(|doc| doc.get("id").and_then(DocKey::from_value).as_ref() == Some(&id))
            .count();
        assert_eq!(matches, 1, "B{i}");
    }
}

#[test]
fn colliding_identity_is_replaced_not_inserted() {
    let mut store = MemoryStore::new("t");
    // A document already sits at identity B1 but lacks the key field.
    let mut squatter = Document::new();
    squatter.insert("fill".into(), json!(1));
    store
        .write_one(
            "bins",
            &WriteOp::ReplaceUpsert {
                id: DocKey::String("B1".into()),
                document: squatter,
            },
        )
        .expect("seed");

    let source = SourceValue::classify(json!([{"id": "B1", "fill": 99}]));
    let mut log = RunLog::new();
    let result = reconcile_collection(&mut store, bins(), &source, &ReconcileOptions::new(Utc::now()), &mut log)
        .expect("reconcile");

    assert_eq!((result.inserted, result.updated), (0, 1));
    let b1 = store
        .find_one("bins", &Filter::Id(DocKey::String("B1".into())))
        .expect("find")
        .expect("B1");
    assert_eq!(b1["fill"], 99);
    assert_eq!(b1["id"], "B1");
}
