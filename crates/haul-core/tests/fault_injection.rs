//! Full runs against a store that misbehaves.

use haul_core::MigrateConfig;
use haul_core::migrate::run_with_store;
use haul_core::report::{CountStatus, RunStatus};
use haul_core::store::memory::MemoryStore;
use haul_core::store::{DocKey, Document, DocumentStore, Filter};
use serde_json::json;
use tempfile::TempDir;

fn project(source: &serde_json::Value) -> (TempDir, MigrateConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = MigrateConfig::defaults(dir.path());
    std::fs::create_dir_all(dir.path().join("data")).expect("data dir");
    std::fs::write(&config.source_path, source.to_string()).expect("write source");
    (dir, config)
}

fn key(raw: &str) -> DocKey {
    DocKey::String(raw.to_string())
}

#[test]
fn concurrent_writer_conflict_is_retried_as_update() {
    let (_dir, config) = project(&json!({"bins": [{"id": "B1", "fill": 10}, {"id": "B2", "fill": 80}]}));
    let mut store = MemoryStore::new("waste_management");
    let mut foreign = Document::new();
    foreign.insert("id".into(), json!("B2"));
    foreign.insert("fill".into(), json!(0));
    store
        .faults_mut()
        .concurrent_inserts
        .push(("bins".into(), key("external-7"), foreign));

    let report = run_with_store(&config, &mut store, "memory://").expect("run");

    let bins = report.collection("bins").expect("bins");
    assert_eq!(bins.inserted, 1);
    assert_eq!(bins.updated, 1);
    assert_eq!(bins.conflicts_retried, 1);
    assert_eq!(bins.batch_fallbacks, 1);
    assert!(report.success);

    let b2 = store
        .find_one("bins", &Filter::field("id", key("B2")))
        .expect("find")
        .expect("B2");
    assert_eq!(b2["fill"], 80);
    assert_eq!(b2["_id"], "external-7");
}

#[test]
fn transient_batch_failure_still_verifies_clean() {
    let (_dir, config) = project(&json!({"alerts": [{"id": "A1"}, {"id": "A2"}, {"id": "A3"}]}));
    let mut store = MemoryStore::new("waste_management");
    store.faults_mut().fail_bulk_writes = 1;

    let report = run_with_store(&config, &mut store, "memory://").expect("run");

    let alerts = report.collection("alerts").expect("alerts");
    assert_eq!((alerts.inserted, alerts.batch_fallbacks), (3, 1));
    assert_eq!(report.status, RunStatus::Success);
}

#[test]
fn rejected_record_is_reported_as_missing() {
    let (_dir, config) = project(&json!({"sensors": [{"imei": "111"}, {"imei": "222"}]}));
    let mut store = MemoryStore::new("waste_management");
    store.faults_mut().reject.push(("sensors".into(), key("222")));

    let report = run_with_store(&config, &mut store, "memory://").expect("run");

    assert_eq!(report.status, RunStatus::Warning);
    assert_eq!(report.collection("sensors").expect("sensors").skipped, 1);
    let count = report
        .count_check
        .collections
        .iter()
        .find(|c| c.collection == "sensors")
        .expect("sensors count");
    assert_eq!(count.status, CountStatus::Missing);
    let existence = report
        .existence_check
        .collections
        .iter()
        .find(|c| c.collection == "sensors")
        .expect("sensors existence");
    assert_eq!(existence.missing_sample, vec!["\"222\"".to_string()]);
}

#[test]
fn extra_target_documents_do_not_fail_verification() {
    let (_dir, config) = project(&json!({"routes": [{"id": "R1"}]}));
    let mut store = MemoryStore::new("waste_management");
    let mut old = Document::new();
    old.insert("id".into(), json!("R0"));
    store
        .write_one(
            "routes",
            &haul_core::store::WriteOp::ReplaceUpsert {
                id: key("R0"),
                document: old,
            },
        )
        .expect("seed");

    let report = run_with_store(&config, &mut store, "memory://").expect("run");

    assert!(report.success);
    let count = report
        .count_check
        .collections
        .iter()
        .find(|c| c.collection == "routes")
        .expect("routes count");
    assert_eq!(count.status, CountStatus::Superset);
}
