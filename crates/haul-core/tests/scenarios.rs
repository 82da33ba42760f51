//! End-to-end runs against the SQLite backend.

use std::path::Path;

use haul_core::MigrateConfig;
use haul_core::migrate;
use haul_core::report::RunStatus;
use haul_core::store::sqlite::SqliteStore;
use haul_core::store::{DocKey, DocumentStore, Filter, IndexSpec};
use serde_json::json;
use tempfile::TempDir;

fn project(source: &serde_json::Value) -> (TempDir, MigrateConfig) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = MigrateConfig::defaults(dir.path());
    config.target_uri = "sqlite://data".into();
    std::fs::create_dir_all(dir.path().join("data")).expect("data dir");
    std::fs::write(&config.source_path, source.to_string()).expect("write source");
    (dir, config)
}

fn open_target(root: &Path) -> SqliteStore {
    SqliteStore::open(&root.join("data/waste_management.sqlite3"), "waste_management")
        .expect("open target")
}

fn key(raw: &str) -> DocKey {
    DocKey::String(raw.to_string())
}

#[test]
fn fresh_target_receives_every_bin() {
    let (dir, config) = project(&json!({
        "bins": [{"id": "B1", "fill": 50}, {"id": "B2", "fill": 80}]
    }));

    let report = migrate::run(&config).expect("run");

    let bins = report.collection("bins").expect("bins");
    assert_eq!((bins.inserted, bins.updated, bins.skipped), (2, 0, 0));
    let existence = report
        .existence_check
        .collections
        .iter()
        .find(|c| c.collection == "bins")
        .expect("bins existence");
    assert_eq!((existence.found, existence.total), (2, 2));
    assert_eq!(report.status, RunStatus::Success);

    let store = open_target(dir.path());
    assert_eq!(store.count("bins").expect("count"), 2);
    for id in ["B1", "B2"] {
        assert!(store.exists("bins", &Filter::Id(key(id))).expect("exists"), "{id}");
    }
}

#[test]
fn rerun_updates_and_refreshes_stamp() {
    let (dir, config) = project(&json!({
        "bins": [{"id": "B1", "fill": 50}, {"id": "B2", "fill": 80}]
    }));

    migrate::run(&config).expect("first run");
    let first_stamp = open_target(dir.path())
        .find_one("bins", &Filter::Id(key("B1")))
        .expect("find")
        .expect("B1")["migratedAt"]
        .clone();

    std::thread::sleep(std::time::Duration::from_millis(5));
    let report = migrate::run(&config).expect("second run");

    let bins = report.collection("bins").expect("bins");
    assert_eq!((bins.inserted, bins.updated, bins.skipped), (0, 2, 0));
    let store = open_target(dir.path());
    assert_eq!(store.count("bins").expect("count"), 2);
    let second_stamp = store
        .find_one("bins", &Filter::Id(key("B1")))
        .expect("find")
        .expect("B1")["migratedAt"]
        .clone();
    assert_ne!(first_stamp, second_stamp);
}

#[test]
fn keyless_bin_is_never_written() {
    let (dir, config) = project(&json!({"bins": [{"fill": 50}]}));

    let report = migrate::run(&config).expect("run");

    let bins = report.collection("bins").expect("bins");
    assert_eq!((bins.inserted, bins.updated, bins.skipped), (0, 0, 1));
    assert_eq!(open_target(dir.path()).count("bins").expect("count"), 0);
}

#[test]
fn stale_email_index_on_sensors_is_replaced() {
    let (dir, config) = project(&json!({"sensors": [{"imei": "123"}]}));
    {
        let mut store = open_target(dir.path());
        store
            .create_index("sensors", &IndexSpec::asc("email").unique())
            .expect("seed stale index");
    }

    let report = migrate::run(&config).expect("run");

    assert!(report.indexes.dropped_stale >= 1);
    let sensors = report.collection("sensors").expect("sensors");
    assert_eq!(sensors.inserted, 1);

    let store = open_target(dir.path());
    let indexes = store.list_indexes("sensors").expect("list");
    assert!(indexes.iter().all(|i| i.name != "email_1"));
    let imei = indexes.iter().find(|i| i.name == "imei_1").expect("imei index");
    assert!(imei.unique);
    assert!(store.exists("sensors", &Filter::Id(key("123"))).expect("exists"));
}

#[test]
fn analytics_map_becomes_key_value_records() {
    let (dir, config) = project(&json!({"analytics": {"x": 1, "y": 2}}));

    let report = migrate::run(&config).expect("run");

    assert_eq!(report.collection("analytics").expect("analytics").inserted, 2);
    let store = open_target(dir.path());
    assert_eq!(store.count("analytics").expect("count"), 2);
    let y = store
        .find_one("analytics", &Filter::Id(key("y")))
        .expect("find")
        .expect("y");
    assert_eq!(y["key"], "y");
    assert_eq!(y["value"], 2);
}

#[test]
fn full_snapshot_round_trip_verifies_clean() {
    let (dir, config) = project(&json!({
        "users": [{"id": "U1", "email": "a@example.com", "role": "driver"}, {"id": "U2", "role": "admin"}],
        "bins": [{"id": "B1", "status": "full", "type": "general"}],
        "routes": [{"id": "R1", "driverId": "U1", "status": "active"}],
        "collections": [{"id": "C1", "binId": "B1", "driverId": "U1", "timestamp": "2026-01-02T03:04:05Z"}],
        "complaints": [{"id": 1, "status": "open", "description": "overflowing bin"}],
        "alerts": [{"id": "A1", "type": "fill", "status": "new"}],
        "sensors": [{"imei": "356938035643809", "binId": "B1"}],
        "systemLogs": [{"id": "L1", "timestamp": "2026-01-02T03:04:05Z"}],
        "pendingRegistrations": [{"id": "P1", "email": "new@example.com"}],
        "driverLocations": {"U1": {"lat": 51.5, "lng": -0.12}},
        "analytics": {"collectionsToday": 12}
    }));

    let first = migrate::run(&config).expect("first run");
    assert!(first.success, "{:#?}", first.count_check);
    assert_eq!(first.total_inserted(), 12);

    let second = migrate::run(&config).expect("second run");
    assert!(second.success);
    assert_eq!(second.total_inserted(), 0);
    assert_eq!(second.total_updated(), 12);

    let store = open_target(dir.path());
    assert_eq!(store.count("_migration_metadata").expect("count"), 2);
    // Users without an email do not collide on the sparse unique index.
    assert_eq!(store.count("users").expect("count"), 2);
}

#[test]
fn verify_only_reports_what_is_missing() {
    let (_dir, config) = project(&json!({"bins": [{"id": "B1"}]}));

    let before = migrate::verify_only(&config).expect("verify before");
    assert_eq!(before.status, RunStatus::Warning);
    assert_eq!(before.existence_check.collections[1].missing_sample, vec!["\"B1\"".to_string()]);

    migrate::run(&config).expect("run");
    let after = migrate::verify_only(&config).expect("verify after");
    assert!(after.success);
}
