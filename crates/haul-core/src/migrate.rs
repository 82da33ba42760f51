//! Run orchestration.
//!
//! A run goes: backup → connect → load → indexes → reconcile every
//! collection → run metadata → count check → existence check → report.
//! Only the fatal errors in [`MigrateError`] leave a run early; the log is
//! flushed on every exit path and the target connection is released when
//! the [`TargetConnection`](crate::store::TargetConnection) drops.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::backup::{self, BackupOutcome};
use crate::catalog::{COLLECTIONS, METADATA_COLLECTION, Shape};
use crate::config::MigrateConfig;
use crate::error::MigrateError;
use crate::indexes;
use crate::log::{Logger, RunLog};
use crate::objectmap;
use crate::reconcile::{self, ReconcileOptions};
use crate::report::{
    ReconciliationResult, RunReport, RunStatus, SourceInfo, StageClock, TargetInfo, VerifyReport,
};
use crate::source::{self, SourceSnapshot};
use crate::store::{self, DocKey, Document, DocumentStore, WriteOp};
use crate::verify;

static RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifier of a run started at `at`, unique within and across processes.
#[must_use]
pub fn new_run_id(at: DateTime<Utc>) -> String {
    let seq = RUN_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("run-{}-{}-{seq}", backup::file_timestamp(at), std::process::id())
}

/// Run a full migration against the target named in `config`.
///
/// # Errors
///
/// Returns a [`MigrateError`] for invalid configuration, an unreadable or
/// unparseable source, an unreachable target, or a target failure outside
/// the per-record paths. Validation shortfalls are not errors; they set the
/// report status to `warning`.
pub fn run(config: &MigrateConfig) -> Result<RunReport, MigrateError> {
    config.validate()?;
    let mut session = RunSession::new(config);
    let backup = session.backup();

    let mut conn = match session.connect() {
        Ok(conn) => conn,
        Err(err) => return Err(session.abort(err)),
    };
    let uri = conn.uri().to_string();
    match session.migrate(&mut *conn, &uri, backup) {
        Ok(report) => Ok(session.finish(report)),
        Err(err) => Err(session.abort(err)),
    }
}

/// Run a full migration against an already-open store.
///
/// `uri` is only used for reporting.
///
/// # Errors
///
/// Same as [`run`], minus connection failures.
pub fn run_with_store(
    config: &MigrateConfig,
    store: &mut dyn DocumentStore,
    uri: &str,
) -> Result<RunReport, MigrateError> {
    config.validate()?;
    let mut session = RunSession::new(config);
    let backup = session.backup();
    match session.migrate(store, uri, backup) {
        Ok(report) => Ok(session.finish(report)),
        Err(err) => Err(session.abort(err)),
    }
}

/// Check the target against the source without backing up or writing.
///
/// # Errors
///
/// Returns a [`MigrateError`] if the configuration is invalid, the source
/// cannot be loaded, or the target cannot be opened.
pub fn verify_only(config: &MigrateConfig) -> Result<VerifyReport, MigrateError> {
    config.validate()?;
    let mut log = RunLog::new();
    let conn = store::open_target(&config.target_uri, &config.database, &config.root)?;
    let uri = conn.uri().to_string();
    verify_with_store(config, &*conn, &uri, &mut log)
}

/// Verify-only run against an already-open store.
///
/// # Errors
///
/// Returns a [`MigrateError`] if the source cannot be loaded.
pub fn verify_with_store(
    config: &MigrateConfig,
    store: &dyn DocumentStore,
    uri: &str,
    log: &mut dyn Logger,
) -> Result<VerifyReport, MigrateError> {
    let snapshot = source::load(&config.source_path, log)?;
    let count_check = verify::count_pass(store, &snapshot, COLLECTIONS, log);
    let existence_check = verify::existence_pass(store, &snapshot, COLLECTIONS, log);
    let status = RunStatus::from_checks(&count_check, &existence_check);

    Ok(VerifyReport {
        checked_at: Utc::now(),
        source: source_info(&snapshot),
        target: target_info(store, uri),
        count_check,
        existence_check,
        status,
        success: status == RunStatus::Success,
    })
}

/// Reconcile every catalog collection in order.
///
/// # Errors
///
/// Returns an error if a collection's existing keys cannot be read.
pub fn reconcile_all(
    store: &mut dyn DocumentStore,
    snapshot: &SourceSnapshot,
    options: &ReconcileOptions,
    log: &mut dyn Logger,
) -> Result<Vec<ReconciliationResult>, MigrateError> {
    let mut results = Vec::with_capacity(COLLECTIONS.len());
    for spec in COLLECTIONS {
        let value = snapshot.value(spec.name);
        let result = match spec.shape {
            Shape::Array => reconcile::reconcile_collection(store, spec, value, options, log)?,
            Shape::Map => objectmap::reconcile_object_map(store, spec, value, options, log),
        };
        results.push(result);
    }
    Ok(results)
}

fn source_info(snapshot: &SourceSnapshot) -> SourceInfo {
    SourceInfo {
        path: snapshot.path.clone(),
        hash: snapshot.hash.clone(),
        bytes: snapshot.byte_len,
    }
}

fn target_info(store: &dyn DocumentStore, uri: &str) -> TargetInfo {
    TargetInfo {
        uri: uri.to_string(),
        backend: store.backend().to_string(),
        database: store.database().to_string(),
    }
}

fn millis_since(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// State owned by one run: identity, clock and log.
struct RunSession<'c> {
    config: &'c MigrateConfig,
    run_id: String,
    started_at: DateTime<Utc>,
    started: Instant,
    log: RunLog,
    clock: StageClock,
    log_file: PathBuf,
}

impl<'c> RunSession<'c> {
    fn new(config: &'c MigrateConfig) -> Self {
        let started_at = Utc::now();
        let run_id = new_run_id(started_at);
        let log_file = config
            .log_dir
            .join(format!("migration-{}.log", backup::file_timestamp(started_at)));

        let mut log = RunLog::new();
        log.info(&format!("starting migration {run_id}"));
        tracing::info!(run_id = %run_id, source = %config.source_path.display(), "migration started");

        Self {
            config,
            run_id,
            started_at,
            started: Instant::now(),
            log,
            clock: StageClock::new(),
            log_file,
        }
    }

    fn backup(&mut self) -> BackupOutcome {
        let config = self.config;
        let at = self.started_at;
        let log = &mut self.log;
        self.clock.time("backup", || {
            backup::create_backup(&config.source_path, &config.backup_dir, at, log)
        })
    }

    fn connect(&mut self) -> Result<store::TargetConnection, MigrateError> {
        let config = self.config;
        let conn = self.clock.time("connect", || {
            store::open_target(&config.target_uri, &config.database, &config.root)
        })?;
        self.log.info(&format!(
            "connected to {} ({} backend, database {})",
            conn.uri(),
            conn.backend(),
            conn.database()
        ));
        Ok(conn)
    }

    fn migrate(
        &mut self,
        store: &mut dyn DocumentStore,
        uri: &str,
        backup: BackupOutcome,
    ) -> Result<RunReport, MigrateError> {
        let config = self.config;
        let log = &mut self.log;
        let clock = &mut self.clock;

        let snapshot = clock.time("load", || source::load(&config.source_path, log))?;

        let indexes = clock.time("indexes", || {
            indexes::provision_indexes(store, COLLECTIONS, log)
        });

        let options = ReconcileOptions {
            batch_size: config.batch_size,
            version: config.version.clone(),
            migrated_at: self.started_at,
        };
        let collections = clock.time("reconcile", || reconcile_all(store, &snapshot, &options, log))?;

        let metadata_written = clock.time("metadata", || {
            write_metadata(store, &self.run_id, self.started_at, config, &snapshot, &collections, log)
        });

        let count_check = clock.time("count_check", || {
            verify::count_pass(store, &snapshot, COLLECTIONS, log)
        });
        let existence_check = clock.time("existence_check", || {
            verify::existence_pass(store, &snapshot, COLLECTIONS, log)
        });

        let status = RunStatus::from_checks(&count_check, &existence_check);
        let report = RunReport {
            run_id: self.run_id.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            duration_ms: millis_since(self.started),
            source: source_info(&snapshot),
            target: target_info(store, uri),
            backup,
            indexes,
            collections,
            metadata_written,
            count_check,
            existence_check,
            stages: std::mem::take(clock).finish(),
            status,
            success: status == RunStatus::Success,
            log_file: None,
        };

        let summary = format!(
            "migration {} finished with status {} in {} ms ({} inserted, {} updated, {} skipped)",
            report.run_id,
            status.as_str(),
            report.duration_ms,
            report.total_inserted(),
            report.total_updated(),
            report.total_skipped()
        );
        match status {
            RunStatus::Success => log.info(&summary),
            RunStatus::Warning => log.warn(&summary),
        }
        Ok(report)
    }

    /// Flush the log with the report appended and return the final report.
    fn finish(self, report: RunReport) -> RunReport {
        let trailer = serde_json::to_string_pretty(&report).ok();
        match self.log.flush_to(&self.log_file, trailer.as_deref()) {
            Ok(()) => RunReport {
                log_file: Some(self.log_file),
                ..report
            },
            Err(err) => {
                tracing::warn!(path = %self.log_file.display(), error = %err, "could not write run log");
                report
            }
        }
    }

    /// Record a fatal error, flush what was logged so far, and hand the
    /// error back.
    fn abort(mut self, err: MigrateError) -> MigrateError {
        self.log
            .error(&format!("migration {} failed [{}]: {err}", self.run_id, err.code()));
        if let Err(flush_err) = self.log.flush_to(&self.log_file, None) {
            tracing::warn!(path = %self.log_file.display(), error = %flush_err, "could not write run log");
        }
        err
    }
}

/// Persist one metadata record for this run. Failure is a warning.
fn write_metadata(
    store: &mut dyn DocumentStore,
    run_id: &str,
    started_at: DateTime<Utc>,
    config: &MigrateConfig,
    snapshot: &SourceSnapshot,
    collections: &[ReconciliationResult],
    log: &mut dyn Logger,
) -> bool {
    let results = match serde_json::to_value(collections) {
        Ok(value) => value,
        Err(err) => {
            log.warn(&format!("could not encode run metadata: {err}"));
            return false;
        }
    };

    let mut document = Document::new();
    document.insert(
        "migrationDate".into(),
        Value::String(started_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    document.insert("migrationVersion".into(), Value::String(config.version.clone()));
    document.insert(
        "sourcePath".into(),
        Value::String(snapshot.path.display().to_string()),
    );
    document.insert("sourceHash".into(), Value::String(snapshot.hash.clone()));
    document.insert("databaseName".into(), Value::String(store.database().to_string()));
    document.insert("backend".into(), Value::String(store.backend().to_string()));
    document.insert("results".into(), results);

    let op = WriteOp::ReplaceUpsert {
        id: DocKey::String(run_id.to_string()),
        document,
    };
    match store.write_one(METADATA_COLLECTION, &op) {
        Ok(_) => {
            log.info(&format!("run metadata saved to {METADATA_COLLECTION}"));
            true
        }
        Err(err) => {
            log.warn(&format!("could not save run metadata: {err}"));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Filter;
    use crate::store::memory::MemoryStore;
    use std::path::Path;

    fn project(source: &str) -> (tempfile::TempDir, MigrateConfig) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = MigrateConfig::defaults(dir.path());
        std::fs::create_dir_all(dir.path().join("data")).expect("data dir");
        std::fs::write(&config.source_path, source).expect("write source");
        (dir, config)
    }

    #[test]
    fn run_ids_are_unique_for_the_same_instant() {
        let now = Utc::now();
        assert_ne!(new_run_id(now), new_run_id(now));
    }

    #[test]
    fn run_with_store_produces_full_report() {
        let (_dir, config) = project(r#"{"bins":[{"id":"B1","fill":50},{"id":"B2","fill":80}]}"#);
        let mut store = MemoryStore::new("waste_management");

        let report = run_with_store(&config, &mut store, "memory://").expect("run");

        assert!(report.success);
        assert_eq!(report.status, RunStatus::Success);
        let bins = report.collection("bins").expect("bins result");
        assert_eq!((bins.inserted, bins.updated, bins.skipped), (2, 0, 0));
        assert!(report.metadata_written);
        assert!(report.backup.created);
        let stage_names: Vec<&str> = report.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            stage_names,
            vec!["backup", "load", "indexes", "reconcile", "metadata", "count_check", "existence_check"]
        );
        assert_eq!(store.count(METADATA_COLLECTION).expect("count"), 1);
    }

    #[test]
    fn metadata_record_describes_the_run() {
        let (_dir, config) = project(r#"{"analytics":{"x":1}}"#);
        let mut store = MemoryStore::new("waste_management");

        let report = run_with_store(&config, &mut store, "memory://").expect("run");
        let meta = store
            .find_one(METADATA_COLLECTION, &Filter::Id(DocKey::String(report.run_id.clone())))
            .expect("find")
            .expect("metadata present");

        assert_eq!(meta["migrationVersion"], "2.0");
        assert_eq!(meta["databaseName"], "waste_management");
        assert_eq!(meta["sourceHash"], report.source.hash.as_str());
        assert!(meta["results"].as_array().is_some_and(|r| r.len() == COLLECTIONS.len()));
    }

    #[test]
    fn log_file_holds_entries_and_report() {
        let (_dir, config) = project(r#"{"bins":[{"id":"B1"}]}"#);
        let mut store = MemoryStore::new("waste_management");

        let report = run_with_store(&config, &mut store, "memory://").expect("run");
        let log_file = report.log_file.expect("log file written");
        let content = std::fs::read_to_string(&log_file).expect("read log");

        assert!(log_file.starts_with(&config.log_dir));
        assert!(content.contains("[INFO] starting migration"));
        assert!(content.contains(&format!("\"run_id\": \"{}\"", report.run_id)));
    }

    #[test]
    fn parse_failure_is_fatal_and_still_logged() {
        let (_dir, config) = project("{ not json");
        let mut store = MemoryStore::new("waste_management");

        let err = run_with_store(&config, &mut store, "memory://").expect_err("must fail");

        assert!(matches!(err, MigrateError::SourceParse { .. }));
        assert_eq!(store.count("bins").expect("count"), 0);
        let logs: Vec<_> = std::fs::read_dir(&config.log_dir)
            .expect("log dir exists")
            .collect();
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn unknown_target_scheme_is_fatal() {
        let (_dir, mut config) = project(r#"{"bins":[]}"#);
        config.target_uri = "postgres://localhost:5432".into();

        let err = run(&config).expect_err("must fail");
        assert!(matches!(err, MigrateError::TargetUnreachable { .. }));
    }

    #[test]
    fn unreachable_mongodb_target_aborts_before_any_write() {
        let (_dir, mut config) = project(r#"{"bins":[{"id":"B1"}]}"#);
        config.target_uri =
            "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200&connectTimeoutMS=200".into();

        let err = run(&config).expect_err("must fail");

        let MigrateError::TargetUnreachable { reason, .. } = &err else {
            panic!("expected TargetUnreachable, got {err:?}");
        };
        assert!(!reason.contains("unsupported scheme"), "{reason}");
    }

    #[test]
    fn missing_records_make_a_warning_not_an_error() {
        let (_dir, config) = project(r#"{"bins":[{"id":"B1"},{"id":"B2"}]}"#);
        let mut store = MemoryStore::new("waste_management");
        store
            .faults_mut()
            .reject
            .push(("bins".into(), DocKey::String("B2".into())));

        let report = run_with_store(&config, &mut store, "memory://").expect("run");

        assert_eq!(report.status, RunStatus::Warning);
        assert!(!report.success);
        assert!(!report.existence_check.passed);
    }

    #[test]
    fn verify_only_does_not_write() {
        let (_dir, config) = project(r#"{"bins":[{"id":"B1"}]}"#);
        let store = MemoryStore::new("waste_management");
        let mut log = RunLog::new();

        let report = verify_with_store(&config, &store, "memory://", &mut log).expect("verify");

        assert!(!report.success);
        assert_eq!(store.count("bins").expect("count"), 0);
        assert!(!Path::new(&config.backup_dir).exists());
    }
}
