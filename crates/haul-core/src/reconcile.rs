//! Array collection reconciler.
//!
//! Converges a target collection toward the source array without deleting
//! anything:
//! 1. fetch the set of key values already in the target, once
//! 2. turn each keyed record into an update (key present) or an
//!    insert-by-identity (key absent)
//! 3. submit the operations in bounded unordered batches
//! 4. replay a failed batch one operation at a time through [`upsert_one`]
//!
//! Re-running against the same source is always safe: existing keys become
//! updates that re-apply the same fields, and identities never change.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::catalog::{CollectionSpec, Shape};
use crate::log::Logger;
use crate::report::ReconciliationResult;
use crate::source::{Entity, SourceValue};
use crate::store::{DocKey, Document, DocumentStore, Filter, ID_FIELD, StoreError, WriteAck, WriteOp};

/// Default number of operations per bulk batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default value stamped into `migrationVersion`.
pub const DEFAULT_MIGRATION_VERSION: &str = "2.0";

/// Settings shared by both reconcilers for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub batch_size: usize,
    pub version: String,
    /// Timestamp stamped into every written record as `migratedAt`.
    pub migrated_at: DateTime<Utc>,
}

impl ReconcileOptions {
    #[must_use]
    pub fn new(migrated_at: DateTime<Utc>) -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            version: DEFAULT_MIGRATION_VERSION.to_string(),
            migrated_at,
        }
    }

    /// Add `migratedAt` and `migrationVersion` to `doc`.
    pub fn stamp(&self, doc: &mut Document) {
        doc.insert(
            "migratedAt".into(),
            self.migrated_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into(),
        );
        doc.insert("migrationVersion".into(), self.version.clone().into());
    }
}

/// What happened to one record written individually.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The insert hit a duplicate key and was applied as an update.
    ConflictRetried,
    Skipped(String),
}

impl ReconciliationResult {
    /// Fold one individual outcome into the tally.
    pub fn record(&mut self, outcome: &UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::ConflictRetried => {
                self.updated += 1;
                self.conflicts_retried += 1;
            }
            UpsertOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// The key an operation targets.
fn op_key(op: &WriteOp) -> &DocKey {
    match op {
        WriteOp::ReplaceUpsert { id, .. } => id,
        WriteOp::UpdateFields { filter, .. } => match filter {
            Filter::Id(key) | Filter::Field { value: key, .. } => key,
        },
    }
}

/// Write a single operation, converging instead of failing where possible.
///
/// - An insert rejected for a duplicate key is retried once as an update
///   matched on `key_field`.
/// - An update that matches nothing is re-issued as an insert.
/// - Anything else that fails is reported as [`UpsertOutcome::Skipped`].
pub fn upsert_one(
    store: &mut dyn DocumentStore,
    collection: &str,
    key_field: &str,
    op: &WriteOp,
) -> UpsertOutcome {
    match op {
        WriteOp::ReplaceUpsert { id, document } => match store.write_one(collection, op) {
            Ok(WriteAck::Inserted) => UpsertOutcome::Inserted,
            Ok(WriteAck::Replaced | WriteAck::Updated) => UpsertOutcome::Updated,
            Ok(WriteAck::Unmatched) => UpsertOutcome::Skipped("upsert matched nothing".into()),
            Err(err) if err.is_duplicate_key() => retry_as_update(store, collection, key_field, id, document),
            Err(err) => UpsertOutcome::Skipped(err.to_string()),
        },
        WriteOp::UpdateFields { fields, .. } => match store.write_one(collection, op) {
            Ok(WriteAck::Updated | WriteAck::Replaced) => UpsertOutcome::Updated,
            Ok(WriteAck::Inserted) => UpsertOutcome::Inserted,
            Ok(WriteAck::Unmatched) => {
                let insert = WriteOp::ReplaceUpsert {
                    id: op_key(op).clone(),
                    document: fields.clone(),
                };
                match store.write_one(collection, &insert) {
                    Ok(WriteAck::Inserted) => UpsertOutcome::Inserted,
                    Ok(_) => UpsertOutcome::Updated,
                    Err(err) => UpsertOutcome::Skipped(format!("reinsert after unmatched update: {err}")),
                }
            }
            Err(err) => UpsertOutcome::Skipped(err.to_string()),
        },
    }
}

fn retry_as_update(
    store: &mut dyn DocumentStore,
    collection: &str,
    key_field: &str,
    key: &DocKey,
    document: &Document,
) -> UpsertOutcome {
    let update = WriteOp::UpdateFields {
        filter: Filter::field(key_field, key.clone()),
        fields: document.clone(),
    };
    match store.write_one(collection, &update) {
        Ok(WriteAck::Updated | WriteAck::Replaced) => UpsertOutcome::ConflictRetried,
        Ok(WriteAck::Inserted) => UpsertOutcome::Inserted,
        Ok(WriteAck::Unmatched) => UpsertOutcome::Skipped(format!(
            "duplicate key on insert, but no document has {key_field}={}",
            key.to_json()
        )),
        Err(err) => UpsertOutcome::Skipped(format!("conflict retry failed: {err}")),
    }
}

/// Reconcile one array collection.
///
/// Empty and non-array source values return a zero result with a
/// `skipped_reason`.
///
/// # Errors
///
/// Returns an error only if the existing key set cannot be read; every
/// per-record and per-batch failure is folded into the tally.
pub fn reconcile_collection(
    store: &mut dyn DocumentStore,
    spec: &CollectionSpec,
    value: &SourceValue,
    options: &ReconcileOptions,
    log: &mut dyn Logger,
) -> Result<ReconciliationResult, StoreError> {
    let collection = spec.name;
    let items = match value {
        SourceValue::Absent => {
            log.info(&format!("{collection}: nothing to migrate"));
            return Ok(ReconciliationResult::skipped_collection(collection, Shape::Array, "empty"));
        }
        SourceValue::Array(items) if items.is_empty() => {
            log.info(&format!("{collection}: nothing to migrate"));
            return Ok(ReconciliationResult::skipped_collection(collection, Shape::Array, "empty"));
        }
        SourceValue::Array(items) => items,
        SourceValue::Map(_) | SourceValue::Invalid(_) => {
            let reason = format!("source value is {}, not an array", value.describe());
            log.warn(&format!("{collection}: {reason}; skipped"));
            return Ok(ReconciliationResult::skipped_collection(collection, Shape::Array, reason));
        }
    };

    let key_field = spec.key_field;
    let existing = store.key_values(collection, key_field)?;
    log.debug(&format!("{collection}: {} existing keys in target", existing.len()));

    let mut result = ReconciliationResult::new(collection, Shape::Array);
    let ops = plan_operations(collection, key_field, items, &existing, options, log, &mut result);

    let batch_size = options.batch_size.max(1);
    let batch_count = ops.len().div_ceil(batch_size);
    for (index, batch) in ops.chunks(batch_size).enumerate() {
        result.batches += 1;
        match store.bulk_write(collection, batch) {
            Ok(acks) => {
                for (op, ack) in batch.iter().zip(acks) {
                    let outcome = match ack {
                        WriteAck::Inserted => UpsertOutcome::Inserted,
                        WriteAck::Replaced | WriteAck::Updated => UpsertOutcome::Updated,
                        // The document vanished after the key set was read.
                        WriteAck::Unmatched => upsert_one(store, collection, key_field, op),
                    };
                    fold(&mut result, collection, op, &outcome, log);
                }
            }
            Err(err) => {
                result.batch_fallbacks += 1;
                log.warn(&format!(
                    "{collection}: batch {}/{batch_count} failed: {err}; retrying {} operations individually",
                    index + 1,
                    batch.len()
                ));
                for op in batch {
                    let outcome = upsert_one(store, collection, key_field, op);
                    fold(&mut result, collection, op, &outcome, log);
                }
            }
        }
    }

    log.info(&format!(
        "{collection}: {} inserted, {} updated, {} skipped",
        result.inserted, result.updated, result.skipped
    ));
    tracing::info!(
        collection,
        inserted = result.inserted,
        updated = result.updated,
        skipped = result.skipped,
        conflicts_retried = result.conflicts_retried,
        batches = result.batches,
        batch_fallbacks = result.batch_fallbacks,
        "collection reconciled"
    );
    Ok(result)
}

/// Build one write per migratable record, counting the rest as skipped.
fn plan_operations(
    collection: &str,
    key_field: &str,
    items: &[Entity],
    existing: &HashSet<DocKey>,
    options: &ReconcileOptions,
    log: &mut dyn Logger,
    result: &mut ReconciliationResult,
) -> Vec<WriteOp> {
    let mut ops = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let record = match item {
            Entity::Object(record) => record,
            Entity::Malformed(kind) => {
                result.skipped += 1;
                log.warn(&format!("{collection}[{position}]: element is {kind}, not an object; skipped"));
                continue;
            }
        };
        let Some(key) = record.get(key_field).and_then(DocKey::from_value) else {
            result.skipped += 1;
            log.warn(&format!("{collection}[{position}]: no usable {key_field}; skipped"));
            continue;
        };

        let mut payload = record.clone();
        payload.remove(ID_FIELD);
        options.stamp(&mut payload);

        ops.push(if existing.contains(&key) {
            WriteOp::UpdateFields {
                filter: Filter::field(key_field, key),
                fields: payload,
            }
        } else {
            WriteOp::ReplaceUpsert { id: key, document: payload }
        });
    }
    ops
}

fn fold(
    result: &mut ReconciliationResult,
    collection: &str,
    op: &WriteOp,
    outcome: &UpsertOutcome,
    log: &mut dyn Logger,
) {
    match outcome {
        UpsertOutcome::ConflictRetried => log.info(&format!(
            "{collection}: {} already existed under another identity; updated instead",
            op_key(op).to_json()
        )),
        UpsertOutcome::Skipped(reason) => log.warn(&format!(
            "{collection}: record {} not migrated: {reason}",
            op_key(op).to_json()
        )),
        UpsertOutcome::Inserted | UpsertOutcome::Updated => {}
    }
    result.record(outcome);
}
