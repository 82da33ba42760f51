//! Key-value map reconciler.
//!
//! Each `(key, value)` pair of a source map becomes one record
//! `{ _id: key, key, value, migratedAt, migrationVersion }`. Records are
//! bulk-inserted; keys that already exist are replaced one by one.

use serde_json::Value;

use crate::catalog::{CollectionSpec, MAP_KEY_FIELD, Shape};
use crate::log::Logger;
use crate::reconcile::{ReconcileOptions, UpsertOutcome, upsert_one};
use crate::report::ReconciliationResult;
use crate::source::SourceValue;
use crate::store::{DocKey, Document, DocumentStore, ID_FIELD, WriteOp};

/// Build the stored form of one map entry.
#[must_use]
pub fn key_value_record(key: &str, value: &Value, options: &ReconcileOptions) -> Document {
    let mut doc = Document::new();
    doc.insert(ID_FIELD.into(), Value::String(key.to_string()));
    doc.insert(MAP_KEY_FIELD.into(), Value::String(key.to_string()));
    doc.insert("value".into(), value.clone());
    options.stamp(&mut doc);
    doc
}

/// Reconcile one key-value map collection.
///
/// Arrays of any length, scalars, empty maps and absent keys return a zero
/// result with a `skipped_reason`.
pub fn reconcile_object_map(
    store: &mut dyn DocumentStore,
    spec: &CollectionSpec,
    value: &SourceValue,
    options: &ReconcileOptions,
    log: &mut dyn Logger,
) -> ReconciliationResult {
    let collection = spec.name;
    let map = match value {
        SourceValue::Absent => {
            log.info(&format!("{collection}: nothing to migrate"));
            return ReconciliationResult::skipped_collection(collection, Shape::Map, "empty");
        }
        SourceValue::Map(map) if map.is_empty() => {
            log.info(&format!("{collection}: nothing to migrate"));
            return ReconciliationResult::skipped_collection(collection, Shape::Map, "empty");
        }
        SourceValue::Map(map) => map,
        SourceValue::Array(_) | SourceValue::Invalid(_) => {
            let reason = format!("source value is {}, not an object map", value.describe());
            log.warn(&format!("{collection}: {reason}; skipped"));
            return ReconciliationResult::skipped_collection(collection, Shape::Map, reason);
        }
    };

    let records: Vec<Document> = map
        .iter()
        .map(|(key, value)| key_value_record(key, value, options))
        .collect();

    let mut result = ReconciliationResult::new(collection, Shape::Map);
    let mut duplicates = 0usize;
    for batch in records.chunks(options.batch_size.max(1)) {
        result.batches += 1;
        match store.insert_many(collection, batch) {
            Ok(outcome) => {
                result.inserted += outcome.inserted;
                for (position, err) in outcome.failures {
                    let Some(record) = batch.get(position) else {
                        continue;
                    };
                    if err.is_duplicate_key() {
                        duplicates += 1;
                        replace_one(store, collection, record, log, &mut result);
                    } else {
                        result.skipped += 1;
                        log.warn(&format!(
                            "{collection}: key {} not migrated: {err}",
                            record_key(record)
                        ));
                    }
                }
            }
            Err(err) => {
                result.batch_fallbacks += 1;
                log.warn(&format!(
                    "{collection}: bulk insert failed: {err}; writing {} keys individually",
                    batch.len()
                ));
                for record in batch {
                    replace_one(store, collection, record, log, &mut result);
                }
            }
        }
    }

    if duplicates > 0 {
        log.info(&format!("{collection}: {duplicates} keys already present; replaced"));
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
        "object map reconciled"
    );
    result
}

fn record_key(record: &Document) -> String {
    record
        .get(MAP_KEY_FIELD)
        .map_or_else(|| "?".to_string(), Value::to_string)
}

fn replace_one(
    store: &mut dyn DocumentStore,
    collection: &str,
    record: &Document,
    log: &mut dyn Logger,
    result: &mut ReconciliationResult,
) {
    let Some(id) = record.get(ID_FIELD).and_then(DocKey::from_value) else {
        result.skipped += 1;
        return;
    };
    let op = WriteOp::ReplaceUpsert {
        id,
        document: record.clone(),
    };
    let outcome = upsert_one(store, collection, MAP_KEY_FIELD, &op);
    if let UpsertOutcome::Skipped(reason) = &outcome {
        log.warn(&format!(
            "{collection}: key {} not migrated: {reason}",
            record_key(record)
        ));
    }
    result.record(&outcome);
}
