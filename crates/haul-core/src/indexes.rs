//! Index provisioning.
//!
//! Brings each collection's indexes to the canonical set from the catalog.
//! Every failure here is a warning: indexes speed up queries and back the
//! uniqueness of key fields, but the reconciler converges without them.

use std::collections::HashSet;

use crate::catalog::CollectionSpec;
use crate::log::Logger;
use crate::report::{IndexFailure, IndexProvisionSummary};
use crate::store::{DocumentStore, ID_INDEX_NAME, IndexSpec, StoreError};

/// Provision canonical indexes for every collection in `specs`.
pub fn provision_indexes(
    store: &mut dyn DocumentStore,
    specs: &[CollectionSpec],
    log: &mut dyn Logger,
) -> IndexProvisionSummary {
    let mut summary = IndexProvisionSummary::default();
    for spec in specs {
        provision_collection(store, spec, log, &mut summary);
    }

    log.info(&format!(
        "indexes: {} created, {} recreated, {} stale dropped, {} unchanged, {} failed",
        summary.created, summary.recreated, summary.dropped_stale, summary.unchanged, summary.failed
    ));
    tracing::info!(
        created = summary.created,
        recreated = summary.recreated,
        dropped_stale = summary.dropped_stale,
        unchanged = summary.unchanged,
        failed = summary.failed,
        "index provisioning complete"
    );
    summary
}

/// Provision one collection, folding what happened into `summary`.
pub fn provision_collection(
    store: &mut dyn DocumentStore,
    spec: &CollectionSpec,
    log: &mut dyn Logger,
    summary: &mut IndexProvisionSummary,
) {
    let collection = spec.name;
    let canonical = spec.canonical_indexes();

    let existing = match store.list_indexes(collection) {
        Ok(existing) => existing,
        Err(err) => {
            log.warn(&format!("{collection}: cannot list indexes: {err}; skipping index setup"));
            record_failure(summary, log, collection, "*", false, &err);
            return;
        }
    };

    // Unique indexes from an older schema can reject legitimate upserts.
    let canonical_names: HashSet<&str> = canonical.iter().map(|i| i.name.as_str()).collect();
    for stale in existing
        .iter()
        .filter(|i| i.unique && i.name != ID_INDEX_NAME && !canonical_names.contains(i.name.as_str()))
    {
        match store.drop_index(collection, &stale.name) {
            Ok(()) => {
                summary.dropped_stale += 1;
                log.warn(&format!(
                    "{collection}: dropped stale unique index {}",
                    stale.name
                ));
            }
            Err(err) => record_failure(summary, log, collection, &stale.name, true, &err),
        }
    }

    for wanted in &canonical {
        match existing.iter().find(|i| i.name == wanted.name) {
            None => match store.create_index(collection, wanted) {
                Ok(()) => {
                    summary.created += 1;
                    log.debug(&format!("{collection}: created index {}", wanted.name));
                }
                Err(err) => record_failure(summary, log, collection, &wanted.name, wanted.unique, &err),
            },
            Some(current) if current.same_definition(wanted) => summary.unchanged += 1,
            Some(current) => {
                log.info(&format!(
                    "{collection}: index {} has an outdated definition; recreating",
                    current.name
                ));
                match recreate(store, collection, wanted) {
                    Ok(()) => summary.recreated += 1,
                    Err(err) => {
                        record_failure(summary, log, collection, &wanted.name, wanted.unique, &err);
                    }
                }
            }
        }
    }
}

fn recreate(store: &mut dyn DocumentStore, collection: &str, spec: &IndexSpec) -> Result<(), StoreError> {
    match store.drop_index(collection, &spec.name) {
        Ok(()) | Err(StoreError::IndexNotFound { .. }) => {}
        Err(err) => return Err(err),
    }
    store.create_index(collection, spec)
}

fn record_failure(
    summary: &mut IndexProvisionSummary,
    log: &mut dyn Logger,
    collection: &str,
    index: &str,
    unique: bool,
    err: &StoreError,
) {
    summary.failed += 1;
    summary.failures.push(IndexFailure {
        collection: collection.to_string(),
        index: index.to_string(),
        unique,
        reason: err.to_string(),
    });
    log.warn(&format!("{collection}: index {index} failed: {err}"));
    if unique {
        log.warn(&format!(
            "{collection}: unique index {index} is missing; duplicate keys are no longer rejected by the store and idempotence is weakened"
        ));
    }
}
