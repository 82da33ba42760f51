//! Post-migration verification.
//!
//! Two independent passes:
//! - count pass: target count per collection must be at least the source
//!   count; extra target documents are reported, not failed
//! - existence pass: every keyed source record must be found in the target
//!
//! Neither pass writes. A failing pass is a warning for the run, never an
//! error: re-running the migration is always safe.

use crate::catalog::{CollectionSpec, Shape};
use crate::log::Logger;
use crate::report::{CountEntry, CountReport, CountStatus, ExistenceEntry, ExistenceReport};
use crate::source::{Entity, SourceSnapshot, SourceValue};
use crate::store::{DocKey, DocumentStore, Filter};

/// Maximum number of missing keys recorded per collection.
pub const MISSING_SAMPLE_LIMIT: usize = 10;

/// Number of source records for a collection, or `None` when the source
/// value does not have the collection's shape.
fn source_count(spec: &CollectionSpec, value: &SourceValue) -> Option<u64> {
    let len = match (spec.shape, value) {
        (Shape::Array, SourceValue::Array(items)) => items.len(),
        (Shape::Map, SourceValue::Map(map)) => map.len(),
        (_, SourceValue::Absent) => 0,
        _ => return None,
    };
    Some(u64::try_from(len).unwrap_or(u64::MAX))
}

/// Compare source and target counts for every collection.
pub fn count_pass(
    store: &dyn DocumentStore,
    snapshot: &SourceSnapshot,
    specs: &[CollectionSpec],
    log: &mut dyn Logger,
) -> CountReport {
    let mut collections = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = spec.name;
        let value = snapshot.value(name);
        let target = match store.count(name) {
            Ok(count) => Some(count),
            Err(err) => {
                log.warn(&format!("{name}: cannot count target documents: {err}"));
                None
            }
        };

        let (source, status) = match (source_count(spec, value), target) {
            (None, _) => {
                log.info(&format!("{name}: count skipped, source value is {}", value.describe()));
                (0, CountStatus::SkippedShape)
            }
            (Some(source), None) => (source, CountStatus::Unavailable),
            (Some(source), Some(target)) if target == source => (source, CountStatus::Match),
            (Some(source), Some(target)) if target > source => {
                log.info(&format!(
                    "{name}: target has {} more documents than source ({target} vs {source})",
                    target - source
                ));
                (source, CountStatus::Superset)
            }
            (Some(source), Some(target)) => {
                log.warn(&format!(
                    "{name}: target is missing {} documents ({target} vs {source})",
                    source - target
                ));
                (source, CountStatus::Missing)
            }
        };

        collections.push(CountEntry {
            collection: name.to_string(),
            source,
            target: target.unwrap_or(0),
            status,
        });
    }

    let passed = collections.iter().all(|c| c.status.passed());
    log.info(&format!(
        "count check {}",
        if passed { "passed" } else { "found missing documents" }
    ));
    CountReport { passed, collections }
}

/// Keys to look up for a collection: `(filter, rendered key)` per keyed
/// record, plus the number of records that have no usable key.
fn lookups(spec: &CollectionSpec, value: &SourceValue) -> (Vec<(Filter, String)>, u64) {
    let mut keyed = Vec::new();
    let mut unkeyed = 0u64;
    match (spec.shape, value) {
        (Shape::Array, SourceValue::Array(items)) => {
            for item in items {
                let key = match item {
                    Entity::Object(record) => record.get(spec.key_field).and_then(DocKey::from_value),
                    Entity::Malformed(_) => None,
                };
                match key {
                    Some(key) => {
                        let rendered = key.to_json();
                        keyed.push((Filter::field(spec.key_field, key), rendered));
                    }
                    None => unkeyed += 1,
                }
            }
        }
        (Shape::Map, SourceValue::Map(map)) => {
            for key in map.keys() {
                let key = DocKey::String(key.clone());
                let rendered = key.to_json();
                keyed.push((Filter::Id(key), rendered));
            }
        }
        _ => {}
    }
    (keyed, unkeyed)
}

/// Look up every keyed source record in the target.
pub fn existence_pass(
    store: &dyn DocumentStore,
    snapshot: &SourceSnapshot,
    specs: &[CollectionSpec],
    log: &mut dyn Logger,
) -> ExistenceReport {
    let mut collections = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = spec.name;
        let (keyed, unkeyed) = lookups(spec, snapshot.value(name));

        let mut found = 0u64;
        let mut missing_sample = Vec::new();
        let mut lookup_errors = 0usize;
        for (filter, rendered) in &keyed {
            let present = store.exists(name, filter).unwrap_or_else(|err| {
                lookup_errors += 1;
                tracing::debug!(collection = name, %filter, error = %err, "existence lookup failed");
                false
            });
            if present {
                found += 1;
            } else if missing_sample.len() < MISSING_SAMPLE_LIMIT {
                missing_sample.push(rendered.clone());
            }
        }
        if lookup_errors > 0 {
            log.warn(&format!("{name}: {lookup_errors} lookups failed and count as missing"));
        }

        let total = u64::try_from(keyed.len()).unwrap_or(u64::MAX);
        let verified = found == total;
        if verified {
            log.debug(&format!("{name}: {found}/{total} records found"));
        } else {
            log.warn(&format!(
                "{name}: only {found}/{total} records found; missing e.g. {}",
                missing_sample.join(", ")
            ));
        }
        if unkeyed > 0 {
            log.info(&format!("{name}: {unkeyed} source records have no key and were not checked"));
        }

        collections.push(ExistenceEntry {
            collection: name.to_string(),
            found,
            total,
            unkeyed,
            missing_sample,
            verified,
        });
    }

    let passed = collections.iter().all(|c| c.verified);
    log.info(&format!(
        "existence check {}",
        if passed { "passed" } else { "found missing records" }
    ));
    ExistenceReport { passed, collections }
}
