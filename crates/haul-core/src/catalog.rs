//! Fixed registry of migrated collections.
//!
//! Order matters: collections are migrated, counted and verified in
//! [`COLLECTIONS`] order, array collections first, then key-value maps.

use serde::Serialize;

use crate::store::IndexSpec;

/// Source shape a collection is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// Array of entity objects, reconciled by key field.
    Array,
    /// Object of key → value, reconciled as key-value records.
    Map,
}

impl Shape {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Map => "map",
        }
    }
}

/// Static description of one migrated collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Top-level key in the source and collection name in the target.
    pub name: &'static str,
    pub shape: Shape,
    /// Field whose value identifies a record (`key` for maps).
    pub key_field: &'static str,
    /// Whether the key field carries a unique index.
    pub unique_key: bool,
}

const fn array(name: &'static str, key_field: &'static str, unique_key: bool) -> CollectionSpec {
    CollectionSpec {
        name,
        shape: Shape::Array,
        key_field,
        unique_key,
    }
}

const fn map(name: &'static str) -> CollectionSpec {
    CollectionSpec {
        name,
        shape: Shape::Map,
        key_field: MAP_KEY_FIELD,
        unique_key: true,
    }
}

/// Explicit key field stored on key-value records.
pub const MAP_KEY_FIELD: &str = "key";

/// Collection holding one metadata record per run.
pub const METADATA_COLLECTION: &str = "_migration_metadata";

/// Every migrated collection, in migration order.
pub const COLLECTIONS: &[CollectionSpec] = &[
    array("users", "id", true),
    array("bins", "id", true),
    array("routes", "id", true),
    array("collections", "id", true),
    array("complaints", "id", true),
    array("alerts", "id", true),
    array("sensors", "imei", true),
    array("systemLogs", "id", false),
    array("pendingRegistrations", "id", false),
    map("driverLocations"),
    map("analytics"),
];

/// Look up a collection by name.
#[must_use]
pub fn find(name: &str) -> Option<&'static CollectionSpec> {
    COLLECTIONS.iter().find(|spec| spec.name == name)
}

impl CollectionSpec {
    /// Canonical index set for this collection.
    ///
    /// The key-field index comes first; it is unique unless the collection
    /// does not enforce uniqueness.
    #[must_use]
    pub fn canonical_indexes(&self) -> Vec<IndexSpec> {
        let key_index = if self.unique_key {
            IndexSpec::asc(self.key_field).unique()
        } else {
            IndexSpec::asc(self.key_field)
        };

        let mut indexes = vec![key_index];
        indexes.extend(match self.name {
            "users" => vec![IndexSpec::asc("email").unique().sparse(), IndexSpec::asc("role")],
            "bins" => vec![IndexSpec::asc("status"), IndexSpec::asc("type")],
            "routes" => vec![IndexSpec::asc("driverId"), IndexSpec::asc("status")],
            "collections" => vec![
                IndexSpec::asc("binId"),
                IndexSpec::asc("driverId"),
                IndexSpec::desc("timestamp"),
            ],
            "complaints" => vec![IndexSpec::asc("status"), IndexSpec::text("description")],
            "alerts" => vec![IndexSpec::asc("type"), IndexSpec::asc("status")],
            "sensors" => vec![IndexSpec::asc("binId")],
            "systemLogs" => vec![IndexSpec::desc("timestamp")],
            "pendingRegistrations" => vec![IndexSpec::asc("email")],
            _ => Vec::new(),
        });
        indexes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn arrays_precede_maps() {
        let first_map = COLLECTIONS
            .iter()
            .position(|c| c.shape == Shape::Map)
            .expect("catalog has maps");
        assert!(COLLECTIONS[first_map..].iter().all(|c| c.shape == Shape::Map));
    }

    #[test]
    fn key_fields_match_identity_table() {
        let expected = [
            ("users", "id", true),
            ("bins", "id", true),
            ("routes", "id", true),
            ("collections", "id", true),
            ("complaints", "id", true),
            ("alerts", "id", true),
            ("sensors", "imei", true),
            ("systemLogs", "id", false),
            ("pendingRegistrations", "id", false),
        ];
        for (name, field, unique) in expected {
            let spec = find(name).expect("collection registered");
            assert_eq!(spec.key_field, field, "{name}");
            assert_eq!(spec.unique_key, unique, "{name}");
        }
    }

    #[test]
    fn canonical_index_names_are_unique_per_collection() {
        for spec in COLLECTIONS {
            let mut seen = HashSet::new();
            for index in spec.canonical_indexes() {
                assert!(seen.insert(index.name.clone()), "{} repeats {}", spec.name, index.name);
            }
        }
    }

    #[test]
    fn sensors_key_index_is_unique_on_imei() {
        let indexes = find("sensors").expect("sensors").canonical_indexes();
        assert_eq!(indexes[0].name, "imei_1");
        assert!(indexes[0].unique);
    }

    #[test]
    fn logs_key_index_is_not_unique() {
        let indexes = find("systemLogs").expect("systemLogs").canonical_indexes();
        assert_eq!(indexes[0].name, "id_1");
        assert!(!indexes[0].unique);
    }
}
