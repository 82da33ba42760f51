//! Source snapshot loading.
//!
//! The snapshot is a single JSON object whose top-level keys name
//! collections. Each value is classified once, at load time, into a
//! [`SourceValue`]; later stages match on that instead of sniffing JSON
//! types again.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::catalog::{self, COLLECTIONS};
use crate::error::MigrateError;
use crate::log::Logger;
use crate::store::Document;

/// One element of an array collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Object(Document),
    /// Element that is not a JSON object; carries its JSON type name.
    Malformed(&'static str),
}

/// Shape of one top-level source value.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceValue {
    Array(Vec<Entity>),
    Map(serde_json::Map<String, Value>),
    /// Neither array nor object; carries the JSON type name.
    Invalid(&'static str),
    /// The snapshot has no key for this collection.
    Absent,
}

static ABSENT: SourceValue = SourceValue::Absent;

impl SourceValue {
    /// Classify a JSON value.
    #[must_use]
    pub fn classify(value: Value) -> Self {
        match value {
            Value::Array(items) => Self::Array(
                items
                    .into_iter()
                    .map(|item| match item {
                        Value::Object(map) => Entity::Object(map),
                        other => Entity::Malformed(json_kind(&other)),
                    })
                    .collect(),
            ),
            Value::Object(map) => Self::Map(map),
            other => Self::Invalid(json_kind(&other)),
        }
    }

    /// Number of records (array elements or map keys); 0 when invalid.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Array(items) => items.len(),
            Self::Map(map) => map.len(),
            Self::Invalid(_) | Self::Absent => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short description for logs: `array`, `map`, `absent` or
    /// `invalid (<kind>)`.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Array(_) => "array".into(),
            Self::Map(_) => "map".into(),
            Self::Invalid(kind) => format!("invalid ({kind})"),
            Self::Absent => "absent".into(),
        }
    }
}

/// JSON type name of a value.
#[must_use]
pub const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parsed source of truth for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSnapshot {
    pub path: PathBuf,
    /// BLAKE3 hex digest of the bytes the snapshot was parsed from.
    pub hash: String,
    pub byte_len: u64,
    values: BTreeMap<String, SourceValue>,
    /// Top-level keys present in the source but not migrated.
    pub ignored_keys: Vec<String>,
}

impl SourceSnapshot {
    /// Parse snapshot bytes. `path` is only used for reporting.
    ///
    /// # Errors
    ///
    /// Returns [`MigrateError::SourceParse`] if the bytes are not JSON or the
    /// top level is not an object.
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self, MigrateError> {
        let parse_error = |reason: String| MigrateError::SourceParse {
            path: path.to_path_buf(),
            reason,
        };

        let root: Value = serde_json::from_slice(bytes).map_err(|err| parse_error(err.to_string()))?;
        let Value::Object(root) = root else {
            return Err(parse_error(format!(
                "top-level value is {}, expected an object",
                json_kind(&root)
            )));
        };

        let mut values = BTreeMap::new();
        let mut ignored_keys = Vec::new();
        for (key, value) in root {
            if catalog::find(&key).is_some() {
                values.insert(key, SourceValue::classify(value));
            } else {
                ignored_keys.push(key);
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            hash: blake3::hash(bytes).to_hex().to_string(),
            byte_len: u64::try_from(bytes.len()).unwrap_or(u64::MAX),
            values,
            ignored_keys,
        })
    }

    /// The value for a collection, or [`SourceValue::Absent`].
    #[must_use]
    pub fn value(&self, name: &str) -> &SourceValue {
        self.values.get(name).unwrap_or(&ABSENT)
    }

    /// Whether the source file mentioned this collection at all.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Read and parse the snapshot at `path`, logging a per-collection summary.
///
/// # Errors
///
/// Returns [`MigrateError::SourceUnreadable`] if the file cannot be read and
/// [`MigrateError::SourceParse`] if it is not a JSON object.
pub fn load(path: &Path, log: &mut dyn Logger) -> Result<SourceSnapshot, MigrateError> {
    let bytes = std::fs::read(path).map_err(|source| MigrateError::SourceUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot = SourceSnapshot::parse(&bytes, path)?;

    log.info(&format!(
        "loaded source {} ({} bytes, blake3 {})",
        path.display(),
        snapshot.byte_len,
        &snapshot.hash[..16]
    ));
    for spec in COLLECTIONS {
        let value = snapshot.value(spec.name);
        let line = match value {
            SourceValue::Array(items) => format!("  {}: {} records", spec.name, items.len()),
            SourceValue::Map(map) => format!("  {}: {} keys", spec.name, map.len()),
            SourceValue::Absent => format!("  {}: absent", spec.name),
            SourceValue::Invalid(_) => format!("  {}: {}", spec.name, value.describe()),
        };
        log.info(&line);
    }
    for key in &snapshot.ignored_keys {
        log.warn(&format!("source key {key} is not a known collection; ignored"));
    }

    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::RunLog;
    use serde_json::json;

    fn parse(value: &serde_json::Value) -> SourceSnapshot {
        SourceSnapshot::parse(value.to_string().as_bytes(), Path::new("db.json"))
            .expect("parse snapshot")
    }

    #[test]
    fn absent_collections_are_distinct_from_empty_arrays() {
        let snapshot = parse(&json!({"bins": [{"id": "B1"}], "alerts": []}));
        assert_eq!(snapshot.value("users"), &SourceValue::Absent);
        assert!(snapshot.value("users").is_empty());
        assert!(!snapshot.contains("users"));
        assert_eq!(snapshot.value("alerts"), &SourceValue::Array(Vec::new()));
        assert_eq!(snapshot.value("bins").len(), 1);
    }

    #[test]
    fn values_are_classified_by_shape() {
        let snapshot = parse(&json!({
            "bins": [{"id": "B1"}, 7],
            "analytics": {"x": 1},
            "alerts": "oops",
        }));

        match snapshot.value("bins") {
            SourceValue::Array(items) => {
                assert!(matches!(items[0], Entity::Object(_)));
                assert_eq!(items[1], Entity::Malformed("number"));
            }
            other => panic!("expected array, got {other:?}"),
        }
        assert!(matches!(snapshot.value("analytics"), SourceValue::Map(_)));
        assert_eq!(snapshot.value("alerts"), &SourceValue::Invalid("string"));
    }

    #[test]
    fn unknown_top_level_keys_are_ignored() {
        let snapshot = parse(&json!({"bins": [], "widgets": [1, 2]}));
        assert_eq!(snapshot.ignored_keys, vec!["widgets".to_string()]);
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let err = SourceSnapshot::parse(b"{ not json", Path::new("db.json"))
            .expect_err("must fail");
        assert!(matches!(err, MigrateError::SourceParse { .. }));
    }

    #[test]
    fn top_level_array_is_a_parse_error() {
        let err = SourceSnapshot::parse(b"[1,2]", Path::new("db.json")).expect_err("must fail");
        assert!(err.to_string().contains("expected an object"));
    }

    #[test]
    fn load_missing_file_is_unreadable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = RunLog::new();
        let err = load(&dir.path().join("missing.json"), &mut log).expect_err("must fail");
        assert!(matches!(err, MigrateError::SourceUnreadable { .. }));
    }

    #[test]
    fn load_logs_summary_per_collection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db.json");
        let raw = r#"{"bins":[{"id":"B1"},{"id":"B2"}],"analytics":{"x":1}}"#;
        std::fs::write(&path, raw).expect("write source");

        let mut log = RunLog::new();
        let snapshot = load(&path, &mut log).expect("load");
        assert_eq!(snapshot.byte_len, raw.len() as u64);
        assert_eq!(snapshot.hash, blake3::hash(raw.as_bytes()).to_hex().to_string());
        assert!(log.contains("bins: 2 records"));
        assert!(log.contains("analytics: 1 keys"));
        assert!(log.contains("users: absent"));
    }
}
