//! Target document store abstraction.
//!
//! The reconciler, index provisioner and verifier talk to the target only
//! through [`DocumentStore`]. Three backends ship with the crate:
//! - [`mongo::MongoStore`]: a MongoDB server over the wire protocol
//! - [`sqlite::SqliteStore`]: a durable document store on top of SQLite
//! - [`memory::MemoryStore`]: an in-process store with fault injection hooks
//!
//! A connection string selects the backend (see [`open_target`]). The
//! returned [`TargetConnection`] is a scoped resource: dropping it releases
//! the underlying connection on every exit path.

pub mod memory;
pub mod mongo;
pub mod sqlite;

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MigrateError;

/// A stored document: field name → JSON value.
pub type Document = serde_json::Map<String, Value>;

/// Store-level identity field.
pub const ID_FIELD: &str = "_id";

/// Name of the implicit identity index every collection carries.
pub const ID_INDEX_NAME: &str = "_id_";

// ---------------------------------------------------------------------------
// DocKey
// ---------------------------------------------------------------------------

/// Normalized identity or key-field value.
///
/// Only scalar JSON values can act as keys. Equality follows the JSON type:
/// the number `1` and the string `"1"` are different keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocKey {
    String(String),
    /// Number in its canonical `serde_json` rendering.
    Number(String),
    Bool(bool),
}

impl DocKey {
    /// Convert a JSON value into a key. Returns `None` for `null`, arrays
    /// and objects.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Number(n) => Some(Self::Number(n.to_string())),
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The JSON value this key was derived from.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Number(n) => n
                .parse::<serde_json::Number>()
                .map_or_else(|_| Value::String(n.clone()), Value::Number),
            Self::Bool(b) => Value::Bool(*b),
        }
    }

    /// Compact JSON text of the key (`"B1"`, `42`, `true`).
    #[must_use]
    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }

    /// Typed text encoding used as a primary-key column value.
    #[must_use]
    pub fn storage_key(&self) -> String {
        match self {
            Self::String(s) => format!("s:{s}"),
            Self::Number(n) => format!("n:{n}"),
            Self::Bool(b) => format!("b:{b}"),
        }
    }

    /// Inverse of [`DocKey::storage_key`].
    #[must_use]
    pub fn from_storage_key(raw: &str) -> Option<Self> {
        let (tag, rest) = raw.split_once(':')?;
        match tag {
            "s" => Some(Self::String(rest.to_string())),
            "n" => Some(Self::Number(rest.to_string())),
            "b" => rest.parse().ok().map(Self::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Selects at most one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `_id == key`
    Id(DocKey),
    /// `<field> == key`
    Field { name: String, value: DocKey },
}

impl Filter {
    #[must_use]
    pub fn field(name: &str, value: DocKey) -> Self {
        Self::Field {
            name: name.to_string(),
            value,
        }
    }

    /// Whether `doc` (stored under `id`) satisfies this filter.
    #[must_use]
    pub fn matches(&self, id: &DocKey, doc: &Document) -> bool {
        match self {
            Self::Id(key) => key == id,
            Self::Field { name, value } => doc
                .get(name)
                .and_then(DocKey::from_value)
                .is_some_and(|found| &found == value),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(key) => write!(f, "{ID_FIELD}={}", key.to_json()),
            Self::Field { name, value } => write!(f, "{name}={}", value.to_json()),
        }
    }
}

/// One write in a bulk batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Set top-level fields on the first document matching `filter`.
    /// `_id` in `fields` is ignored; identities never change.
    UpdateFields { filter: Filter, fields: Document },
    /// Replace the document whose `_id == id`, inserting it when absent.
    /// The stored document always carries `_id = id`.
    ReplaceUpsert { id: DocKey, document: Document },
}

/// Acknowledgement for a single applied write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    /// A new document was created.
    Inserted,
    /// An upsert matched an existing document and replaced it.
    Replaced,
    /// An update matched and modified an existing document.
    Updated,
    /// An update matched no document; nothing was written.
    Unmatched,
}

/// Result of an unordered multi-document insert.
#[derive(Debug, Default)]
pub struct InsertManyOutcome {
    /// Number of documents written.
    pub inserted: usize,
    /// Per-document failures, by position in the input.
    pub failures: Vec<(usize, StoreError)>,
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// Sort direction or kind of one indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexOrder {
    Asc,
    Desc,
    Text,
}

/// One field of an index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub order: IndexOrder,
}

/// Named index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
    /// Skip documents that lack the indexed fields.
    #[serde(default)]
    pub sparse: bool,
}

impl IndexSpec {
    /// Single-field ascending index named `<field>_1`.
    #[must_use]
    pub fn asc(field: &str) -> Self {
        Self::single(field, IndexOrder::Asc, format!("{field}_1"))
    }

    /// Single-field descending index named `<field>_-1`.
    #[must_use]
    pub fn desc(field: &str) -> Self {
        Self::single(field, IndexOrder::Desc, format!("{field}_-1"))
    }

    /// Text index named `<field>_text`.
    #[must_use]
    pub fn text(field: &str) -> Self {
        Self::single(field, IndexOrder::Text, format!("{field}_text"))
    }

    fn single(field: &str, order: IndexOrder, name: String) -> Self {
        Self {
            name,
            keys: vec![IndexKey {
                field: field.to_string(),
                order,
            }],
            unique: false,
            sparse: false,
        }
    }

    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    #[must_use]
    pub const fn sparse(mut self) -> Self {
        self.sparse = true;
        self
    }

    /// Whether two specs describe the same index, ignoring the name.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.keys == other.keys && self.unique == other.unique && self.sparse == other.sparse
    }

    /// Whether this is a full-text index.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|k| k.order == IndexOrder::Text)
    }

    /// The implicit unique identity index.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            name: ID_INDEX_NAME.to_string(),
            keys: vec![IndexKey {
                field: ID_FIELD.to_string(),
                order: IndexOrder::Asc,
            }],
            unique: true,
            sparse: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors reported by a [`DocumentStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint (identity or unique index) rejected the write.
    #[error("duplicate key in {collection}: {detail}")]
    DuplicateKey { collection: String, detail: String },

    /// An index with this name already exists under another definition.
    #[error("index {name} on {collection} already exists with a different definition")]
    IndexConflict { collection: String, name: String },

    /// Dropping an index that does not exist.
    #[error("index {name} not found on {collection}")]
    IndexNotFound { collection: String, name: String },

    /// The store refused the write for a reason other than uniqueness.
    #[error("write rejected in {collection}: {reason}")]
    Rejected { collection: String, reason: String },

    /// The store is not reachable or refused the operation wholesale.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("mongodb error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("bson conversion error: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("document serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this error is a uniqueness conflict.
    #[must_use]
    pub const fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

/// A document database holding named collections.
///
/// Collections exist implicitly; writing to an unknown collection creates it.
pub trait DocumentStore {
    /// Short backend name for reports (`"mongodb"`, `"sqlite"`, `"memory"`).
    fn backend(&self) -> &'static str;

    /// Logical database name.
    fn database(&self) -> &str;

    /// Every distinct scalar value of `field` across the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection cannot be scanned.
    fn key_values(&self, collection: &str, field: &str) -> Result<HashSet<DocKey>, StoreError>;

    /// Apply a batch of writes as one unordered bulk operation.
    ///
    /// On `Ok` the acks are in the same order as `ops`. On `Err` the batch
    /// failed; transactional backends applied none of it, others may have
    /// applied a prefix. Every op is safe to apply again.
    ///
    /// # Errors
    ///
    /// Returns the first error that aborted the batch.
    fn bulk_write(&mut self, collection: &str, ops: &[WriteOp]) -> Result<Vec<WriteAck>, StoreError>;

    /// Apply a single write.
    ///
    /// # Errors
    ///
    /// Returns an error if the write was not applied.
    fn write_one(&mut self, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError>;

    /// Insert documents (each must carry `_id`), continuing past failures.
    ///
    /// # Errors
    ///
    /// Returns an error only when the whole call fails; per-document
    /// failures are reported in [`InsertManyOutcome::failures`].
    fn insert_many(
        &mut self,
        collection: &str,
        docs: &[Document],
    ) -> Result<InsertManyOutcome, StoreError>;

    /// Number of documents in the collection.
    ///
    /// # Errors
    ///
    /// Returns an error if the count query fails.
    fn count(&self, collection: &str) -> Result<u64, StoreError>;

    /// First document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError>;

    /// Whether any document matches `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn exists(&self, collection: &str, filter: &Filter) -> Result<bool, StoreError> {
        Ok(self.find_one(collection, filter)?.is_some())
    }

    /// Indexes on the collection, starting with the implicit `_id_`.
    ///
    /// # Errors
    ///
    /// Returns an error if the index catalog cannot be read.
    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError>;

    /// Create an index. Creating an identical index again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexConflict`] if the name is taken by a
    /// different definition, [`StoreError::DuplicateKey`] if existing data
    /// violates a unique definition.
    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> Result<(), StoreError>;

    /// Drop an index by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IndexNotFound`] if no such index exists.
    fn drop_index(&mut self, collection: &str, name: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Scoped handle to an open target store.
///
/// Dropping the handle releases the underlying connection.
pub struct TargetConnection {
    store: Box<dyn DocumentStore>,
    uri: String,
}

impl TargetConnection {
    /// Wrap an already-open store.
    #[must_use]
    pub fn new(store: Box<dyn DocumentStore>, uri: impl Into<String>) -> Self {
        Self {
            store,
            uri: uri.into(),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl Deref for TargetConnection {
    type Target = dyn DocumentStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

impl DerefMut for TargetConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.store.as_mut()
    }
}

impl Drop for TargetConnection {
    fn drop(&mut self) {
        tracing::info!(
            uri = %self.uri,
            backend = self.store.backend(),
            database = self.store.database(),
            "closed target connection"
        );
    }
}

impl fmt::Debug for TargetConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetConnection")
            .field("uri", &self.uri)
            .field("backend", &self.store.backend())
            .field("database", &self.store.database())
            .finish()
    }
}

/// Longest database name MongoDB accepts, in bytes.
pub const MAX_DATABASE_NAME_LEN: usize = 63;

const FORBIDDEN_DATABASE_CHARS: &[char] = &[
    '/', '\\', '.', ' ', '"', '$', '*', '<', '>', ':', '|', '?', '\0',
];

/// Check a target database name against MongoDB's naming rules.
///
/// The same rules keep the SQLite backend's `<database>.sqlite3` inside its
/// directory.
///
/// # Errors
///
/// Returns a description of the first rule the name breaks.
pub fn validate_database_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("database name is empty".into());
    }
    if name.len() > MAX_DATABASE_NAME_LEN {
        return Err(format!(
            "database name is {} bytes; at most {MAX_DATABASE_NAME_LEN} allowed",
            name.len()
        ));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_DATABASE_CHARS.contains(c)) {
        return Err(format!("database name {name:?} contains forbidden character {c:?}"));
    }
    Ok(())
}

/// Open the target store named by `uri`.
///
/// Supported connection strings:
/// - `mongodb://...` and `mongodb+srv://...`: a MongoDB server; the server
///   is pinged before this returns
/// - `sqlite://<dir>`: `<dir>/<database>.sqlite3`; relative `<dir>` resolves
///   against `root`
/// - `memory://`: ephemeral in-process store
///
/// # Errors
///
/// Returns [`MigrateError::InvalidConfig`] for a database name MongoDB
/// would refuse, and [`MigrateError::TargetUnreachable`] for unknown
/// schemes or when the store cannot be opened.
pub fn open_target(uri: &str, database: &str, root: &Path) -> Result<TargetConnection, MigrateError> {
    let fail = |reason: String| MigrateError::TargetUnreachable {
        uri: uri.to_string(),
        reason,
    };

    validate_database_name(database)
        .map_err(|reason| MigrateError::InvalidConfig(format!("target.database: {reason}")))?;

    if uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://") {
        let store = mongo::MongoStore::connect(uri, database).map_err(|err| fail(err.to_string()))?;
        tracing::info!(database, "connected to mongodb target");
        return Ok(TargetConnection::new(Box::new(store), uri));
    }

    if let Some(rest) = uri.strip_prefix("sqlite://") {
        let dir = if rest.is_empty() { Path::new(".") } else { Path::new(rest) };
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            root.join(dir)
        };
        let path = dir.join(format!("{database}.sqlite3"));
        let store = sqlite::SqliteStore::open(&path, database)
            .map_err(|err| fail(err.to_string()))?;
        tracing::info!(path = %path.display(), database, "connected to sqlite target");
        return Ok(TargetConnection::new(Box::new(store), uri));
    }

    if uri == "memory://" || uri == "memory:" {
        tracing::info!(database, "connected to in-memory target");
        return Ok(TargetConnection::new(
            Box::new(memory::MemoryStore::new(database)),
            uri,
        ));
    }

    Err(fail(
        "unsupported scheme; expected mongodb://, mongodb+srv://, sqlite://<dir> or memory://"
            .into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn doc_key_distinguishes_json_types() {
        let s = DocKey::from_value(&json!("1")).expect("string key");
        let n = DocKey::from_value(&json!(1)).expect("number key");
        assert_ne!(s, n);
        assert_eq!(s.storage_key(), "s:1");
        assert_eq!(n.storage_key(), "n:1");
    }

    #[test]
    fn doc_key_rejects_non_scalars() {
        assert!(DocKey::from_value(&json!(null)).is_none());
        assert!(DocKey::from_value(&json!([1])).is_none());
        assert!(DocKey::from_value(&json!({"a": 1})).is_none());
    }

    #[test]
    fn storage_key_roundtrips_through_colons() {
        let key = DocKey::String("urn:bin:7".into());
        assert_eq!(DocKey::from_storage_key(&key.storage_key()), Some(key));
        assert_eq!(DocKey::from_storage_key("x:1"), None);
    }

    #[test]
    fn number_key_restores_json_number() {
        let key = DocKey::from_value(&json!(12.5)).expect("number key");
        assert_eq!(key.to_value(), json!(12.5));
        assert_eq!(key.to_json(), "12.5");
    }

    #[test]
    fn field_filter_matches_on_typed_value() {
        let mut doc = Document::new();
        doc.insert("id".into(), json!("B1"));
        let id = DocKey::String("B1".into());

        assert!(Filter::field("id", DocKey::String("B1".into())).matches(&id, &doc));
        assert!(!Filter::field("id", DocKey::Number("1".into())).matches(&id, &doc));
        assert!(Filter::Id(id.clone()).matches(&id, &doc));
    }

    #[test]
    fn index_spec_helpers_follow_naming_convention() {
        assert_eq!(IndexSpec::asc("binId").name, "binId_1");
        assert_eq!(IndexSpec::desc("timestamp").name, "timestamp_-1");
        assert_eq!(IndexSpec::text("description").name, "description_text");
        assert!(IndexSpec::text("description").is_text());

        let a = IndexSpec::asc("email").unique();
        let b = IndexSpec::asc("email");
        assert!(!a.same_definition(&b));
        assert!(a.same_definition(&IndexSpec::asc("email").unique()));
    }

    #[test]
    fn open_target_rejects_unknown_scheme() {
        let err = open_target("postgres://localhost", "waste_management", Path::new("."))
            .expect_err("unknown scheme must fail");
        assert!(matches!(err, MigrateError::TargetUnreachable { .. }));
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn open_target_dispatches_mongodb_scheme_to_the_driver() {
        let uri = "mongodb://127.0.0.1:1/?serverSelectionTimeoutMS=200&connectTimeoutMS=200";
        let err = open_target(uri, "waste_management", Path::new("."))
            .expect_err("nothing listens on port 1");

        let MigrateError::TargetUnreachable { uri: failed, reason } = &err else {
            panic!("expected TargetUnreachable, got {err:?}");
        };
        assert_eq!(failed, uri);
        assert!(!reason.contains("unsupported scheme"), "{reason}");
    }

    #[test]
    fn database_names_follow_mongodb_rules() {
        assert!(validate_database_name("waste_management").is_ok());
        assert!(validate_database_name("fleet-2024").is_ok());
        for bad in ["", "../x", "a/b", "a\\b", "a.b", "a b", "$db", "a\0b"] {
            assert!(validate_database_name(bad).is_err(), "{bad:?} should be rejected");
        }
        assert!(validate_database_name(&"d".repeat(64)).is_err());
        assert!(validate_database_name(&"d".repeat(63)).is_ok());
    }

    #[test]
    fn open_target_refuses_database_names_that_escape_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("project");

        let err = open_target("sqlite://data", "../../escaped", &root)
            .expect_err("path traversal must fail");

        assert!(matches!(err, MigrateError::InvalidConfig(_)));
        assert!(!dir.path().join("escaped.sqlite3").exists());
        assert!(!root.exists());
    }

    #[test]
    fn open_target_memory_uses_database_name() {
        let conn = open_target("memory://", "fleet", Path::new(".")).expect("open memory");
        assert_eq!(conn.backend(), "memory");
        assert_eq!(conn.database(), "fleet");
    }

    #[test]
    fn open_target_sqlite_creates_database_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conn = open_target("sqlite://data", "waste_management", dir.path())
            .expect("open sqlite");
        assert_eq!(conn.backend(), "sqlite");
        assert!(dir.path().join("data/waste_management.sqlite3").exists());
    }
}
