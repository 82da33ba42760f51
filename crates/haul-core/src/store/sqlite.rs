//! SQLite-backed document store.
//!
//! Documents live in one `documents` table keyed by `(collection, doc_id)`,
//! with the JSON body stored as text. Secondary indexes are partial
//! expression indexes over `body -> '$."field"'`, scoped to one collection,
//! and recorded in `collection_indexes` so they can be listed, compared and
//! dropped by name. Text indexes are catalogued only.
//!
//! Runtime defaults:
//! - `journal_mode = WAL` so verification readers do not block the writer
//! - `busy_timeout = 5s` bounds how long a locked database is waited on

use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params, types::Type};

use super::{
    DocKey, Document, DocumentStore, Filter, ID_FIELD, ID_INDEX_NAME, IndexOrder, IndexSpec,
    InsertManyOutcome, StoreError, WriteAck, WriteOp,
};

/// Busy timeout used for store connections.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// Migration v1: documents and store metadata.
const MIGRATION_V1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL CHECK (length(collection) > 0),
    doc_id TEXT NOT NULL,
    body TEXT NOT NULL CHECK (json_valid(body)),
    PRIMARY KEY (collection, doc_id)
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    database_name TEXT NOT NULL DEFAULT ''
);

INSERT OR IGNORE INTO store_meta (id, schema_version, database_name) VALUES (1, 1, '');
"#;

/// Migration v2: named index catalog.
const MIGRATION_V2_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS collection_indexes (
    collection TEXT NOT NULL,
    name TEXT NOT NULL,
    definition TEXT NOT NULL CHECK (json_valid(definition)),
    sqlite_name TEXT,
    created_at_us INTEGER NOT NULL,
    PRIMARY KEY (collection, name)
);
"#;

const MIGRATIONS: &[(u32, &str)] = &[(1, MIGRATION_V1_SQL), (2, MIGRATION_V2_SQL)];

/// Document store over a single SQLite database file.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    database: String,
}

impl SqliteStore {
    /// Open (or create) the store at `path`, apply pragmas and migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created, configured or migrated.
    pub fn open(path: &Path, database: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn, database)
    }

    /// Open a private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot be initialized.
    pub fn open_in_memory(database: &str) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, database)
    }

    fn from_connection(mut conn: Connection, database: &str) -> Result<Self, StoreError> {
        configure_connection(&conn)?;
        migrate(&mut conn)?;
        conn.execute(
            "UPDATE store_meta SET database_name = ?1 WHERE id = 1",
            [database],
        )?;
        Ok(Self {
            conn,
            database: database.to_string(),
        })
    }

    fn catalog_entry(&self, collection: &str, name: &str) -> Result<Option<IndexSpec>, StoreError> {
        let definition: Option<String> = self
            .conn
            .query_row(
                "SELECT definition FROM collection_indexes WHERE collection = ?1 AND name = ?2",
                params![collection, name],
                |row| row.get(0),
            )
            .optional()?;
        definition
            .map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    Ok(())
}

/// Read `PRAGMA user_version` as `u32`.
///
/// # Errors
///
/// Returns an error if the pragma query fails or the value is out of range.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply pending migrations in ascending order. Each migration runs only
/// when its version is above `user_version`, inside its own transaction.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        current = *version;
    }

    Ok(current)
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

fn sql_literal(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "''"))
}

fn quote_ident(raw: &str) -> String {
    format!("\"{}\"", raw.replace('"', "\"\""))
}

/// `body -> '$."field"'`: the JSON text of a top-level field, or NULL.
fn field_expr(field: &str) -> String {
    format!("(body -> {})", sql_literal(&format!("$.\"{field}\"")))
}

fn sqlite_index_name(collection: &str, name: &str) -> String {
    let readable: String = format!("{collection}_{name}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let digest = blake3::hash(format!("{collection}\0{name}").as_bytes());
    format!("hx_{readable}_{}", &digest.to_hex()[..8])
}

fn create_index_sql(sqlite_name: &str, collection: &str, spec: &IndexSpec) -> String {
    let columns = spec
        .keys
        .iter()
        .map(|key| {
            let direction = if key.order == IndexOrder::Desc { "DESC" } else { "ASC" };
            format!("{} {direction}", field_expr(&key.field))
        })
        .collect::<Vec<_>>()
        .join(", ");

    let mut predicate = format!("collection = {}", sql_literal(collection));
    if spec.sparse {
        for key in &spec.keys {
            let _ = write!(predicate, " AND {} IS NOT NULL", field_expr(&key.field));
        }
    }

    format!(
        "CREATE {}INDEX {} ON documents ({columns}) WHERE {predicate}",
        if spec.unique { "UNIQUE " } else { "" },
        quote_ident(sqlite_name),
    )
}

fn classify(err: rusqlite::Error, collection: &str, what: &str) -> StoreError {
    match err {
        rusqlite::Error::SqliteFailure(ref failure, ref message)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StoreError::DuplicateKey {
                collection: collection.to_string(),
                detail: format!(
                    "{what}: {}",
                    message.as_deref().unwrap_or("unique constraint failed")
                ),
            }
        }
        rusqlite::Error::SqliteFailure(ref failure, ref message)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Rejected {
                collection: collection.to_string(),
                reason: format!(
                    "{what}: {}",
                    message.as_deref().unwrap_or("constraint failed")
                ),
            }
        }
        other => StoreError::Sqlite(other),
    }
}

fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn select_one(
    conn: &Connection,
    collection: &str,
    filter: &Filter,
) -> Result<Option<(String, Document)>, StoreError> {
    let row: Option<(String, String)> = match filter {
        Filter::Id(key) => conn
            .query_row(
                "SELECT doc_id, body FROM documents WHERE collection = ?1 AND doc_id = ?2",
                params![collection, key.storage_key()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?,
        Filter::Field { name, value } => {
            let sql = format!(
                "SELECT doc_id, body FROM documents
                 WHERE collection = {} AND {} = ?1
                 ORDER BY rowid LIMIT 1",
                sql_literal(collection),
                field_expr(name)
            );
            conn.query_row(&sql, params![value.to_json()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?
        }
    };

    row.map(|(doc_id, body)| Ok((doc_id, serde_json::from_str::<Document>(&body)?)))
        .transpose()
}

fn apply_op(conn: &Connection, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError> {
    match op {
        WriteOp::ReplaceUpsert { id, document } => {
            let mut doc = document.clone();
            doc.insert(ID_FIELD.to_string(), id.to_value());
            let body = serde_json::to_string(&doc)?;

            let existed: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM documents WHERE collection = ?1 AND doc_id = ?2)",
                params![collection, id.storage_key()],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)
                 ON CONFLICT(collection, doc_id) DO UPDATE SET body = excluded.body",
                params![collection, id.storage_key(), body],
            )
            .map_err(|err| classify(err, collection, &format!("{ID_FIELD}={}", id.to_json())))?;

            Ok(if existed {
                WriteAck::Replaced
            } else {
                WriteAck::Inserted
            })
        }
        WriteOp::UpdateFields { filter, fields } => {
            let Some((doc_id, mut doc)) = select_one(conn, collection, filter)? else {
                return Ok(WriteAck::Unmatched);
            };

            for (name, value) in fields {
                if name != ID_FIELD {
                    doc.insert(name.clone(), value.clone());
                }
            }
            let body = serde_json::to_string(&doc)?;

            conn.execute(
                "UPDATE documents SET body = ?1 WHERE collection = ?2 AND doc_id = ?3",
                params![body, collection, doc_id],
            )
            .map_err(|err| classify(err, collection, &filter.to_string()))?;

            Ok(WriteAck::Updated)
        }
    }
}

// ---------------------------------------------------------------------------
// DocumentStore
// ---------------------------------------------------------------------------

impl DocumentStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn key_values(&self, collection: &str, field: &str) -> Result<HashSet<DocKey>, StoreError> {
        let sql = format!(
            "SELECT {} FROM documents WHERE collection = ?1",
            field_expr(field)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([collection], |row| row.get::<_, Option<String>>(0))?;

        let mut keys = HashSet::new();
        for raw in rows {
            let Some(raw) = raw? else {
                continue;
            };
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            if let Some(key) = DocKey::from_value(&value) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    fn bulk_write(&mut self, collection: &str, ops: &[WriteOp]) -> Result<Vec<WriteAck>, StoreError> {
        let tx = self.conn.transaction()?;
        let mut acks = Vec::with_capacity(ops.len());
        for op in ops {
            acks.push(apply_op(&tx, collection, op)?);
        }
        tx.commit()?;
        Ok(acks)
    }

    fn write_one(&mut self, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError> {
        let tx = self.conn.transaction()?;
        let ack = apply_op(&tx, collection, op)?;
        tx.commit()?;
        Ok(ack)
    }

    fn insert_many(
        &mut self,
        collection: &str,
        docs: &[Document],
    ) -> Result<InsertManyOutcome, StoreError> {
        let tx = self.conn.transaction()?;
        let mut outcome = InsertManyOutcome::default();
        {
            let mut stmt =
                tx.prepare("INSERT INTO documents (collection, doc_id, body) VALUES (?1, ?2, ?3)")?;
            for (position, doc) in docs.iter().enumerate() {
                let Some(id) = doc.get(ID_FIELD).and_then(DocKey::from_value) else {
                    outcome.failures.push((
                        position,
                        StoreError::Rejected {
                            collection: collection.to_string(),
                            reason: "document has no scalar _id".into(),
                        },
                    ));
                    continue;
                };
                let body = serde_json::to_string(doc)?;
                // A failed statement rolls back only itself; the transaction continues.
                match stmt.execute(params![collection, id.storage_key(), body]) {
                    Ok(_) => outcome.inserted += 1,
                    Err(err) => outcome.failures.push((
                        position,
                        classify(err, collection, &format!("{ID_FIELD}={}", id.to_json())),
                    )),
                }
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            [collection],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError> {
        Ok(select_one(&self.conn, collection, filter)?.map(|(_, doc)| doc))
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT definition FROM collection_indexes
             WHERE collection = ?1
             ORDER BY created_at_us, name",
        )?;
        let rows = stmt.query_map([collection], |row| row.get::<_, String>(0))?;

        let mut specs = vec![IndexSpec::identity()];
        for raw in rows {
            specs.push(serde_json::from_str(&raw?)?);
        }
        Ok(specs)
    }

    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> Result<(), StoreError> {
        let existing = if spec.name == ID_INDEX_NAME {
            Some(IndexSpec::identity())
        } else {
            self.catalog_entry(collection, &spec.name)?
        };
        if let Some(existing) = existing {
            if existing.same_definition(spec) {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                name: spec.name.clone(),
            });
        }

        let tx = self.conn.transaction()?;
        let sqlite_name = if spec.is_text() {
            None
        } else {
            let name = sqlite_index_name(collection, &spec.name);
            tx.execute_batch(&create_index_sql(&name, collection, spec))
                .map_err(|err| classify(err, collection, &format!("index {}", spec.name)))?;
            Some(name)
        };
        tx.execute(
            "INSERT INTO collection_indexes (collection, name, definition, sqlite_name, created_at_us)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                collection,
                spec.name,
                serde_json::to_string(spec)?,
                sqlite_name,
                now_us()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn drop_index(&mut self, collection: &str, name: &str) -> Result<(), StoreError> {
        if name == ID_INDEX_NAME {
            return Err(StoreError::Rejected {
                collection: collection.to_string(),
                reason: "the _id_ index cannot be dropped".into(),
            });
        }

        let sqlite_name: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT sqlite_name FROM collection_indexes WHERE collection = ?1 AND name = ?2",
                params![collection, name],
                |row| row.get(0),
            )
            .optional()?;
        let Some(sqlite_name) = sqlite_name else {
            return Err(StoreError::IndexNotFound {
                collection: collection.to_string(),
                name: name.to_string(),
            });
        };

        let tx = self.conn.transaction()?;
        if let Some(sqlite_name) = sqlite_name {
            tx.execute_batch(&format!("DROP INDEX IF EXISTS {}", quote_ident(&sqlite_name)))?;
        }
        tx.execute(
            "DELETE FROM collection_indexes WHERE collection = ?1 AND name = ?2",
            params![collection, name],
        )?;
        tx.commit()?;
        Ok(())
    }
}
