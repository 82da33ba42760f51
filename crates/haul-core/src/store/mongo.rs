//! MongoDB-backed document store.
//!
//! Speaks the MongoDB wire protocol through the driver's blocking `sync`
//! API. Documents are converted between `serde_json` and BSON at this
//! boundary; numbers come back as relaxed extended JSON, so keys keep their
//! JSON type across a round trip.
//!
//! MongoDB has no multi-statement transaction outside a replica set, so
//! [`DocumentStore::bulk_write`] applies ops one at a time and stops at the
//! first failure. Every op is an idempotent upsert or field update, which
//! makes replaying a partly applied batch safe.

use std::collections::HashSet;

use mongodb::IndexModel;
use mongodb::bson::{self, Bson, Document as BsonDocument};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{FindOptions, IndexOptions, InsertManyOptions, ReplaceOptions};
use mongodb::sync::{Client, Collection, Database};
use serde_json::Value;

use super::{
    DocKey, Document, DocumentStore, Filter, ID_FIELD, ID_INDEX_NAME, IndexKey, IndexOrder,
    IndexSpec, InsertManyOutcome, StoreError, WriteAck, WriteOp,
};

/// Connect and server-selection timeout applied unless the connection
/// string sets its own.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

const TIMEOUT_OPTIONS: [&str; 2] = ["connectTimeoutMS", "serverSelectionTimeoutMS"];

/// Server error codes the store reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerFailure {
    DuplicateKey,
    IndexConflict,
    IndexNotFound,
    NamespaceNotFound,
    Other,
}

impl ServerFailure {
    const fn from_code(code: i32) -> Self {
        match code {
            11000 | 11001 => Self::DuplicateKey,
            85 | 86 => Self::IndexConflict,
            27 => Self::IndexNotFound,
            26 => Self::NamespaceNotFound,
            _ => Self::Other,
        }
    }

    fn of(err: &MongoError) -> Self {
        server_code(err).map_or(Self::Other, Self::from_code)
    }
}

fn server_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .and_then(|errors| errors.first())
            .map(|e| e.code),
        _ => None,
    }
}

fn classify(err: MongoError, collection: &str, what: &str) -> StoreError {
    match ServerFailure::of(&err) {
        ServerFailure::DuplicateKey => StoreError::DuplicateKey {
            collection: collection.to_string(),
            detail: format!("{what}: {err}"),
        },
        _ => match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Mongo(err),
        },
    }
}

/// Append the default timeouts to `uri` for any the caller left unset.
#[must_use]
pub fn with_default_timeouts(uri: &str) -> String {
    let lower = uri.to_ascii_lowercase();
    let missing: Vec<String> = TIMEOUT_OPTIONS
        .iter()
        .filter(|name| !lower.contains(&format!("{}=", name.to_ascii_lowercase())))
        .map(|name| format!("{name}={DEFAULT_TIMEOUT_MS}"))
        .collect();
    if missing.is_empty() {
        return uri.to_string();
    }

    let mut out = uri.to_string();
    if uri.contains('?') {
        if !uri.ends_with('?') && !uri.ends_with('&') {
            out.push('&');
        }
    } else {
        let after_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
        if !after_scheme.contains('/') {
            out.push('/');
        }
        out.push('?');
    }
    out.push_str(&missing.join("&"));
    out
}

// ---------------------------------------------------------------------------
// JSON <-> BSON
// ---------------------------------------------------------------------------

fn to_bson_document(doc: &Document) -> Result<BsonDocument, StoreError> {
    Ok(bson::to_document(doc)?)
}

fn from_bson_document(doc: BsonDocument) -> Document {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn key_to_bson(key: &DocKey) -> Result<Bson, StoreError> {
    Ok(bson::to_bson(&key.to_value())?)
}

fn filter_document(filter: &Filter) -> Result<BsonDocument, StoreError> {
    let mut query = BsonDocument::new();
    match filter {
        Filter::Id(key) => {
            query.insert(ID_FIELD, key_to_bson(key)?);
        }
        Filter::Field { name, value } => {
            query.insert(name.clone(), key_to_bson(value)?);
        }
    }
    Ok(query)
}

// ---------------------------------------------------------------------------
// Index models
// ---------------------------------------------------------------------------

fn index_model(spec: &IndexSpec) -> IndexModel {
    let mut keys = BsonDocument::new();
    for key in &spec.keys {
        let direction = match key.order {
            IndexOrder::Asc => Bson::Int32(1),
            IndexOrder::Desc => Bson::Int32(-1),
            IndexOrder::Text => Bson::String("text".into()),
        };
        keys.insert(key.field.clone(), direction);
    }
    let options = IndexOptions::builder()
        .name(spec.name.clone())
        .unique(spec.unique.then_some(true))
        .sparse(spec.sparse.then_some(true))
        .build();
    IndexModel::builder().keys(keys).options(options).build()
}

fn direction(value: &Bson) -> IndexOrder {
    let sign = match value {
        Bson::Int32(n) => f64::from(*n),
        Bson::Int64(n) => i32::try_from(*n).map_or(1.0, f64::from),
        Bson::Double(n) => *n,
        Bson::String(kind) if kind == "text" => return IndexOrder::Text,
        _ => 1.0,
    };
    if sign < 0.0 { IndexOrder::Desc } else { IndexOrder::Asc }
}

/// Map a server index description back to an [`IndexSpec`].
///
/// Text indexes are stored as `{_fts: "text", _ftsx: 1}` with the indexed
/// fields under `weights`.
fn index_spec(model: &IndexModel) -> IndexSpec {
    let options = model.options.as_ref();
    let name = options.and_then(|o| o.name.clone()).unwrap_or_default();
    if name == ID_INDEX_NAME {
        return IndexSpec::identity();
    }

    let mut keys = Vec::new();
    for (field, value) in &model.keys {
        match field.as_str() {
            "_fts" => {
                let weights = options.and_then(|o| o.weights.as_ref());
                for text_field in weights.into_iter().flat_map(BsonDocument::keys) {
                    keys.push(IndexKey {
                        field: text_field.clone(),
                        order: IndexOrder::Text,
                    });
                }
            }
            "_ftsx" => {}
            _ => keys.push(IndexKey {
                field: field.clone(),
                order: direction(value),
            }),
        }
    }

    IndexSpec {
        name,
        keys,
        unique: options.and_then(|o| o.unique).unwrap_or(false),
        sparse: options.and_then(|o| o.sparse).unwrap_or(false),
    }
}

// ---------------------------------------------------------------------------
// MongoStore
// ---------------------------------------------------------------------------

pub struct MongoStore {
    db: Database,
    database: String,
}

impl MongoStore {
    /// Connect to the server named by `uri` and ping it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Mongo`] for a malformed connection string and
    /// [`StoreError::Unavailable`] when no server answers within the
    /// selection timeout.
    pub fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(with_default_timeouts(uri))?;
        let db = client.database(database);

        let mut ping = BsonDocument::new();
        ping.insert("ping", 1);
        db.run_command(ping, None)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;

        Ok(Self {
            db,
            database: database.to_string(),
        })
    }

    fn collection(&self, name: &str) -> Collection<BsonDocument> {
        self.db.collection::<BsonDocument>(name)
    }

    fn apply(&self, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError> {
        let coll = self.collection(collection);
        match op {
            WriteOp::ReplaceUpsert { id, document } => {
                let id_value = key_to_bson(id)?;
                let mut replacement = to_bson_document(document)?;
                replacement.insert(ID_FIELD, id_value.clone());
                let mut query = BsonDocument::new();
                query.insert(ID_FIELD, id_value);

                let options = ReplaceOptions::builder().upsert(true).build();
                let result = coll
                    .replace_one(query, &replacement, options)
                    .map_err(|err| classify(err, collection, &format!("{ID_FIELD}={}", id.to_json())))?;
                Ok(if result.upserted_id.is_some() {
                    WriteAck::Inserted
                } else {
                    WriteAck::Replaced
                })
            }
            WriteOp::UpdateFields { filter, fields } => {
                let query = filter_document(filter)?;
                let mut set = BsonDocument::new();
                for (name, value) in fields {
                    if name != ID_FIELD {
                        set.insert(name.clone(), bson::to_bson(value)?);
                    }
                }
                if set.is_empty() {
                    let found = coll
                        .find_one(query, None)
                        .map_err(|err| classify(err, collection, &filter.to_string()))?;
                    return Ok(if found.is_some() {
                        WriteAck::Updated
                    } else {
                        WriteAck::Unmatched
                    });
                }

                let mut update = BsonDocument::new();
                update.insert("$set", set);
                let result = coll
                    .update_one(query, update, None)
                    .map_err(|err| classify(err, collection, &filter.to_string()))?;
                Ok(if result.matched_count == 0 {
                    WriteAck::Unmatched
                } else {
                    WriteAck::Updated
                })
            }
        }
    }
}

impl DocumentStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn key_values(&self, collection: &str, field: &str) -> Result<HashSet<DocKey>, StoreError> {
        let mut projection = BsonDocument::new();
        projection.insert(field, 1);
        let options = FindOptions::builder().projection(projection).build();
        let cursor = self
            .collection(collection)
            .find(BsonDocument::new(), options)
            .map_err(|err| classify(err, collection, "key scan"))?;

        let mut keys = HashSet::new();
        for doc in cursor {
            let doc = from_bson_document(doc.map_err(|err| classify(err, collection, "key scan"))?);
            if let Some(key) = doc.get(field).and_then(DocKey::from_value) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    fn bulk_write(&mut self, collection: &str, ops: &[WriteOp]) -> Result<Vec<WriteAck>, StoreError> {
        ops.iter().map(|op| self.apply(collection, op)).collect()
    }

    fn write_one(&mut self, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError> {
        self.apply(collection, op)
    }

    fn insert_many(
        &mut self,
        collection: &str,
        docs: &[Document],
    ) -> Result<InsertManyOutcome, StoreError> {
        let mut outcome = InsertManyOutcome::default();
        let mut positions = Vec::with_capacity(docs.len());
        let mut batch = Vec::with_capacity(docs.len());
        for (position, doc) in docs.iter().enumerate() {
            if doc.get(ID_FIELD).and_then(DocKey::from_value).is_none() {
                outcome.failures.push((
                    position,
                    StoreError::Rejected {
                        collection: collection.to_string(),
                        reason: "document has no scalar _id".into(),
                    },
                ));
                continue;
            }
            match to_bson_document(doc) {
                Ok(converted) => {
                    positions.push(position);
                    batch.push(converted);
                }
                Err(err) => outcome.failures.push((position, err)),
            }
        }
        if batch.is_empty() {
            return Ok(outcome);
        }

        let options = InsertManyOptions::builder().ordered(false).build();
        match self.collection(collection).insert_many(&batch, options) {
            Ok(result) => outcome.inserted += result.inserted_ids.len(),
            Err(err) => {
                let write_errors = match err.kind.as_ref() {
                    ErrorKind::BulkWrite(failure) => failure.write_errors.clone().unwrap_or_default(),
                    _ => Vec::new(),
                };
                if write_errors.is_empty() {
                    return Err(classify(err, collection, "insert_many"));
                }

                outcome.inserted += batch.len().saturating_sub(write_errors.len());
                for write_error in write_errors {
                    let position = positions
                        .get(write_error.index)
                        .copied()
                        .unwrap_or(write_error.index);
                    let failure = if ServerFailure::from_code(write_error.code)
                        == ServerFailure::DuplicateKey
                    {
                        StoreError::DuplicateKey {
                            collection: collection.to_string(),
                            detail: write_error.message,
                        }
                    } else {
                        StoreError::Rejected {
                            collection: collection.to_string(),
                            reason: write_error.message,
                        }
                    };
                    outcome.failures.push((position, failure));
                }
            }
        }
        Ok(outcome)
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        self.collection(collection)
            .count_documents(BsonDocument::new(), None)
            .map_err(|err| classify(err, collection, "count"))
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError> {
        let found = self
            .collection(collection)
            .find_one(filter_document(filter)?, None)
            .map_err(|err| classify(err, collection, &filter.to_string()))?;
        Ok(found.map(from_bson_document))
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        let cursor = match self.collection(collection).list_indexes(None) {
            Ok(cursor) => cursor,
            Err(err) if ServerFailure::of(&err) == ServerFailure::NamespaceNotFound => {
                return Ok(vec![IndexSpec::identity()]);
            }
            Err(err) => return Err(classify(err, collection, "list indexes")),
        };

        let mut specs = Vec::new();
        for model in cursor {
            let model = model.map_err(|err| classify(err, collection, "list indexes"))?;
            specs.push(index_spec(&model));
        }
        if !specs.iter().any(|s| s.name == ID_INDEX_NAME) {
            specs.push(IndexSpec::identity());
        }
        specs.sort_by_key(|s| s.name != ID_INDEX_NAME);
        Ok(specs)
    }

    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> Result<(), StoreError> {
        if spec.name == ID_INDEX_NAME {
            if IndexSpec::identity().same_definition(spec) {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                name: spec.name.clone(),
            });
        }

        self.collection(collection)
            .create_index(index_model(spec), None)
            .map(|_| ())
            .map_err(|err| match ServerFailure::of(&err) {
                ServerFailure::IndexConflict => StoreError::IndexConflict {
                    collection: collection.to_string(),
                    name: spec.name.clone(),
                },
                _ => classify(err, collection, &format!("index {}", spec.name)),
            })
    }

    fn drop_index(&mut self, collection: &str, name: &str) -> Result<(), StoreError> {
        if name == ID_INDEX_NAME {
            return Err(StoreError::Rejected {
                collection: collection.to_string(),
                reason: "the _id_ index cannot be dropped".into(),
            });
        }

        self.collection(collection)
            .drop_index(name, None)
            .map_err(|err| match ServerFailure::of(&err) {
                ServerFailure::IndexNotFound | ServerFailure::NamespaceNotFound => {
                    StoreError::IndexNotFound {
                        collection: collection.to_string(),
                        name: name.to_string(),
                    }
                }
                _ => classify(err, collection, &format!("drop index {name}")),
            })
    }
}
