//! In-process document store.
//!
//! Backs `memory://` targets and the engine's tests. Unique and sparse index
//! definitions are enforced the same way the SQLite store enforces them, and
//! bulk writes are atomic. [`Faults`] lets tests inject batch failures,
//! rejected records, outages after N batches and writes from a concurrent
//! process.

use std::collections::{BTreeMap, HashSet};

use super::{
    DocKey, Document, DocumentStore, Filter, ID_FIELD, ID_INDEX_NAME, IndexSpec,
    InsertManyOutcome, StoreError, WriteAck, WriteOp,
};

#[derive(Debug, Clone, Default)]
struct Collection {
    docs: BTreeMap<DocKey, Document>,
    /// Insertion order of identities, for deterministic `find_one`.
    order: Vec<DocKey>,
    indexes: Vec<IndexSpec>,
}

impl Collection {
    fn first_match(&self, filter: &Filter) -> Option<&DocKey> {
        match filter {
            Filter::Id(key) => self.docs.get_key_value(key).map(|(k, _)| k),
            Filter::Field { .. } => self
                .order
                .iter()
                .find(|id| self.docs.get(*id).is_some_and(|doc| filter.matches(id, doc))),
        }
    }

    /// Check `doc` (to be stored under `id`) against every unique index.
    fn check_unique(&self, collection: &str, id: &DocKey, doc: &Document) -> Result<(), StoreError> {
        for index in self.indexes.iter().filter(|i| i.unique && !i.is_text()) {
            let Some(tuple) = index_tuple(index, doc) else {
                continue;
            };
            let clash = self
                .docs
                .iter()
                .any(|(other_id, other)| other_id != id && index_tuple(index, other).as_ref() == Some(&tuple));
            if clash {
                return Err(StoreError::DuplicateKey {
                    collection: collection.to_string(),
                    detail: format!("index {} rejects {}", index.name, render_tuple(&tuple)),
                });
            }
        }
        Ok(())
    }

    fn put(&mut self, id: DocKey, doc: Document) {
        if self.docs.insert(id.clone(), doc).is_none() {
            self.order.push(id);
        }
    }

    fn apply(&mut self, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError> {
        match op {
            WriteOp::ReplaceUpsert { id, document } => {
                let mut doc = document.clone();
                doc.insert(ID_FIELD.to_string(), id.to_value());
                self.check_unique(collection, id, &doc)?;
                let existed = self.docs.contains_key(id);
                self.put(id.clone(), doc);
                Ok(if existed {
                    WriteAck::Replaced
                } else {
                    WriteAck::Inserted
                })
            }
            WriteOp::UpdateFields { filter, fields } => {
                let Some(id) = self.first_match(filter).cloned() else {
                    return Ok(WriteAck::Unmatched);
                };
                let mut doc = self.docs.get(&id).cloned().unwrap_or_default();
                for (name, value) in fields {
                    if name != ID_FIELD {
                        doc.insert(name.clone(), value.clone());
                    }
                }
                self.check_unique(collection, &id, &doc)?;
                self.put(id, doc);
                Ok(WriteAck::Updated)
            }
        }
    }
}

/// Values of the index fields in `doc`; `None` when a field is absent or
/// not a scalar. Such documents never clash, as with SQL `NULL`s.
fn index_tuple(index: &IndexSpec, doc: &Document) -> Option<Vec<DocKey>> {
    index
        .keys
        .iter()
        .map(|key| doc.get(&key.field).and_then(DocKey::from_value))
        .collect()
}

fn render_tuple(tuple: &[DocKey]) -> String {
    tuple
        .iter()
        .map(DocKey::to_json)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure injection for tests.
#[derive(Debug, Default)]
pub struct Faults {
    /// Fail this many upcoming `bulk_write` calls outright.
    pub fail_bulk_writes: usize,
    /// After this many successful `bulk_write` calls, every write fails
    /// until cleared, as if the process lost the store mid-run.
    pub outage_after_batches: Option<usize>,
    /// `(collection, key)` pairs whose writes are rejected, keyed by the
    /// value of the `id`/`imei` field or by `_id`.
    pub reject: Vec<(String, DocKey)>,
    /// Documents another writer inserts just before the next write call
    /// touches their collection.
    pub concurrent_inserts: Vec<(String, DocKey, Document)>,
}

/// Ephemeral document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    database: String,
    collections: BTreeMap<String, Collection>,
    faults: Faults,
    batches_written: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..Self::default()
        }
    }

    /// Mutable access to the injected faults.
    pub fn faults_mut(&mut self) -> &mut Faults {
        &mut self.faults
    }

    /// Remove every injected fault.
    pub fn clear_faults(&mut self) {
        self.faults = Faults::default();
    }

    /// All documents of a collection in insertion order.
    #[must_use]
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .get(collection)
            .map(|c| c.order.iter().filter_map(|id| c.docs.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    fn collection_mut(&mut self, name: &str) -> &mut Collection {
        self.collections.entry(name.to_string()).or_default()
    }

    fn in_outage(&self) -> bool {
        self.faults
            .outage_after_batches
            .is_some_and(|limit| self.batches_written >= limit)
    }

    fn run_concurrent_writers(&mut self, collection: &str) {
        let (due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.faults.concurrent_inserts)
            .into_iter()
            .partition(|(name, _, _)| name == collection);
        self.faults.concurrent_inserts = rest;

        for (name, id, mut doc) in due {
            doc.insert(ID_FIELD.to_string(), id.to_value());
            tracing::debug!(collection = %name, id = %id, "concurrent writer inserted document");
            self.collection_mut(&name).put(id, doc);
        }
    }

    fn check_rejected(&self, collection: &str, op: &WriteOp) -> Result<(), StoreError> {
        let keys: Vec<DocKey> = match op {
            WriteOp::ReplaceUpsert { id, document } => std::iter::once(id.clone())
                .chain(["id", "imei"].iter().filter_map(|f| {
                    document.get(*f).and_then(DocKey::from_value)
                }))
                .collect(),
            WriteOp::UpdateFields { filter, .. } => match filter {
                Filter::Id(key) | Filter::Field { value: key, .. } => vec![key.clone()],
            },
        };

        let rejected = self
            .faults
            .reject
            .iter()
            .any(|(name, key)| name == collection && keys.contains(key));
        if rejected {
            return Err(StoreError::Rejected {
                collection: collection.to_string(),
                reason: "injected rejection".into(),
            });
        }
        Ok(())
    }

    fn outage_error() -> StoreError {
        StoreError::Unavailable("injected outage".into())
    }
}

impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn database(&self) -> &str {
        &self.database
    }

    fn key_values(&self, collection: &str, field: &str) -> Result<HashSet<DocKey>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| {
                c.docs
                    .values()
                    .filter_map(|doc| doc.get(field).and_then(DocKey::from_value))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn bulk_write(&mut self, collection: &str, ops: &[WriteOp]) -> Result<Vec<WriteAck>, StoreError> {
        self.run_concurrent_writers(collection);

        if self.in_outage() {
            return Err(Self::outage_error());
        }
        if self.faults.fail_bulk_writes > 0 {
            self.faults.fail_bulk_writes -= 1;
            return Err(StoreError::Unavailable("injected bulk write failure".into()));
        }

        let mut staged = self.collections.get(collection).cloned().unwrap_or_default();
        let mut acks = Vec::with_capacity(ops.len());
        for op in ops {
            self.check_rejected(collection, op)?;
            acks.push(staged.apply(collection, op)?);
        }

        self.collections.insert(collection.to_string(), staged);
        self.batches_written += 1;
        Ok(acks)
    }

    fn write_one(&mut self, collection: &str, op: &WriteOp) -> Result<WriteAck, StoreError> {
        self.run_concurrent_writers(collection);

        if self.in_outage() {
            return Err(Self::outage_error());
        }
        self.check_rejected(collection, op)?;
        self.collection_mut(collection).apply(collection, op)
    }

    fn insert_many(
        &mut self,
        collection: &str,
        docs: &[Document],
    ) -> Result<InsertManyOutcome, StoreError> {
        self.run_concurrent_writers(collection);

        if self.in_outage() {
            return Err(Self::outage_error());
        }

        let mut outcome = InsertManyOutcome::default();
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

            let target = self.collection_mut(collection);
            if target.docs.contains_key(&id) {
                outcome.failures.push((
                    position,
                    StoreError::DuplicateKey {
                        collection: collection.to_string(),
                        detail: format!("{ID_FIELD}={}", id.to_json()),
                    },
                ));
                continue;
            }
            match target.check_unique(collection, &id, doc) {
                Ok(()) => {
                    target.put(id, doc.clone());
                    outcome.inserted += 1;
                }
                Err(err) => outcome.failures.push((position, err)),
            }
        }
        Ok(outcome)
    }

    fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let len = self.collections.get(collection).map_or(0, |c| c.docs.len());
        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>, StoreError> {
        Ok(self.collections.get(collection).and_then(|c| {
            c.first_match(filter)
                .and_then(|id| c.docs.get(id))
                .cloned()
        }))
    }

    fn list_indexes(&self, collection: &str) -> Result<Vec<IndexSpec>, StoreError> {
        let mut specs = vec![IndexSpec::identity()];
        if let Some(c) = self.collections.get(collection) {
            specs.extend(c.indexes.iter().cloned());
        }
        Ok(specs)
    }

    fn create_index(&mut self, collection: &str, spec: &IndexSpec) -> Result<(), StoreError> {
        if spec.name == ID_INDEX_NAME {
            if spec.same_definition(&IndexSpec::identity()) {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                name: spec.name.clone(),
            });
        }

        let target = self.collection_mut(collection);
        if let Some(existing) = target.indexes.iter().find(|i| i.name == spec.name) {
            if existing.same_definition(spec) {
                return Ok(());
            }
            return Err(StoreError::IndexConflict {
                collection: collection.to_string(),
                name: spec.name.clone(),
            });
        }

        if spec.unique && !spec.is_text() {
            let mut seen = HashSet::new();
            for doc in target.docs.values() {
                if let Some(tuple) = index_tuple(spec, doc) {
                    if !seen.insert(tuple.clone()) {
                        return Err(StoreError::DuplicateKey {
                            collection: collection.to_string(),
                            detail: format!(
                                "index {} cannot be built: {} appears twice",
                                spec.name,
                                render_tuple(&tuple)
                            ),
                        });
                    }
                }
            }
        }

        target.indexes.push(spec.clone());
        Ok(())
    }

    fn drop_index(&mut self, collection: &str, name: &str) -> Result<(), StoreError> {
        if name == ID_INDEX_NAME {
            return Err(StoreError::Rejected {
                collection: collection.to_string(),
                reason: "the _id_ index cannot be dropped".into(),
            });
        }

        let target = self.collection_mut(collection);
        let before = target.indexes.len();
        target.indexes.retain(|i| i.name != name);
        if target.indexes.len() == before {
            return Err(StoreError::IndexNotFound {
                collection: collection.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }
}
