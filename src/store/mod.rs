//! Persistent document store
//!
//! Everything scheduling passes and workers share goes through a
//! [`DocumentStore`]: tasks, artifacts, experiment records and collaborator
//! definitions. Each operation is atomic for a single document;
//! `insert_unique` and `compare_and_swap` are the primitives the task manager
//! builds deduplication and state transitions on.

mod file;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{StoreBackend, StoreSettings};
use crate::error::{Error, Result};
use crate::types::new_id;

pub use file::FileStore;
pub use memory::MemoryStore;

// ─────────────────────────────────────────────────────────────────
// Collections & Documents
// ─────────────────────────────────────────────────────────────────

/// Named document collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Tasks,
    Artifacts,
    Experiments,
    Collaborators,
}

impl Collection {
    pub fn all() -> &'static [Collection] {
        &[
            Collection::Tasks,
            Collection::Artifacts,
            Collection::Experiments,
            Collection::Collaborators,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Artifacts => "artifacts",
            Collection::Experiments => "experiments",
            Collection::Collaborators => "collaborators",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored document: store-assigned id plus JSON body
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

/// Outcome of [`DocumentStore::insert_unique`]
#[derive(Debug, Clone, PartialEq)]
pub enum Inserted {
    /// No match existed; the body was stored under a fresh id
    New(Document),
    /// A matching document already existed and was left untouched
    Existing(Document),
}

impl Inserted {
    pub fn document(&self) -> &Document {
        match self {
            Inserted::New(doc) | Inserted::Existing(doc) => doc,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Inserted::New(doc) | Inserted::Existing(doc) => doc,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Inserted::New(_))
    }
}

// ─────────────────────────────────────────────────────────────────
// Filters
// ─────────────────────────────────────────────────────────────────

/// Predicate on a single field
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Exists(bool),
}

impl Condition {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => field == Some(expected),
            Condition::Ne(unexpected) => field != Some(unexpected),
            Condition::In(options) => field.map_or(false, |v| options.contains(v)),
            Condition::Exists(should) => field.map_or(false, |v| !v.is_null()) == *should,
        }
    }
}

/// Conjunction of field conditions. Field names may be dotted paths into
/// nested objects (`"parameters.system_id"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Condition)>,
}

impl Filter {
    /// Matches every document
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), Condition::Eq(value.into())));
        self
    }

    pub fn ne(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), Condition::Ne(value.into())));
        self
    }

    pub fn is_in<I, V>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.clauses.push((field.into(), Condition::In(values)));
        self
    }

    pub fn exists(mut self, field: impl Into<String>, should_exist: bool) -> Self {
        self.clauses.push((field.into(), Condition::Exists(should_exist)));
        self
    }

    pub fn matches(&self, body: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, condition)| condition.matches(lookup(body, field)))
    }
}

fn lookup<'a>(body: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(body, |value, segment| value.get(segment))
}

// ─────────────────────────────────────────────────────────────────
// Store Trait
// ─────────────────────────────────────────────────────────────────

/// Document store shared by scheduling passes and workers.
///
/// Implementations must make every method atomic with respect to every other
/// method, including callers in other processes.
pub trait DocumentStore: Send + Sync {
    /// Store a body under a fresh id
    fn insert(&self, collection: Collection, body: Value) -> Result<String>;

    /// Store `body` unless some document already matches `unique`
    fn insert_unique(&self, collection: Collection, body: Value, unique: &Filter) -> Result<Inserted>;

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>>;

    /// First matching document in insertion order
    fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Document>>;

    /// All matching documents in insertion order
    fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>>;

    /// Replace the document iff it exists and matches `expected`.
    /// Returns whether the swap happened.
    fn compare_and_swap(&self, collection: Collection, id: &str, expected: &Filter, body: Value) -> Result<bool>;

    /// Insert or replace under a caller-chosen id
    fn put(&self, collection: Collection, id: &str, body: Value) -> Result<()>;

    /// Delete a document. Returns whether it existed.
    fn remove(&self, collection: Collection, id: &str) -> Result<bool>;
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn DocumentStore>;

/// Run store work on the blocking pool. File store operations wait on a
/// lock file and must not stall the async workers.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("store operation aborted: {}", e)))?
}

/// Open the store selected by configuration
pub fn open_store(settings: &StoreSettings) -> Result<SharedStore> {
    match settings.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::File => Ok(Arc::new(FileStore::open(
            &settings.path,
            std::time::Duration::from_millis(settings.lock_timeout_ms),
        )?)),
    }
}

// ─────────────────────────────────────────────────────────────────
// In-memory collection data (shared by both backends)
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredDocument {
    seq: u64,
    body: Value,
}

/// One collection's contents. Ordered by id for stable files; `seq` keeps
/// insertion order for queries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CollectionData {
    next_seq: u64,
    documents: BTreeMap<String, StoredDocument>,
}

impl CollectionData {
    fn insert(&mut self, id: String, body: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.documents.insert(id, StoredDocument { seq, body });
    }

    fn insert_new(&mut self, body: Value) -> Document {
        let id = new_id();
        self.insert(id.clone(), body.clone());
        Document { id, body }
    }

    fn get(&self, id: &str) -> Option<Document> {
        self.documents.get(id).map(|d| Document {
            id: id.to_string(),
            body: d.body.clone(),
        })
    }

    fn find(&self, filter: &Filter) -> Vec<Document> {
        let mut matches: Vec<(&String, &StoredDocument)> = self
            .documents
            .iter()
            .filter(|(_, d)| filter.matches(&d.body))
            .collect();
        matches.sort_by_key(|(_, d)| d.seq);
        matches
            .into_iter()
            .map(|(id, d)| Document {
                id: id.clone(),
                body: d.body.clone(),
            })
            .collect()
    }

    fn find_one(&self, filter: &Filter) -> Option<Document> {
        self.find(filter).into_iter().next()
    }

    fn insert_unique(&mut self, body: Value, unique: &Filter) -> Inserted {
        match self.find_one(unique) {
            Some(existing) => Inserted::Existing(existing),
            None => Inserted::New(self.insert_new(body)),
        }
    }

    fn compare_and_swap(&mut self, id: &str, expected: &Filter, body: Value) -> bool {
        match self.documents.get_mut(id) {
            Some(doc) if expected.matches(&doc.body) => {
                doc.body = body;
                true
            }
            _ => false,
        }
    }

    fn put(&mut self, id: &str, body: Value) {
        match self.documents.get_mut(id) {
            Some(doc) => doc.body = body,
            None => self.insert(id.to_string(), body),
        }
    }

    fn remove(&mut self, id: &str) -> bool {
        self.documents.remove(id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_eq_and_in() {
        let body = json!({"kind": "run_system", "state": "DONE", "parameters": {"system_id": "s1"}});

        assert!(Filter::all().matches(&body));
        assert!(Filter::all().eq("kind", "run_system").matches(&body));
        assert!(!Filter::all().eq("kind", "train_system").matches(&body));
        assert!(Filter::all().is_in("state", ["UNSTARTED", "DONE"]).matches(&body));
        assert!(!Filter::all().is_in("state", ["FAILED"]).matches(&body));
        assert!(Filter::all().eq("parameters.system_id", "s1").matches(&body));
        assert!(Filter::all().ne("state", "FAILED").matches(&body));
    }

    #[test]
    fn test_filter_exists() {
        let body = json!({"result": null, "job_id": "j"});
        assert!(Filter::all().exists("job_id", true).matches(&body));
        assert!(Filter::all().exists("result", false).matches(&body));
        assert!(Filter::all().exists("missing", false).matches(&body));
        assert!(!Filter::all().exists("missing", true).matches(&body));
    }

    #[test]
    fn test_collection_data_preserves_insertion_order() {
        let mut data = CollectionData::default();
        for i in 0..10 {
            data.insert_new(json!({"n": i}));
        }
        let found: Vec<i64> = data
            .find(&Filter::all())
            .iter()
            .map(|d| d.body["n"].as_i64().unwrap())
            .collect();
        assert_eq!(found, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_collection_data_insert_unique() {
        let mut data = CollectionData::default();
        let unique = Filter::all().eq("key", "a");

        let first = data.insert_unique(json!({"key": "a", "v": 1}), &unique);
        assert!(first.is_new());
        let second = data.insert_unique(json!({"key": "a", "v": 2}), &unique);
        assert!(!second.is_new());
        assert_eq!(second.document().id, first.document().id);
        assert_eq!(second.document().body["v"], json!(1));
    }

    #[test]
    fn test_collection_data_compare_and_swap() {
        let mut data = CollectionData::default();
        let doc = data.insert_new(json!({"state": "UNSTARTED"}));
        let expected = Filter::all().eq("state", "UNSTARTED");

        assert!(data.compare_and_swap(&doc.id, &expected, json!({"state": "RUNNING"})));
        assert!(!data.compare_and_swap(&doc.id, &expected, json!({"state": "RUNNING"})));
        assert!(!data.compare_and_swap("missing", &Filter::all(), json!({})));
    }

    #[test]
    fn test_collection_data_remove() {
        let mut data = CollectionData::default();
        let doc = data.insert_new(json!({"n": 1}));
        assert!(data.remove(&doc.id));
        assert!(!data.remove(&doc.id));
        assert!(data.get(&doc.id).is_none());
    }

    #[tokio::test]
    async fn test_blocking_returns_work_result() {
        let store: SharedStore = Arc::new(MemoryStore::new());
        let handle = store.clone();
        let id = blocking(move || handle.insert(Collection::Tasks, json!({"n": 1}))).await.unwrap();
        assert!(store.get(Collection::Tasks, &id).unwrap().is_some());
    }
}
