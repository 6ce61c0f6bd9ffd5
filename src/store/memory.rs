//! In-process store
//!
//! Holds all collections behind one lock. Suitable for tests and for running
//! a scheduling pass and its workers inside a single process.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::Result;

use super::{Collection, CollectionData, Document, DocumentStore, Filter, Inserted};

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<Collection, CollectionData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    pub fn len(&self, collection: Collection) -> usize {
        self.collections
            .read()
            .get(&collection)
            .map(|c| c.documents.len())
            .unwrap_or(0)
    }
}

impl DocumentStore for MemoryStore {
    fn insert(&self, collection: Collection, body: Value) -> Result<String> {
        let mut collections = self.collections.write();
        let doc = collections.entry(collection).or_default().insert_new(body);
        Ok(doc.id)
    }

    fn insert_unique(&self, collection: Collection, body: Value, unique: &Filter) -> Result<Inserted> {
        let mut collections = self.collections.write();
        Ok(collections.entry(collection).or_default().insert_unique(body, unique))
    }

    fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        Ok(self.collections.read().get(&collection).and_then(|c| c.get(id)))
    }

    fn find_one(&self, collection: Collection, filter: &Filter) -> Result<Option<Document>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .and_then(|c| c.find_one(filter)))
    }

    fn find(&self, collection: Collection, filter: &Filter) -> Result<Vec<Document>> {
        Ok(self
            .collections
            .read()
            .get(&collection)
            .map(|c| c.find(filter))
            .unwrap_or_default())
    }

    fn compare_and_swap(&self, collection: Collection, id: &str, expected: &Filter, body: Value) -> Result<bool> {
        let mut collections = self.collections.write();
        Ok(collections
            .get_mut(&collection)
            .map(|c| c.compare_and_swap(id, expected, body))
            .unwrap_or(false))
    }

    fn put(&self, collection: Collection, id: &str, body: Value) -> Result<()> {
        self.collections.write().entry(collection).or_default().put(id, body);
        Ok(())
    }

    fn remove(&self, collection: Collection, id: &str) -> Result<bool> {
        let mut collections = self.collections.write();
        Ok(collections.get_mut(&collection).map(|c| c.remove(id)).unwrap_or(false))
    }
}
