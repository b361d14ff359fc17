#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use docmap::{
    StoreBackend, VersionCheck,
    bson::{Bson, Document},
    error::MappingResult,
    memory::InMemoryStore,
};

/// An in-memory backend that records every read it serves.
///
/// Clones share both the stored documents and the call log.
#[derive(Debug, Clone, Default)]
pub struct CountingStore {
    inner: InMemoryStore,
    calls: Arc<Mutex<Vec<(&'static str, String)>>>,
    truncate_batches: bool,
}

impl CountingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose batched fetches return at most one document.
    pub fn truncating() -> Self {
        Self {
            truncate_batches: true,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Number of `operation` calls made against `collection`.
    pub fn count(&self, operation: &str, collection: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, col)| *op == operation && col == collection)
            .count()
    }

    pub fn reset(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, operation: &'static str, collection: &str) {
        self.calls
            .lock()
            .unwrap()
            .push((operation, collection.to_string()));
    }
}

#[async_trait]
impl StoreBackend for CountingStore {
    async fn fetch_document(&self, collection: &str, id: &Bson) -> MappingResult<Option<Document>> {
        self.record("fetch", collection);
        self.inner.fetch_document(collection, id).await
    }

    async fn exists_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        self.record("exists", collection);
        self.inner.exists_document(collection, id).await
    }

    async fn fetch_batch(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Document>> {
        self.record("batch", collection);
        let mut documents = self.inner.fetch_batch(collection, ids).await?;

        if self.truncate_batches {
            documents.truncate(1);
        }

        Ok(documents)
    }

    async fn existing_ids(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Bson>> {
        self.record("existing", collection);
        self.inner.existing_ids(collection, ids).await
    }

    async fn save_document(
        &self,
        collection: &str,
        document: Document,
        check: Option<VersionCheck>,
    ) -> MappingResult<()> {
        self.inner.save_document(collection, document, check).await
    }

    async fn delete_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        self.inner.delete_document(collection, id).await
    }
}
