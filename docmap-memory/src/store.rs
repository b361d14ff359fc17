//! In-memory storage implementation for the mapper.
//!
//! This module provides a simple backend that stores documents in HashMaps guarded by
//! async-safe read-write locks.

use std::{collections::HashMap, sync::Arc};
use async_trait::async_trait;
use mea::rwlock::RwLock;
use bson::{Bson, Document};

use docmap_core::{
    backend::{StoreBackend, StoreBackendBuilder, VersionCheck},
    error::{MappingError, MappingResult},
    key::canonical_id,
};

type CollectionMap = HashMap<String, Document>;
type StoreMap = HashMap<String, CollectionMap>;

/// Returns the string a document is indexed by.
///
/// Integer identifiers index the same regardless of their width, so a document saved with
/// an `Int64` id is found through an `Int32` pointer and the other way around.
fn storage_key(id: &Bson) -> String {
    match id {
        Bson::Int32(value) => format!("int:{value}"),
        Bson::Int64(value) => format!("int:{value}"),
        Bson::String(value) => format!("str:{value}"),
        Bson::ObjectId(value) => format!("oid:{value}"),
        other => format!("{:?}", canonical_id(other)),
    }
}

/// Thread-safe in-memory document storage backend.
///
/// This struct implements the [`StoreBackend`] trait entirely in memory. Documents are
/// indexed by their `_id`.
///
/// # Thread Safety
///
/// `InMemoryStore` is cloneable and uses an `Arc`-wrapped internal state, allowing
/// it to be safely shared across async tasks. Multiple clones of the same instance
/// share the same underlying data. Version checks run under the write lock, so two
/// concurrent saves of the same version cannot both succeed.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap::backend::StoreBackend;
/// use bson::{Bson, doc};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStore::new();
///
///     store.save_document("users", doc! { "_id": 1_i64, "name": "Alice" }, None).await?;
///
///     let found = store.fetch_document("users", &Bson::Int64(1)).await?;
///     assert!(found.is_some());
///
///     Ok(())
/// }
/// ```
#[derive(Default, Clone, Debug)]
pub struct InMemoryStore {
    /// The main storage map: collection_name -> (document key -> document)
    store: Arc<RwLock<StoreMap>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory document store.
    pub fn new() -> Self {
        Self {
            store: Arc::new(RwLock::new(StoreMap::new())),
        }
    }

    /// Creates a builder for constructing an `InMemoryStore`.
    ///
    /// # Example
    ///
    /// ```ignore
    /// use docmap_memory::InMemoryStore;
    ///
    /// let store = InMemoryStore::builder().build().await.unwrap();
    /// ```
    pub fn builder() -> InMemoryStoreBuilder {
        InMemoryStoreBuilder::default()
    }

    /// Returns the number of documents in a collection.
    pub async fn count(&self, collection: &str) -> usize {
        self.store
            .read()
            .await
            .get(collection)
            .map_or(0, HashMap::len)
    }
}

#[async_trait]
impl StoreBackend for InMemoryStore {
    async fn fetch_document(&self, collection: &str, id: &Bson) -> MappingResult<Option<Document>> {
        Ok(
            self.store
                .read()
                .await
                .get(collection)
                .and_then(|collection_map| collection_map.get(&storage_key(id)))
                .cloned()
        )
    }

    async fn exists_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        Ok(
            self.store
                .read()
                .await
                .get(collection)
                .is_some_and(|collection_map| collection_map.contains_key(&storage_key(id)))
        )
    }

    async fn fetch_batch(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Document>> {
        let store = self.store.read().await;
        let collection_map = match store.get(collection) {
            Some(col) => col,
            None => return Ok(vec![]),
        };

        let mut documents = Vec::with_capacity(ids.len());

        for id in ids {
            if let Some(doc) = collection_map.get(&storage_key(id)) {
                documents.push(doc.clone());
            }
        }

        Ok(documents)
    }

    async fn existing_ids(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Bson>> {
        let store = self.store.read().await;
        let collection_map = match store.get(collection) {
            Some(col) => col,
            None => return Ok(vec![]),
        };

        Ok(
            ids.iter()
                .filter(|id| collection_map.contains_key(&storage_key(id)))
                .cloned()
                .collect()
        )
    }

    async fn save_document(
        &self,
        collection: &str,
        document: Document,
        check: Option<VersionCheck>,
    ) -> MappingResult<()> {
        let id = document
            .get("_id")
            .ok_or_else(|| MappingError::Backend(format!("document without _id in {collection}")))?;
        let key = storage_key(id);

        let mut store = self.store.write().await;
        let collection_map = store
            .entry(collection.to_string())
            .or_default();

        if let Some(check) = check {
            let stored = collection_map
                .get(&key)
                .map(|existing| existing.get(&check.field).cloned().unwrap_or(Bson::Null));

            let holds = match (&check.expected, &stored) {
                (None, None) => true,
                (Some(expected), Some(stored)) => same_version(expected, stored),
                _ => false,
            };

            if !holds {
                return Err(MappingError::ConcurrentModification(collection.to_string(), id.to_string()));
            }
        }

        collection_map.insert(key, document);

        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        Ok(
            self.store
                .write()
                .await
                .get_mut(collection)
                .is_some_and(|collection_map| collection_map.remove(&storage_key(id)).is_some())
        )
    }
}

fn same_version(expected: &Bson, stored: &Bson) -> bool {
    match (expected, stored) {
        (Bson::Int32(a), Bson::Int64(b)) | (Bson::Int64(b), Bson::Int32(a)) => i64::from(*a) == *b,
        (a, b) => a == b,
    }
}

/// Builder for constructing [`InMemoryStore`] instances.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::InMemoryStore;
/// use docmap::backend::StoreBackendBuilder;
///
/// #[tokio::main]
/// async fn main() {
///     let store = InMemoryStore::builder().build().await.unwrap();
/// }
/// ```
#[derive(Default)]
pub struct InMemoryStoreBuilder;

#[async_trait]
impl StoreBackendBuilder for InMemoryStoreBuilder {
    type Backend = InMemoryStore;

    /// Builds and returns a new [`InMemoryStore`] instance.
    async fn build(self) -> MappingResult<Self::Backend> {
        Ok(InMemoryStore::new())
    }
}
