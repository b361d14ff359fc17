//! Storage backend abstraction consumed by the mapper.
//!
//! The mapping engine never talks to a database directly. Reference resolution, existence
//! checks and persistence all go through the [`StoreBackend`] trait, which addresses raw
//! BSON documents by collection name and identifier.
//!
//! # Traits
//!
//! - [`StoreBackend`]: the core trait for storage backends
//! - [`StoreBackendBuilder`]: factory trait for creating backend instances
//!
//! # Examples
//!
//! ```ignore
//! use docmap::backend::StoreBackend;
//! use bson::{Bson, doc};
//!
//! let backend = MyBackendImpl::new();
//!
//! backend.save_document("users", doc! { "_id": 7_i64, "name": "Alice" }, None).await?;
//! let found = backend.fetch_document("users", &Bson::Int64(7)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{fmt::Debug, sync::Arc};

use crate::error::MappingResult;

/// An optimistic-locking condition attached to a save.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionCheck {
    /// The stored name of the version field.
    pub field: String,
    /// The version the stored document must currently carry, or `None` if the document
    /// must not exist yet.
    pub expected: Option<Bson>,
}

/// Abstract interface for document storage backends.
///
/// # Thread Safety
///
/// All implementations must be thread-safe and support concurrent access from multiple
/// async tasks. The exact concurrency model is implementation-specific but should be
/// documented by the implementer.
///
/// # Error Handling
///
/// Operations return [`MappingResult<T>`](crate::error::MappingResult). Backend failures
/// are reported as [`MappingError::Backend`](crate::error::MappingError::Backend); a failed
/// [`VersionCheck`] is reported as
/// [`MappingError::ConcurrentModification`](crate::error::MappingError::ConcurrentModification).
#[async_trait]
pub trait StoreBackend: Send + Sync + Debug {
    /// Fetches one document by identifier.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection to read from
    /// * `id` - The value of the document's `_id` field
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` if no such document exists.
    async fn fetch_document(&self, collection: &str, id: &Bson) -> MappingResult<Option<Document>>;

    /// Checks whether a document exists without fetching it.
    async fn exists_document(&self, collection: &str, id: &Bson) -> MappingResult<bool>;

    /// Fetches many documents by identifier in one round trip.
    ///
    /// Missing documents are omitted, so the result may be shorter than `ids`. The order of
    /// the result is not guaranteed to match the order of `ids`.
    async fn fetch_batch(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Document>>;

    /// Returns which of the given identifiers exist, in one round trip.
    ///
    /// The default implementation projects the identifiers out of [`fetch_batch`].
    ///
    /// [`fetch_batch`]: StoreBackend::fetch_batch
    async fn existing_ids(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Bson>> {
        Ok(self
            .fetch_batch(collection, ids)
            .await?
            .into_iter()
            .filter_map(|mut document| document.remove("_id"))
            .collect())
    }

    /// Inserts or replaces a document, keyed by its `_id` field.
    ///
    /// # Arguments
    ///
    /// * `collection` - The name of the collection. Created automatically if it doesn't exist.
    /// * `document` - The full document, including `_id`
    /// * `check` - An optional optimistic-locking condition evaluated atomically with the write
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::ConcurrentModification`](crate::error::MappingError::ConcurrentModification)
    /// if `check` does not hold.
    async fn save_document(
        &self,
        collection: &str,
        document: Document,
        check: Option<VersionCheck>,
    ) -> MappingResult<()>;

    /// Deletes a document by identifier.
    ///
    /// # Returns
    ///
    /// Returns `true` if a document was deleted.
    async fn delete_document(&self, collection: &str, id: &Bson) -> MappingResult<bool>;

    /// Cleanly shuts down the backend, releasing all resources.
    ///
    /// The default implementation is a no-op, but backends with external connections
    /// should override this.
    async fn shutdown(&self) -> MappingResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<B> StoreBackend for Arc<B>
where
    B: StoreBackend + ?Sized,
{
    async fn fetch_document(&self, collection: &str, id: &Bson) -> MappingResult<Option<Document>> {
        (**self).fetch_document(collection, id).await
    }

    async fn exists_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        (**self).exists_document(collection, id).await
    }

    async fn fetch_batch(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Document>> {
        (**self).fetch_batch(collection, ids).await
    }

    async fn existing_ids(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Bson>> {
        (**self).existing_ids(collection, ids).await
    }

    async fn save_document(
        &self,
        collection: &str,
        document: Document,
        check: Option<VersionCheck>,
    ) -> MappingResult<()> {
        (**self)
            .save_document(collection, document, check)
            .await
    }

    async fn delete_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        (**self).delete_document(collection, id).await
    }

    async fn shutdown(&self) -> MappingResult<()> {
        (**self).shutdown().await
    }
}

#[async_trait]
pub trait StoreBackendBuilder {
    type Backend: StoreBackend;

    async fn build(self) -> MappingResult<Self::Backend>;
}
