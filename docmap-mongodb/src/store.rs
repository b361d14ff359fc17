use async_trait::async_trait;
use futures::TryStreamExt;
use bson::{Document, Bson, doc};
use mongodb::{
    Client, Collection as MongoCollection,
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::ClientOptions,
};
use tracing::debug;
use docmap_core::{
    backend::{StoreBackend, StoreBackendBuilder, VersionCheck},
    error::{MappingError, MappingResult},
};

const DUPLICATE_KEY: i32 = 11000;

fn backend_error(e: MongoError) -> MappingError {
    MappingError::Backend(e.to_string())
}

fn is_duplicate_key(e: &MongoError) -> bool {
    matches!(
        e.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(failure)) if failure.code == DUPLICATE_KEY
    )
}

#[derive(Debug)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, collection_name: &str) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(collection_name)
    }
}

#[async_trait]
impl StoreBackend for MongoDbStore {
    async fn fetch_document(&self, collection: &str, id: &Bson) -> MappingResult<Option<Document>> {
        self.get_collection(collection)
            .find_one(doc! { "_id": id.clone() })
            .await
            .map_err(backend_error)
    }

    async fn exists_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        Ok(
            self.get_collection(collection)
                .count_documents(doc! { "_id": id.clone() })
                .await
                .map_err(backend_error)?
                > 0
        )
    }

    async fn fetch_batch(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Document>> {
        self.get_collection(collection)
            .find(doc! { "_id": { "$in": ids.to_vec() } })
            .await
            .map_err(backend_error)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend_error)
    }

    async fn existing_ids(&self, collection: &str, ids: &[Bson]) -> MappingResult<Vec<Bson>> {
        Ok(
            self.get_collection(collection)
                .find(doc! { "_id": { "$in": ids.to_vec() } })
                .projection(doc! { "_id": 1 })
                .await
                .map_err(backend_error)?
                .try_collect::<Vec<Document>>()
                .await
                .map_err(backend_error)?
                .into_iter()
                .filter_map(|mut doc| doc.remove("_id"))
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
            .cloned()
            .ok_or_else(|| MappingError::Backend(format!("document without _id in {collection}")))?;
        let conflict = || MappingError::ConcurrentModification(collection.to_string(), id.to_string());

        match check {
            None => {
                self.get_collection(collection)
                    .replace_one(doc! { "_id": id.clone() }, document)
                    .upsert(true)
                    .await
                    .map_err(backend_error)?;
            }
            Some(VersionCheck { expected: None, .. }) => {
                self.get_collection(collection)
                    .insert_one(document)
                    .await
                    .map_err(|e| if is_duplicate_key(&e) { conflict() } else { backend_error(e) })?;
            }
            Some(VersionCheck { field, expected: Some(expected) }) => {
                let result = self
                    .get_collection(collection)
                    .replace_one(doc! { "_id": id.clone(), field: expected }, document)
                    .await
                    .map_err(backend_error)?;

                if result.matched_count == 0 {
                    debug!(collection, id = %id, "version check failed");
                    return Err(conflict());
                }
            }
        }

        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &Bson) -> MappingResult<bool> {
        Ok(
            self.get_collection(collection)
                .delete_one(doc! { "_id": id.clone() })
                .await
                .map_err(backend_error)?
                .deleted_count
                > 0
        )
    }

    async fn shutdown(&self) -> MappingResult<()> {
        self.client.clone().shutdown().await;

        Ok(())
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl StoreBackendBuilder for MongoDbStoreBuilder {
    type Backend = MongoDbStore;

    async fn build(self) -> MappingResult<Self::Backend> {
        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(|e| MappingError::Initialization(e.to_string()))?,
            )
            .map_err(|e| MappingError::Initialization(e.to_string()))?,
            self.database,
        ))
    }
}
