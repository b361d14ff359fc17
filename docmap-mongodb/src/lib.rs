//! MongoDB backend implementation for docmap.
//!
//! This crate provides a MongoDB-based implementation of the `StoreBackend` trait,
//! enabling persistent document storage for mapped entities.
//!
//! To use this backend, include the `mongodb` feature in your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! docmap = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Features
//!
//! - **Persistent storage** - Data is persisted to MongoDB Atlas or self-hosted MongoDB
//! - **Native pointers** - References are stored in the DBRef layout MongoDB understands
//! - **Batched lookups** - Reference lists resolve with a single `$in` query
//! - **Optimistic locking** - Version checks are part of the write filter
//!
//! # Connection
//!
//! To use this backend, you need a MongoDB connection string. This can be provided
//! through the builder pattern.
//!
//! # Example
//!
//! ```ignore
//! use docmap::{backend::StoreBackendBuilder, mongodb::MongoDbStore, Datastore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!         .build()
//!         .await?;
//!     let datastore = Datastore::new(store);
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_mongodb;

pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder};
