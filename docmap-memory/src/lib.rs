//! In-memory document storage backend for docmap.
//!
//! This crate provides a thread-safe, in-memory implementation of the `StoreBackend` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for development,
//! testing, and small-scale deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Batched lookups** - Fetches and existence checks by identifier set
//! - **Optimistic locking** - Version checks evaluated atomically with each write
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{prelude::*, memory::InMemoryStore};
//!
//! #[derive(Debug, Clone, Default, Entity)]
//! #[entity(collection = "users")]
//! pub struct User {
//!     #[mapped(id)]
//!     pub id: Option<ObjectId>,
//!     pub name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = InMemoryStore::builder().build().await?;
//!     let datastore = Datastore::new(backend);
//!
//!     let mut user = User {
//!         name: "Alice".to_string(),
//!         ..User::default()
//!     };
//!
//!     datastore.save(&mut user).await?;
//!     assert!(user.id.is_some());
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_memory;

pub mod store;

pub use store::{InMemoryStore, InMemoryStoreBuilder};
