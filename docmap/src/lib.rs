//! Main docmap crate, an object-document mapper for BSON document stores.
//!
//! This crate is the primary entry point for users of the docmap project. It re-exports
//! the mapping engine from `docmap-core`, the derive macros from `docmap-macros` and the
//! available storage backends.
//!
//! # Features
//!
//! - **Derived mappings** - Describe entities with `#[derive(Entity)]` instead of reflection
//! - **Embedded and referenced objects** - Nested documents, pointers and lazy handles
//! - **Identity-preserving reads** - Cycles and shared targets resolve to one instance
//! - **Optimistic locking** - Version fields checked and incremented on save
//! - **Multiple backends** - In-memory and MongoDB storage behind one trait
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap::{prelude::*, memory::InMemoryStore};
//!
//! #[derive(Debug, Clone, Default, Entity)]
//! #[entity(collection = "teams")]
//! pub struct Team {
//!     #[mapped(id)]
//!     pub id: Option<ObjectId>,
//!     pub name: String,
//! }
//!
//! #[derive(Debug, Clone, Default, Entity)]
//! #[entity(collection = "users")]
//! pub struct User {
//!     #[mapped(id)]
//!     pub id: Option<ObjectId>,
//!     pub name: String,
//!     #[mapped(version)]
//!     pub version: i64,
//!     #[mapped(reference(lazy))]
//!     pub team: Option<Reference<Team>>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), MappingError> {
//!     let datastore = Datastore::new(InMemoryStore::builder().build().await?);
//!
//!     let mut team = Team { name: "core".to_string(), ..Team::default() };
//!     datastore.save(&mut team).await?;
//!
//!     let mut user = User {
//!         name: "Alice".to_string(),
//!         team: Some(Reference::from_entity(team)),
//!         ..User::default()
//!     };
//!     let key = datastore.save(&mut user).await?;
//!     assert_eq!(user.version, 1);
//!
//!     let loaded = datastore.get::<User>(key.id().clone()).await?.unwrap();
//!     let team = loaded.read().unwrap().team.clone().unwrap();
//!
//!     // Loaded on first access
//!     println!("{:?}", team.get().await?);
//!
//!     datastore.shutdown().await
//! }
//! ```
//!
//! # Backends
//!
//! - [`memory`] - Fast in-memory storage for development and testing
//! - `mongodb` - Persistent MongoDB backend (requires the `mongodb` feature)

#[allow(unused_extern_crates)]
extern crate self as docmap;

pub mod prelude;

pub use docmap_core::{
    backend, codec, context, datastore, descriptor, error, key, mapper, reference, registry,
    stub, value,
};

pub use docmap_core::{
    ClassRegistry, Codec, Codecs, Datastore, DescriptorBuilder, Entity, EntityInterceptor,
    EntityType, FieldDescriptor, FieldRole, Key, LifecyclePhase, MappedObject, Mapper,
    MapperBuilder, MapperOptions, MappingContext, MappingError, MappingResult, MappingWarning,
    Reference, ReferenceList, ReferenceMap, ReferenceOptions, StoreBackend, StoreBackendBuilder,
    TypeDescriptor, VersionCheck,
};
pub use docmap_macros::{Entity, MappedEnum};

// Re-export BSON types for convenience
pub use bson;

/// In-memory storage backend implementations.
pub mod memory {
    pub use docmap_memory::{InMemoryStore, InMemoryStoreBuilder};
}

/// MongoDB storage backend implementations.
///
/// This module is only available when the `mongodb` feature is enabled.
#[cfg(feature = "mongodb")]
pub mod mongodb {
    pub use docmap_mongodb::{MongoDbStore, MongoDbStoreBuilder};
}
