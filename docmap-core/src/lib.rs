//! An object-document mapper for BSON document stores.
//!
//! This crate is the core of the docmap project and provides:
//!
//! - **Type descriptors** ([`descriptor`]) - Per-type mapping plans built from [`Entity::describe`]
//! - **Class registry** ([`registry`]) - A process-wide, concurrency-safe cache of descriptors
//! - **Value model** ([`value`]) - The dynamic [`Value`] representation and the [`Persist`] trait
//! - **Codecs** ([`codec`]) - The ordered chain converting plain values to and from BSON
//! - **Mapping engine** ([`mapper`]) - Entity graphs to documents and back, with lifecycle hooks
//! - **Embedded and reference mapping** ([`embedded`], [`reference`]) - Nested documents and pointers
//! - **Reference handles** ([`stub`]) - Lazily resolved references to other documents
//! - **Store backend abstraction** ([`backend`]) - Traits for implementing storage backends
//! - **Datastore** ([`datastore`]) - Typed persistence with optimistic locking
//! - **Error handling** ([`error`]) - Error types and result types
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::{DescriptorBuilder, Entity, Mapper};
//!
//! #[derive(Debug, Clone, Default)]
//! pub struct User {
//!     pub id: i64,
//!     pub name: String,
//! }
//!
//! impl Entity for User {
//!     fn describe(builder: &mut DescriptorBuilder<Self>) {
//!         builder.collection("users");
//!         builder.field::<i64>("id", |u| &u.id, |u| &mut u.id).id();
//!         builder.field::<String>("name", |u| &u.name, |u| &mut u.name);
//!     }
//! }
//!
//! let document = Mapper::new().to_document(&mut user)?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_core;

pub mod backend;
pub mod codec;
pub mod context;
pub mod datastore;
pub mod descriptor;
pub mod embedded;
pub mod error;
pub mod key;
pub mod mapper;
pub mod reference;
pub mod registry;
pub mod stub;
pub mod value;

pub use crate::{
    backend::{StoreBackend, StoreBackendBuilder, VersionCheck},
    codec::{Codec, Codecs},
    context::{MappingContext, MappingWarning},
    datastore::Datastore,
    descriptor::{
        DescriptorBuilder, Entity, EntityType, FieldDescriptor, FieldRole, LifecyclePhase,
        MappedObject, ReferenceOptions, TypeDescriptor,
    },
    error::{MappingError, MappingResult},
    key::Key,
    mapper::{EntityInterceptor, Mapper, MapperBuilder, MapperOptions},
    registry::ClassRegistry,
    stub::{Reference, ReferenceList, ReferenceMap, Resolver},
    value::{MappedEnum, ObjectRef, Persist, Serialized, Shared, TypeShape, Value, shared},
};
