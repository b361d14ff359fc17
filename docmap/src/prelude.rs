//! Convenient re-exports of commonly used types from docmap.
//!
//! Import this prelude module to quickly access the most frequently used types
//! and traits without needing to import from multiple sub-modules:
//!
//! ```ignore
//! use docmap::prelude::*;
//! ```
//!
//! This provides access to:
//! - The derive macros and the traits they implement
//! - The mapper, its options and the datastore
//! - Reference handles and shared instances
//! - Store backends and builders
//! - Error types

pub use bson::{Bson, Document, doc, oid::ObjectId};

pub use docmap_core::{
    backend::{StoreBackend, StoreBackendBuilder},
    context::{MappingContext, MappingWarning},
    datastore::Datastore,
    descriptor::{Entity, LifecyclePhase},
    error::{MappingError, MappingResult},
    key::Key,
    mapper::{EntityInterceptor, Mapper, MapperOptions},
    stub::{Reference, ReferenceList, ReferenceMap},
    value::{ObjectRef, Persist, Serialized, Shared, shared},
};
pub use docmap_macros::{Entity, MappedEnum};
