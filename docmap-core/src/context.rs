//! Per-operation mapping state.
//!
//! A [`MappingContext`] is created for one top-level read or write and threaded through
//! every nested call. It holds the identity cache that keeps cyclic and diamond-shaped
//! reference graphs finite and coherent, the in-flight and completed sets used while
//! writing, and the warnings collected along the way. Contexts are never shared between
//! operations.

use bson::Document;
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tracing::warn;

use crate::{backend::StoreBackend, key::Key, value::ObjectRef};

/// A non-fatal problem recorded while mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWarning {
    /// The qualified name of the field concerned, e.g. `User.avatar`.
    pub field: String,
    pub message: String,
}

impl fmt::Display for MappingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Default)]
pub struct MappingContext {
    source: Option<Arc<dyn StoreBackend>>,
    pub(crate) entities: HashMap<Key, ObjectRef>,
    pub(crate) in_flight: HashSet<usize>,
    pub(crate) written: HashMap<usize, (ObjectRef, Document)>,
    warnings: Vec<MappingWarning>,
}

impl MappingContext {
    /// Creates a context that can map documents but cannot resolve references.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context resolving references through `source`.
    pub fn with_source(source: Arc<dyn StoreBackend>) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn source(&self) -> Option<&Arc<dyn StoreBackend>> {
        self.source.as_ref()
    }

    /// Returns the instance cached under `key` during this operation.
    pub fn cached(&self, key: &Key) -> Option<&ObjectRef> {
        self.entities.get(key)
    }

    /// Registers an instance under its key so later pointers to it reuse it.
    pub fn register(&mut self, key: Key, object: ObjectRef) {
        self.entities.insert(key, object);
    }

    /// Records a warning and logs it.
    pub fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        let warning = MappingWarning {
            field: field.into(),
            message: message.into(),
        };

        warn!(field = %warning.field, "{}", warning.message);
        self.warnings.push(warning);
    }

    pub fn warnings(&self) -> &[MappingWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<MappingWarning> {
        std::mem::take(&mut self.warnings)
    }
}

impl fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingContext")
            .field("source", &self.source)
            .field("entities", &self.entities.len())
            .field("in_flight", &self.in_flight.len())
            .field("written", &self.written.len())
            .field("warnings", &self.warnings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_accumulate_until_taken() {
        let mut ctx = MappingContext::new();
        ctx.warn("User.avatar", "no codec for Custom(\"Image\")");
        ctx.warn("User.friends", "missing reference");

        assert_eq!(ctx.warnings().len(), 2);
        assert_eq!(ctx.warnings()[0].to_string(), "User.avatar: no codec for Custom(\"Image\")");
        assert_eq!(ctx.take_warnings().len(), 2);
        assert!(ctx.warnings().is_empty());
        assert!(ctx.source().is_none());
    }
}
