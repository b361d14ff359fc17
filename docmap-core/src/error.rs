//! Error types and result types for mapping operations.
//!
//! Every fallible operation in this crate returns [`MappingResult<T>`]. Errors raised while
//! mapping a single field are wrapped in [`MappingError::Field`] so the caller can see which
//! member failed; use [`MappingError::root_cause`] to get at the underlying condition.

use bson::error::Error as BsonError;
use serde_json::Error as SerdeJsonError;
use thiserror::Error;

/// Represents all possible errors that can occur while mapping objects to documents and back.
#[derive(Error, Debug)]
pub enum MappingError {
    /// A type failed structural validation when it was registered.
    #[error("Validation error for {class}: {reason}")]
    Validation { class: String, reason: String },
    /// A failure while mapping one field, wrapping the underlying cause.
    #[error("Error mapping field {field}: {source}")]
    Field {
        field: String,
        #[source]
        source: Box<MappingError>,
    },
    /// An object already carries an identity that differs from the incoming one.
    #[error("Identity mismatch for {class}: {existing} != {incoming}")]
    IdentityMismatch {
        class: String,
        existing: String,
        incoming: String,
    },
    /// A referenced entity has no identity, so no pointer can be written for it.
    #[error("Identity required for reference to {0}")]
    IdentityRequired(String),
    /// A stored pointer names a document that does not exist.
    #[error("The reference {pointer} could not be fetched for {field}")]
    DanglingReference { pointer: String, field: String },
    /// The stored version of a document differs from the version being saved.
    /// The first argument is the collection, the second is the document ID.
    #[error("Concurrent modification of {1} in collection {0}")]
    ConcurrentModification(String, String),
    /// A version field has no successor within its integer width.
    #[error("Version of {0} cannot be incremented past its maximum")]
    VersionOverflow(String),
    /// No codec or mapper is able to handle a declared type.
    #[error("Unsupported type: {0}")]
    UnsupportedType(String),
    /// A stored or in-memory value does not have the expected shape.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    /// Lazy references were demanded but lazy loading is disabled.
    #[error("Lazy references are unavailable: {0}")]
    LazyUnavailable(String),
    /// A stored class name is not registered with the mapper.
    #[error("Unknown class: {0}")]
    UnknownClass(String),
    /// An entity lock was poisoned by a panicking writer.
    #[error("Entity lock poisoned: {0}")]
    Poisoned(String),
    /// The requested document was not found in the collection.
    /// The first argument is the document ID, the second is the collection name.
    #[error("Document not found {0} in collection {1}")]
    DocumentNotFound(String, String),
    /// Serialization/deserialization error when converting between document formats.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Error during store initialization or connection setup.
    #[error("Initialization error: {0}")]
    Initialization(String),
    /// An error occurred in the underlying storage backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

/// A specialized `Result` type for mapping operations.
pub type MappingResult<T> = Result<T, MappingError>;

impl MappingError {
    /// Wraps an error raised while mapping the given field.
    pub fn field(field: impl Into<String>, source: MappingError) -> Self {
        MappingError::Field {
            field: field.into(),
            source: Box::new(source),
        }
    }

    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        MappingError::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// Returns the innermost error, looking through any [`MappingError::Field`] layers.
    pub fn root_cause(&self) -> &MappingError {
        match self {
            MappingError::Field { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns `true` if this error reports an optimistic-locking conflict.
    ///
    /// Callers can retry the operation after reloading the entity.
    pub fn is_concurrent_modification(&self) -> bool {
        matches!(self.root_cause(), MappingError::ConcurrentModification(..))
    }

    /// Returns `true` if this error reports a structural validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self.root_cause(), MappingError::Validation { .. })
    }
}

impl From<BsonError> for MappingError {
    fn from(err: BsonError) -> Self {
        MappingError::Serialization(err.to_string())
    }
}

impl From<SerdeJsonError> for MappingError {
    fn from(err: SerdeJsonError) -> Self {
        MappingError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_looks_through_field_layers() {
        let err = MappingError::field(
            "Outer.inner",
            MappingError::field(
                "Inner.id",
                MappingError::ConcurrentModification("users".into(), "7".into()),
            ),
        );

        assert!(err.is_concurrent_modification());
        assert!(!err.is_validation());
        assert!(err.to_string().starts_with("Error mapping field Outer.inner"));
    }
}
