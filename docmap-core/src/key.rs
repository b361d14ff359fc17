//! Keys and store-level pointers.
//!
//! A [`Key`] addresses a stored entity without holding the entity itself. Inside a
//! document a key is written as a pointer, using the DBRef layout understood by MongoDB:
//!
//! ```text
//! { "$ref": "<collection>", "$id": <identifier> }
//! ```

use bson::{Bson, doc};
use std::{
    fmt,
    hash::{Hash, Hasher},
};

use crate::error::{MappingError, MappingResult};

const REF_FIELD: &str = "$ref";
const ID_FIELD: &str = "$id";

/// A `(kind, identifier)` pair uniquely addressing a stored entity.
///
/// Two keys are equal iff their kinds are equal and their identifiers are the same
/// document identity (see [`same_id`]).
#[derive(Debug, Clone)]
pub struct Key {
    kind: String,
    id: Bson,
}

impl Key {
    pub fn new(kind: impl Into<String>, id: impl Into<Bson>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Returns the collection (kind) this key points into.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Returns the identifier of the addressed document.
    pub fn id(&self) -> &Bson {
        &self.id
    }

    /// Converts this key into its store-level pointer representation.
    pub fn to_pointer(&self) -> Bson {
        Bson::Document(doc! {
            REF_FIELD: self.kind.clone(),
            ID_FIELD: self.id.clone(),
        })
    }

    /// Returns `true` if the value looks like a store-level pointer.
    pub fn is_pointer(value: &Bson) -> bool {
        match value {
            Bson::Document(document) => {
                matches!(document.get(REF_FIELD), Some(Bson::String(_)))
                    && document.contains_key(ID_FIELD)
            }
            _ => false,
        }
    }

    /// Parses a key off a store-level pointer.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::TypeMismatch`] if the value is not a pointer.
    pub fn from_pointer(value: &Bson) -> MappingResult<Self> {
        let document = match value {
            Bson::Document(document) => document,
            other => return Err(MappingError::type_mismatch("pointer", other.to_string())),
        };

        match (document.get(REF_FIELD), document.get(ID_FIELD)) {
            (Some(Bson::String(kind)), Some(id)) => Ok(Self::new(kind.clone(), id.clone())),
            _ => Err(MappingError::type_mismatch("pointer", document.to_string())),
        }
    }
}

/// Returns the form identifiers are compared and hashed in.
///
/// Integers widen to 64 bits and negative zero becomes zero, matching how the store
/// itself matches `_id` values.
pub fn canonical_id(id: &Bson) -> Bson {
    match id {
        Bson::Int32(value) => Bson::Int64(i64::from(*value)),
        Bson::Double(value) if *value == 0.0 => Bson::Double(0.0),
        other => other.clone(),
    }
}

/// Returns `true` if two identifiers address the same document.
pub fn same_id(a: &Bson, b: &Bson) -> bool {
    canonical_id(a) == canonical_id(b)
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && same_id(&self.id, &other.id)
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        // Equal canonical values always render identically.
        format!("{:?}", canonical_id(&self.id)).hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn pointer_round_trips_through_dbref_layout() {
        let key = Key::new("users", 7_i64);
        let pointer = key.to_pointer();

        assert!(Key::is_pointer(&pointer));
        assert_eq!(
            pointer,
            Bson::Document(doc! { "$ref": "users", "$id": 7_i64 })
        );
        assert_eq!(Key::from_pointer(&pointer).unwrap(), key);
    }

    #[test]
    fn keys_compare_by_kind_and_identifier() {
        let mut keys = HashSet::new();
        keys.insert(Key::new("users", "a"));
        keys.insert(Key::new("users", "a"));
        keys.insert(Key::new("groups", "a"));
        keys.insert(Key::new("users", "b"));

        assert_eq!(keys.len(), 3);
        assert_ne!(Key::new("users", 1_i64), Key::new("users", 2_i64));
        assert_ne!(Key::new("users", 1_i64), Key::new("users", "1"));
    }

    #[test]
    fn integer_widths_address_the_same_document() {
        let mut keys = HashSet::new();
        keys.insert(Key::new("users", 3_i32));
        keys.insert(Key::new("users", 3_i64));

        assert_eq!(keys.len(), 1);
        assert_eq!(Key::new("users", 3_i32), Key::new("users", 3_i64));
        assert!(same_id(&Bson::Int32(3), &Bson::Int64(3)));
    }

    #[test]
    fn signed_zero_ids_hash_alike() {
        let mut keys = HashSet::new();
        keys.insert(Key::new("points", 0.0_f64));
        keys.insert(Key::new("points", -0.0_f64));

        assert_eq!(keys.len(), 1);
        assert_eq!(canonical_id(&Bson::Double(-0.0)), Bson::Double(0.0));
    }

    #[test]
    fn non_pointers_are_rejected() {
        assert!(Key::from_pointer(&Bson::String("users".into())).is_err());
        assert!(Key::from_pointer(&Bson::Document(doc! { "$id": 1 })).is_err());
    }
}
