//! The dynamic value model shared by accessors, codecs and the mapping engine.
//!
//! Every mapped field is read into a [`Value`] before it is encoded, and every decoded
//! value is handed back to the field as a [`Value`]. The [`Persist`] trait describes how a
//! concrete Rust type converts to and from that representation and which [`TypeShape`] it
//! declares, so the engine can pick the right codec or mapper without runtime reflection.
//!
//! # Example
//!
//! ```ignore
//! use docmap::value::{Persist, TypeShape, Value};
//!
//! assert_eq!(<Vec<String>>::shape(), TypeShape::List(Box::new(TypeShape::String)));
//!
//! let value = vec!["a".to_string()].to_value()?;
//! let back = <Vec<String>>::from_value(value)?;
//! ```

use bson::{
    Bson, de::deserialize_from_bson, oid::ObjectId, ser::serialize_to_bson,
};
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    hash::Hash,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{
    descriptor::{Entity, EntityType, MappedObject},
    error::{MappingError, MappingResult},
    key::Key,
    stub::Resolver,
};

/// A shared, lockable entity instance.
///
/// Entities reachable from more than one place in a graph (cycles, diamonds, cached
/// references) are held through this handle so every path observes the same instance.
pub type Shared<T> = Arc<RwLock<T>>;

/// A type-erased entity instance.
pub type ObjectRef = Arc<dyn MappedObject>;

/// Wraps an entity into a [`Shared`] handle.
pub fn shared<T>(entity: T) -> Shared<T> {
    Arc::new(RwLock::new(entity))
}

/// The declared type of a mapped field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeShape {
    Bool,
    Int32,
    Int64,
    Double,
    Char,
    String,
    Binary,
    DateTime,
    ObjectId,
    Uuid,
    /// An enum persisted by variant name.
    Enum(&'static str),
    /// Any serde type stored as a BSON sub-value.
    Serialized,
    /// A type that only a registered custom codec knows how to store.
    Custom(&'static str),
    Optional(Box<TypeShape>),
    List(Box<TypeShape>),
    Set(Box<TypeShape>),
    Map(Box<TypeShape>, Box<TypeShape>),
    /// An embedded entity of a known type.
    Entity(EntityType),
    /// An embedded entity whose concrete type is recorded in the document.
    Polymorphic,
    Reference(EntityType),
    ReferenceList(EntityType),
    ReferenceMap(EntityType),
}

impl TypeShape {
    /// Returns `true` if values of this shape are stored without going through the
    /// embedded or reference mappers.
    pub fn is_store_native(&self) -> bool {
        match self {
            TypeShape::Optional(inner) | TypeShape::List(inner) | TypeShape::Set(inner) => {
                inner.is_store_native()
            }
            TypeShape::Map(key, value) => key.is_store_native() && value.is_store_native(),
            TypeShape::Entity(_)
            | TypeShape::Polymorphic
            | TypeShape::Reference(_)
            | TypeShape::ReferenceList(_)
            | TypeShape::ReferenceMap(_) => false,
            _ => true,
        }
    }

    /// Returns `true` for reference handle shapes, looking through `Optional`.
    pub fn is_reference(&self) -> bool {
        matches!(
            self.strip_optional(),
            TypeShape::Reference(_) | TypeShape::ReferenceList(_) | TypeShape::ReferenceMap(_)
        )
    }

    /// Returns `true` if the embedded mapper can write values of this shape.
    ///
    /// That is the case when at least one leaf is an entity and no leaf is a reference.
    pub fn is_embeddable(&self) -> bool {
        match self {
            TypeShape::Entity(_) | TypeShape::Polymorphic => true,
            TypeShape::Optional(inner) | TypeShape::List(inner) | TypeShape::Set(inner) => {
                inner.is_embeddable()
            }
            TypeShape::Map(key, value) => key.is_store_native() && value.is_embeddable(),
            _ => false,
        }
    }

    /// Returns `true` for the integer shapes allowed on version fields.
    pub fn is_integer(&self) -> bool {
        matches!(self.strip_optional(), TypeShape::Int32 | TypeShape::Int64)
    }

    /// Returns the shape with any `Optional` layers removed.
    pub fn strip_optional(&self) -> &TypeShape {
        match self {
            TypeShape::Optional(inner) => inner.strip_optional(),
            other => other,
        }
    }

    /// Returns the element shape of a list or set.
    pub fn element(&self) -> Option<&TypeShape> {
        match self {
            TypeShape::List(inner) | TypeShape::Set(inner) => Some(inner),
            _ => None,
        }
    }

    /// Returns the referenced entity type of a reference shape.
    pub fn referenced_type(&self) -> Option<EntityType> {
        match self.strip_optional() {
            TypeShape::Reference(ty)
            | TypeShape::ReferenceList(ty)
            | TypeShape::ReferenceMap(ty) => Some(*ty),
            _ => None,
        }
    }
}

/// Either a live value or the key(s) needed to load it later.
#[derive(Debug, Clone)]
pub enum Link<R, K> {
    Resolved(R),
    Pending(K, Arc<dyn Resolver>),
}

/// A dynamically typed field value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Char(char),
    String(String),
    Binary(Vec<u8>),
    DateTime(DateTime<Utc>),
    ObjectId(ObjectId),
    Uuid(bson::Uuid),
    /// The variant name of an enum.
    Enum(String),
    /// A value that is already in its stored form.
    Raw(Bson),
    List(Vec<Value>),
    /// A generic ordered mapping; typed containers are rebuilt from it by [`Persist`].
    Map(Vec<(Value, Value)>),
    Object(ObjectRef),
    Reference(Link<ObjectRef, Key>),
    ReferenceList(Link<Vec<ObjectRef>, Vec<Key>>),
    ReferenceMap(Link<Vec<(String, ObjectRef)>, Vec<(String, Key)>>),
}

impl Value {
    /// A short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Double(_) => "double",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::DateTime(_) => "datetime",
            Value::ObjectId(_) => "objectId",
            Value::Uuid(_) => "uuid",
            Value::Enum(_) => "enum",
            Value::Raw(_) => "raw",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
            Value::Reference(_) => "reference",
            Value::ReferenceList(_) => "reference list",
            Value::ReferenceMap(_) => "reference map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` if this value does not identify anything when used as an identity.
    ///
    /// Null, zero integers, empty strings and the nil UUID count as unset, since those are
    /// the defaults of freshly allocated instances.
    pub fn is_unset_identity(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Int32(value) => *value == 0,
            Value::Int64(value) => *value == 0,
            Value::String(value) => value.is_empty(),
            Value::Uuid(value) => value.bytes() == [0; 16],
            _ => false,
        }
    }

    fn mismatch(self, expected: &str) -> MappingError {
        MappingError::type_mismatch(expected, self.kind())
    }
}

/// Conversion between a Rust type and the dynamic [`Value`] model.
///
/// Implemented for scalars, strings, date-times, identifiers, containers, optional values,
/// shared and polymorphic entities and the reference handles. `#[derive(Entity)]` and
/// `#[derive(MappedEnum)]` implement it for user types.
pub trait Persist: Sized + Send + Sync + 'static {
    /// The declared shape of this type.
    fn shape() -> TypeShape;

    /// Reads the value out of `self`.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented, e.g. a serde failure.
    fn to_value(&self) -> MappingResult<Value>;

    /// Rebuilds the type from a decoded value.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::TypeMismatch`] if the value has the wrong shape.
    fn from_value(value: Value) -> MappingResult<Self>;
}

impl Persist for bool {
    fn shape() -> TypeShape {
        TypeShape::Bool
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Bool(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Bool(value) => Ok(value),
            other => Err(other.mismatch("bool")),
        }
    }
}

impl Persist for i32 {
    fn shape() -> TypeShape {
        TypeShape::Int32
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Int32(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Int32(value) => Ok(value),
            Value::Int64(value) => {
                i32::try_from(value).map_err(|_| MappingError::type_mismatch("int32", "int64"))
            }
            other => Err(other.mismatch("int32")),
        }
    }
}

impl Persist for i64 {
    fn shape() -> TypeShape {
        TypeShape::Int64
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Int64(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Int64(value) => Ok(value),
            Value::Int32(value) => Ok(value.into()),
            other => Err(other.mismatch("int64")),
        }
    }
}

impl Persist for u32 {
    fn shape() -> TypeShape {
        TypeShape::Int64
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Int64((*self).into()))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        let value = i64::from_value(value)?;
        u32::try_from(value).map_err(|_| MappingError::type_mismatch("u32", value.to_string()))
    }
}

impl Persist for u64 {
    fn shape() -> TypeShape {
        TypeShape::Int64
    }

    fn to_value(&self) -> MappingResult<Value> {
        i64::try_from(*self)
            .map(Value::Int64)
            .map_err(|_| MappingError::UnsupportedType(format!("u64 value {self} exceeds int64")))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        let value = i64::from_value(value)?;
        u64::try_from(value).map_err(|_| MappingError::type_mismatch("u64", value.to_string()))
    }
}

impl Persist for f64 {
    fn shape() -> TypeShape {
        TypeShape::Double
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Double(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Double(value) => Ok(value),
            Value::Int32(value) => Ok(value.into()),
            Value::Int64(value) => Ok(value as f64),
            other => Err(other.mismatch("double")),
        }
    }
}

impl Persist for f32 {
    fn shape() -> TypeShape {
        TypeShape::Double
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Double((*self).into()))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        f64::from_value(value).map(|value| value as f32)
    }
}

impl Persist for char {
    fn shape() -> TypeShape {
        TypeShape::Char
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Char(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Char(value) => Ok(value),
            other => Err(other.mismatch("char")),
        }
    }
}

impl Persist for String {
    fn shape() -> TypeShape {
        TypeShape::String
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::String(self.clone()))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::String(value) => Ok(value),
            other => Err(other.mismatch("string")),
        }
    }
}

impl Persist for Vec<u8> {
    fn shape() -> TypeShape {
        TypeShape::Binary
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Binary(self.clone()))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Binary(bytes) => Ok(bytes),
            Value::Null => Ok(Vec::new()),
            other => Err(other.mismatch("binary")),
        }
    }
}

impl Persist for DateTime<Utc> {
    fn shape() -> TypeShape {
        TypeShape::DateTime
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::DateTime(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::DateTime(value) => Ok(value),
            other => Err(other.mismatch("datetime")),
        }
    }
}

impl Persist for ObjectId {
    fn shape() -> TypeShape {
        TypeShape::ObjectId
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::ObjectId(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::ObjectId(value) => Ok(value),
            other => Err(other.mismatch("objectId")),
        }
    }
}

impl Persist for bson::Uuid {
    fn shape() -> TypeShape {
        TypeShape::Uuid
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Uuid(*self))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Uuid(value) => Ok(value),
            other => Err(other.mismatch("uuid")),
        }
    }
}

impl Persist for uuid::Uuid {
    fn shape() -> TypeShape {
        TypeShape::Uuid
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Uuid(bson::Uuid::from_bytes(*self.as_bytes())))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        bson::Uuid::from_value(value).map(|value| uuid::Uuid::from_bytes(value.bytes()))
    }
}

impl<T: Persist> Persist for Option<T> {
    fn shape() -> TypeShape {
        TypeShape::Optional(Box::new(T::shape()))
    }

    fn to_value(&self) -> MappingResult<Value> {
        match self {
            Some(value) => value.to_value(),
            None => Ok(Value::Null),
        }
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

fn list_items(value: Value, expected: &str) -> MappingResult<Vec<Value>> {
    match value {
        Value::List(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        other => Err(other.mismatch(expected)),
    }
}

fn map_entries(value: Value, expected: &str) -> MappingResult<Vec<(Value, Value)>> {
    match value {
        Value::Map(entries) => Ok(entries),
        Value::Null => Ok(Vec::new()),
        other => Err(other.mismatch(expected)),
    }
}

impl<T: Persist> Persist for Vec<T> {
    fn shape() -> TypeShape {
        TypeShape::List(Box::new(T::shape()))
    }

    fn to_value(&self) -> MappingResult<Value> {
        self.iter()
            .map(Persist::to_value)
            .collect::<MappingResult<_>>()
            .map(Value::List)
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        list_items(value, "list")?
            .into_iter()
            .map(T::from_value)
            .collect()
    }
}

impl<T: Persist + Eq + Hash> Persist for HashSet<T> {
    fn shape() -> TypeShape {
        TypeShape::Set(Box::new(T::shape()))
    }

    fn to_value(&self) -> MappingResult<Value> {
        self.iter()
            .map(Persist::to_value)
            .collect::<MappingResult<_>>()
            .map(Value::List)
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        list_items(value, "set")?
            .into_iter()
            .map(T::from_value)
            .collect()
    }
}

impl<T: Persist + Ord> Persist for BTreeSet<T> {
    fn shape() -> TypeShape {
        TypeShape::Set(Box::new(T::shape()))
    }

    fn to_value(&self) -> MappingResult<Value> {
        self.iter()
            .map(Persist::to_value)
            .collect::<MappingResult<_>>()
            .map(Value::List)
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        list_items(value, "set")?
            .into_iter()
            .map(T::from_value)
            .collect()
    }
}

impl<K: Persist + Eq + Hash, V: Persist> Persist for HashMap<K, V> {
    fn shape() -> TypeShape {
        TypeShape::Map(Box::new(K::shape()), Box::new(V::shape()))
    }

    fn to_value(&self) -> MappingResult<Value> {
        self.iter()
            .map(|(key, value)| Ok((key.to_value()?, value.to_value()?)))
            .collect::<MappingResult<_>>()
            .map(Value::Map)
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        map_entries(value, "map")?
            .into_iter()
            .map(|(key, value)| Ok((K::from_value(key)?, V::from_value(value)?)))
            .collect()
    }
}

impl<K: Persist + Ord, V: Persist> Persist for BTreeMap<K, V> {
    fn shape() -> TypeShape {
        TypeShape::Map(Box::new(K::shape()), Box::new(V::shape()))
    }

    fn to_value(&self) -> MappingResult<Value> {
        self.iter()
            .map(|(key, value)| Ok((key.to_value()?, value.to_value()?)))
            .collect::<MappingResult<_>>()
            .map(Value::Map)
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        map_entries(value, "map")?
            .into_iter()
            .map(|(key, value)| Ok((K::from_value(key)?, V::from_value(value)?)))
            .collect()
    }
}

/// Stores any serde type as a nested BSON value.
///
/// Use this for value objects that have no mapping metadata of their own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Serialized<T>(pub T);

impl<T> Persist for Serialized<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn shape() -> TypeShape {
        TypeShape::Serialized
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Raw(serialize_to_bson(&self.0)?))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Raw(bson) => Ok(Serialized(deserialize_from_bson(bson)?)),
            other => Err(other.mismatch("serialized value")),
        }
    }
}

impl<T: Entity> Persist for Shared<T> {
    fn shape() -> TypeShape {
        TypeShape::Entity(EntityType::of::<T>())
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Object(self.clone()))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Object(object) => downcast_object(object),
            Value::Null => Ok(shared(T::default())),
            other => Err(other.mismatch(EntityType::of::<T>().name())),
        }
    }
}

impl Persist for ObjectRef {
    fn shape() -> TypeShape {
        TypeShape::Polymorphic
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Object(self.clone()))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Object(object) => Ok(object),
            other => Err(other.mismatch("object")),
        }
    }
}

/// An enum persisted by its variant name.
///
/// Implemented by `#[derive(MappedEnum)]`. The variant name is used regardless of any
/// `Display` implementation on the enum.
pub trait MappedEnum: Sized {
    fn variant_name(&self) -> &'static str;

    fn from_variant_name(name: &str) -> Option<Self>;
}

/// Converts an enum into its stored variant name.
pub fn enum_to_value<E: MappedEnum>(value: &E) -> Value {
    Value::Enum(value.variant_name().to_string())
}

/// Rebuilds an enum from its stored variant name.
///
/// # Errors
///
/// Returns [`MappingError::TypeMismatch`] for unknown names or non-enum values.
pub fn enum_from_value<E: MappedEnum>(value: Value) -> MappingResult<E> {
    let name = match value {
        Value::Enum(name) | Value::String(name) => name,
        other => return Err(other.mismatch(std::any::type_name::<E>())),
    };

    E::from_variant_name(&name)
        .ok_or_else(|| MappingError::type_mismatch(std::any::type_name::<E>(), name))
}

/// Copies an entity into a fresh instance for embedding by value.
pub fn embed<T: Entity>(entity: &T) -> Value {
    Value::Object(shared(entity.clone()))
}

/// Takes an embedded entity back out of a decoded value.
///
/// # Errors
///
/// Returns [`MappingError::TypeMismatch`] if the value holds an entity of another type.
pub fn unembed<T: Entity>(value: Value) -> MappingResult<T> {
    match value {
        Value::Object(object) => {
            let shared = downcast_object::<T>(object)?;

            match Arc::try_unwrap(shared) {
                Ok(lock) => Ok(lock.into_inner().unwrap_or_else(PoisonError::into_inner)),
                Err(shared) => Ok(shared
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()),
            }
        }
        Value::Null => Ok(T::default()),
        other => Err(other.mismatch(EntityType::of::<T>().name())),
    }
}

/// Recovers the typed handle behind a type-erased instance.
///
/// # Errors
///
/// Returns [`MappingError::TypeMismatch`] if the instance is of another type.
pub fn downcast_object<T: Entity>(object: ObjectRef) -> MappingResult<Shared<T>> {
    let found = object.entity_type().name();

    object
        .into_any()
        .downcast::<RwLock<T>>()
        .map_err(|_| MappingError::type_mismatch(EntityType::of::<T>().name(), found))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_shapes_exclude_entities_and_references() {
        assert!(<Vec<Option<String>>>::shape().is_store_native());
        assert!(<HashMap<i32, Vec<bool>>>::shape().is_store_native());
        assert!(!TypeShape::List(Box::new(TypeShape::Polymorphic)).is_store_native());
        assert!(TypeShape::List(Box::new(TypeShape::Polymorphic)).is_embeddable());
        assert!(!TypeShape::Custom("Money").is_embeddable());
    }

    #[test]
    fn containers_rebuild_from_generic_values() {
        let mut source = BTreeMap::new();
        source.insert(3_i32, vec!["a".to_string(), "b".to_string()]);
        source.insert(1_i32, vec![]);

        let value = source.to_value().unwrap();
        let rebuilt = <BTreeMap<i32, Vec<String>>>::from_value(value).unwrap();
        assert_eq!(rebuilt, source);

        let as_hash = <HashMap<i32, Vec<String>>>::from_value(source.to_value().unwrap()).unwrap();
        assert_eq!(as_hash.len(), 2);
        assert_eq!(as_hash[&3], vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn integers_widen_but_do_not_truncate() {
        assert_eq!(i64::from_value(Value::Int32(7)).unwrap(), 7);
        assert!(i32::from_value(Value::Int64(i64::MAX)).is_err());
        assert!(u32::from_value(Value::Int64(-1)).is_err());
        assert_eq!(<Option<i64>>::from_value(Value::Null).unwrap(), None);
    }

    #[test]
    fn uuids_convert_between_crates() {
        let id = uuid::Uuid::new_v4();
        let value = id.to_value().unwrap();

        assert!(matches!(value, Value::Uuid(_)));
        assert_eq!(uuid::Uuid::from_value(value).unwrap(), id);
    }

    #[test]
    fn unset_identities() {
        assert!(Value::Null.is_unset_identity());
        assert!(Value::Int64(0).is_unset_identity());
        assert!(Value::String(String::new()).is_unset_identity());
        assert!(uuid::Uuid::nil().to_value().unwrap().is_unset_identity());
        assert!(!Value::Int64(3).is_unset_identity());
        assert!(!Value::ObjectId(ObjectId::new()).is_unset_identity());
    }
}
