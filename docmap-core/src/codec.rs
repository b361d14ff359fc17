//! The value codec chain.
//!
//! A [`Codec`] converts values of the shapes it accepts between their in-memory
//! [`Value`] form and their stored [`Bson`] form. Codecs are consulted in a fixed order
//! and the first one whose [`Codec::can_handle`] accepts a shape wins:
//!
//! 1. codecs declared by the entity class ([`DescriptorBuilder::codec`](crate::descriptor::DescriptorBuilder::codec))
//! 2. codecs registered on the mapper ([`MapperBuilder::codec`](crate::mapper::MapperBuilder::codec))
//! 3. the default chain returned by [`default_codecs`]
//!
//! Within the default chain exact-type codecs come before the structural ones for
//! optional values, collections and maps.

use bson::{Binary, Bson, Document, oid::ObjectId, spec::BinarySubtype};
use chrono::{DateTime, Utc};
use std::{fmt::Debug, sync::Arc};

use crate::{
    descriptor::FieldDescriptor,
    error::{MappingError, MappingResult},
    value::{TypeShape, Value},
};

/// A bidirectional converter between in-memory values and their stored form.
pub trait Codec: Send + Sync + Debug {
    /// Returns `true` if this codec converts values of `shape`.
    ///
    /// `field` is the field being mapped, if any, so codecs can be scoped to single fields.
    fn can_handle(&self, shape: &TypeShape, field: Option<&FieldDescriptor>) -> bool;

    /// Converts a value to its stored form.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::TypeMismatch`] if the value does not match the shape.
    fn encode(&self, value: Value, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Bson>;

    /// Converts a stored value back to its in-memory form.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::TypeMismatch`] if the stored value cannot be converted.
    fn decode(&self, bson: Bson, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Value>;
}

/// A view over the codec chain used for one field.
///
/// Structural codecs use it to convert their elements through the same chain.
#[derive(Debug, Clone, Copy)]
pub struct Codecs<'a> {
    class: &'a [Arc<dyn Codec>],
    custom: &'a [Arc<dyn Codec>],
    defaults: &'a [Arc<dyn Codec>],
    field: Option<&'a FieldDescriptor>,
}

impl<'a> Codecs<'a> {
    pub fn new(
        class: &'a [Arc<dyn Codec>],
        custom: &'a [Arc<dyn Codec>],
        defaults: &'a [Arc<dyn Codec>],
    ) -> Self {
        Self {
            class,
            custom,
            defaults,
            field: None,
        }
    }

    /// Scopes the chain to a field.
    pub fn for_field(self, field: &'a FieldDescriptor) -> Self {
        Self {
            field: Some(field),
            ..self
        }
    }

    pub fn field(&self) -> Option<&'a FieldDescriptor> {
        self.field
    }

    /// Returns the first codec accepting `shape`.
    pub fn find(&self, shape: &TypeShape) -> Option<&'a Arc<dyn Codec>> {
        self.class
            .iter()
            .chain(self.custom)
            .chain(self.defaults)
            .find(|codec| codec.can_handle(shape, self.field))
    }

    /// Encodes a value through the first codec accepting `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::UnsupportedType`] if no codec accepts the shape.
    pub fn encode(&self, value: Value, shape: &TypeShape) -> MappingResult<Bson> {
        self.find(shape)
            .ok_or_else(|| unsupported(shape))?
            .encode(value, shape, *self)
    }

    /// Decodes a stored value through the first codec accepting `shape`.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::UnsupportedType`] if no codec accepts the shape.
    pub fn decode(&self, bson: Bson, shape: &TypeShape) -> MappingResult<Value> {
        self.find(shape)
            .ok_or_else(|| unsupported(shape))?
            .decode(bson, shape, *self)
    }
}

fn unsupported(shape: &TypeShape) -> MappingError {
    MappingError::UnsupportedType(format!("{shape:?}"))
}

fn mismatch(shape: &TypeShape, found: impl ToString) -> MappingError {
    MappingError::type_mismatch(format!("{shape:?}"), found.to_string())
}

/// Returns the default codec chain, in priority order.
pub fn default_codecs() -> Vec<Arc<dyn Codec>> {
    vec![
        Arc::new(PrimitiveCodec),
        Arc::new(CharCodec),
        Arc::new(DateTimeCodec),
        Arc::new(ObjectIdCodec),
        Arc::new(UuidCodec),
        Arc::new(ByteArrayCodec),
        Arc::new(EnumCodec),
        Arc::new(SerializedCodec),
        Arc::new(OptionalCodec),
        Arc::new(CollectionCodec),
        Arc::new(MapOfValuesCodec),
    ]
}

/// Booleans, 32/64-bit integers, doubles and strings.
///
/// Decoding accepts the string form of each scalar, which is how map keys are stored.
#[derive(Debug, Default)]
pub struct PrimitiveCodec;

impl Codec for PrimitiveCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        matches!(
            shape,
            TypeShape::Bool
                | TypeShape::Int32
                | TypeShape::Int64
                | TypeShape::Double
                | TypeShape::String
        )
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match (shape, value) {
            (TypeShape::Bool, Value::Bool(value)) => Ok(Bson::Boolean(value)),
            (TypeShape::Int32, Value::Int32(value)) => Ok(Bson::Int32(value)),
            (TypeShape::Int64, Value::Int64(value)) => Ok(Bson::Int64(value)),
            (TypeShape::Int64, Value::Int32(value)) => Ok(Bson::Int64(value.into())),
            (TypeShape::Double, Value::Double(value)) => Ok(Bson::Double(value)),
            (TypeShape::String, Value::String(value)) => Ok(Bson::String(value)),
            (_, Value::Null) => Ok(Bson::Null),
            (shape, other) => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        let decoded = match (shape, &bson) {
            (TypeShape::Bool, Bson::Boolean(value)) => Some(Value::Bool(*value)),
            (TypeShape::Bool, Bson::String(text)) => text.parse().ok().map(Value::Bool),
            (TypeShape::Int32, Bson::Int32(value)) => Some(Value::Int32(*value)),
            (TypeShape::Int32, Bson::Int64(value)) => {
                i32::try_from(*value).ok().map(Value::Int32)
            }
            (TypeShape::Int32, Bson::String(text)) => text.parse().ok().map(Value::Int32),
            (TypeShape::Int64, Bson::Int64(value)) => Some(Value::Int64(*value)),
            (TypeShape::Int64, Bson::Int32(value)) => Some(Value::Int64((*value).into())),
            (TypeShape::Int64, Bson::String(text)) => text.parse().ok().map(Value::Int64),
            (TypeShape::Double, Bson::Double(value)) => Some(Value::Double(*value)),
            (TypeShape::Double, Bson::Int32(value)) => Some(Value::Double((*value).into())),
            (TypeShape::Double, Bson::Int64(value)) => Some(Value::Double(*value as f64)),
            (TypeShape::Double, Bson::String(text)) => text.parse().ok().map(Value::Double),
            (TypeShape::String, Bson::String(text)) => Some(Value::String(text.clone())),
            (TypeShape::String, Bson::Symbol(text)) => Some(Value::String(text.clone())),
            (_, Bson::Null) => Some(Value::Null),
            _ => None,
        };

        decoded.ok_or_else(|| mismatch(shape, bson))
    }
}

/// Single characters, stored as one-character strings.
#[derive(Debug, Default)]
pub struct CharCodec;

impl Codec for CharCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::Char
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::Char(value) => Ok(Bson::String(value.to_string())),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match &bson {
            Bson::String(text) => {
                let mut chars = text.chars();
                match (chars.next(), chars.next()) {
                    (Some(value), None) => Ok(Value::Char(value)),
                    _ => Err(mismatch(shape, &bson)),
                }
            }
            Bson::Int32(code) => u32::try_from(*code)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Char)
                .ok_or_else(|| mismatch(shape, &bson)),
            Bson::Null => Ok(Value::Null),
            _ => Err(mismatch(shape, &bson)),
        }
    }
}

/// UTC date-times, stored as BSON dates with millisecond precision.
#[derive(Debug, Default)]
pub struct DateTimeCodec;

impl Codec for DateTimeCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::DateTime
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::DateTime(value) => Ok(Bson::DateTime(bson::DateTime::from_chrono(value))),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match &bson {
            Bson::DateTime(value) => Ok(Value::DateTime(value.to_chrono())),
            Bson::String(text) => DateTime::parse_from_rfc3339(text)
                .map(|value| Value::DateTime(value.with_timezone(&Utc)))
                .map_err(|_| mismatch(shape, &bson)),
            Bson::Null => Ok(Value::Null),
            _ => Err(mismatch(shape, &bson)),
        }
    }
}

#[derive(Debug, Default)]
pub struct ObjectIdCodec;

impl Codec for ObjectIdCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::ObjectId
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::ObjectId(value) => Ok(Bson::ObjectId(value)),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match &bson {
            Bson::ObjectId(value) => Ok(Value::ObjectId(*value)),
            Bson::String(text) => ObjectId::parse_str(text)
                .map(Value::ObjectId)
                .map_err(|_| mismatch(shape, &bson)),
            Bson::Null => Ok(Value::Null),
            _ => Err(mismatch(shape, &bson)),
        }
    }
}

/// UUIDs, stored as binary subtype 4.
#[derive(Debug, Default)]
pub struct UuidCodec;

impl Codec for UuidCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::Uuid
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::Uuid(value) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: value.bytes().to_vec(),
            })),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match &bson {
            Bson::Binary(binary) if binary.subtype == BinarySubtype::Uuid => {
                <[u8; 16]>::try_from(binary.bytes.as_slice())
                    .map(|bytes| Value::Uuid(bson::Uuid::from_bytes(bytes)))
                    .map_err(|_| mismatch(shape, "binary of wrong length"))
            }
            Bson::String(text) => bson::Uuid::parse_str(text)
                .map(Value::Uuid)
                .map_err(|_| mismatch(shape, &bson)),
            Bson::Null => Ok(Value::Null),
            _ => Err(mismatch(shape, &bson)),
        }
    }
}

/// Byte arrays, passed through unchanged as generic binary.
#[derive(Debug, Default)]
pub struct ByteArrayCodec;

impl Codec for ByteArrayCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::Binary
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::Binary(bytes) => Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Generic,
                bytes,
            })),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match bson {
            Bson::Binary(binary) => Ok(Value::Binary(binary.bytes)),
            Bson::Null => Ok(Value::Null),
            other => Err(mismatch(shape, other)),
        }
    }
}

/// Enums, stored by variant name.
#[derive(Debug, Default)]
pub struct EnumCodec;

impl Codec for EnumCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        matches!(shape, TypeShape::Enum(_))
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::Enum(name) => Ok(Bson::String(name)),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match bson {
            Bson::String(name) => Ok(Value::Enum(name)),
            Bson::Null => Ok(Value::Null),
            other => Err(mismatch(shape, other)),
        }
    }
}

/// Serde values, already in BSON form.
#[derive(Debug, Default)]
pub struct SerializedCodec;

impl Codec for SerializedCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::Serialized
    }

    fn encode(&self, value: Value, shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::Raw(bson) => Ok(bson),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        Ok(Value::Raw(bson))
    }
}

/// Optional native values. Absent values are stored as null.
#[derive(Debug, Default)]
pub struct OptionalCodec;

impl Codec for OptionalCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        matches!(shape, TypeShape::Optional(_)) && shape.is_store_native()
    }

    fn encode(&self, value: Value, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Bson> {
        match (shape, value) {
            (_, Value::Null) => Ok(Bson::Null),
            (TypeShape::Optional(inner), value) => codecs.encode(value, inner),
            (shape, _) => Err(unsupported(shape)),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Value> {
        match (shape, bson) {
            (_, Bson::Null) => Ok(Value::Null),
            (TypeShape::Optional(inner), bson) => codecs.decode(bson, inner),
            (shape, _) => Err(unsupported(shape)),
        }
    }
}

/// Lists and sets of native values, stored as arrays.
///
/// A single stored value where a collection is expected decodes as a one-element list.
#[derive(Debug, Default)]
pub struct CollectionCodec;

impl Codec for CollectionCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        shape.element().is_some() && shape.is_store_native()
    }

    fn encode(&self, value: Value, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Bson> {
        let element = shape.element().ok_or_else(|| unsupported(shape))?;

        match value {
            Value::List(items) => items
                .into_iter()
                .map(|item| codecs.encode(item, element))
                .collect::<MappingResult<_>>()
                .map(Bson::Array),
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Value> {
        let element = shape.element().ok_or_else(|| unsupported(shape))?;

        match bson {
            Bson::Array(items) => items
                .into_iter()
                .map(|item| codecs.decode(item, element))
                .collect::<MappingResult<_>>()
                .map(Value::List),
            Bson::Null => Ok(Value::Null),
            single => Ok(Value::List(vec![codecs.decode(single, element)?])),
        }
    }
}

/// Maps of native keys and values, stored as sub-documents keyed by the string form of
/// each key.
#[derive(Debug, Default)]
pub struct MapOfValuesCodec;

impl Codec for MapOfValuesCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        matches!(shape, TypeShape::Map(..)) && shape.is_store_native()
    }

    fn encode(&self, value: Value, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Bson> {
        let TypeShape::Map(key_shape, value_shape) = shape else {
            return Err(unsupported(shape));
        };

        match value {
            Value::Map(entries) => {
                let mut document = Document::new();
                for (key, value) in entries {
                    let key = key_string(codecs.encode(key, key_shape)?)?;
                    document.insert(key, codecs.encode(value, value_shape)?);
                }
                Ok(Bson::Document(document))
            }
            Value::Null => Ok(Bson::Null),
            other => Err(mismatch(shape, other.kind())),
        }
    }

    fn decode(&self, bson: Bson, shape: &TypeShape, codecs: Codecs<'_>) -> MappingResult<Value> {
        let TypeShape::Map(key_shape, value_shape) = shape else {
            return Err(unsupported(shape));
        };

        match bson {
            Bson::Document(document) => document
                .into_iter()
                .map(|(key, value)| {
                    Ok((
                        codecs.decode(Bson::String(key), key_shape)?,
                        codecs.decode(value, value_shape)?,
                    ))
                })
                .collect::<MappingResult<_>>()
                .map(Value::Map),
            Bson::Null => Ok(Value::Null),
            other => Err(mismatch(shape, other)),
        }
    }
}

/// Converts an encoded map key to the string it is stored under.
///
/// # Errors
///
/// Returns [`MappingError::UnsupportedType`] for keys without a string form.
pub fn key_string(key: Bson) -> MappingResult<String> {
    match key {
        Bson::String(key) => Ok(key),
        Bson::Int32(key) => Ok(key.to_string()),
        Bson::Int64(key) => Ok(key.to_string()),
        Bson::Double(key) => Ok(key.to_string()),
        Bson::Boolean(key) => Ok(key.to_string()),
        Bson::ObjectId(key) => Ok(key.to_hex()),
        other => Err(MappingError::UnsupportedType(format!(
            "map key of type {:?}",
            other.element_type()
        ))),
    }
}
