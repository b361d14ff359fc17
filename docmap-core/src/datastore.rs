//! Typed persistence on top of a backend.
//!
//! A [`Datastore`] pairs a [`StoreBackend`] with a [`Mapper`]. It saves entities (assigning
//! generated identities and enforcing optimistic locking on version fields), loads them
//! back with references resolved through the same backend, and deletes them.
//!
//! # Example
//!
//! ```ignore
//! use docmap::{Datastore, memory::InMemoryStore};
//!
//! let datastore = Datastore::new(InMemoryStore::new());
//!
//! let key = datastore.save(&mut user).await?;
//! let loaded = datastore.get::<User>(key.id().clone()).await?;
//! ```

use bson::{Bson, oid::ObjectId, spec::BinarySubtype};
use std::{any::Any, sync::Arc};
use tracing::debug;

use crate::{
    backend::{StoreBackend, VersionCheck},
    context::MappingContext,
    descriptor::{Entity, ID_KEY, TypeDescriptor},
    error::{MappingError, MappingResult},
    key::Key,
    mapper::{Mapper, unshare},
    value::{ObjectRef, Shared, TypeShape, Value, shared},
};

/// A typed view over a backend.
///
/// # Type Parameters
///
/// * `B` - The backend implementation type
#[derive(Debug)]
pub struct Datastore<B: StoreBackend + 'static> {
    backend: Arc<B>,
    mapper: Mapper,
}

impl<B: StoreBackend + 'static> Clone for Datastore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            mapper: self.mapper.clone(),
        }
    }
}

impl<B: StoreBackend + 'static> Datastore<B> {
    /// Creates a datastore with a default mapper.
    pub fn new(backend: B) -> Self {
        Self::with_mapper(backend, Mapper::new())
    }

    pub fn with_mapper(backend: B, mapper: Mapper) -> Self {
        Self {
            backend: Arc::new(backend),
            mapper,
        }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Creates a mapping context resolving references through this datastore's backend.
    pub fn context(&self) -> MappingContext {
        let source: Arc<dyn StoreBackend> = self.backend.clone();
        self.mapper.context_with(source)
    }

    /// Saves an entity and returns its key.
    ///
    /// An unset `ObjectId` identity is generated before writing. If the type has a version
    /// field, the stored version must equal the entity's current version and the entity's
    /// version is incremented once the save succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::ConcurrentModification`] if the stored version differs,
    /// [`MappingError::IdentityRequired`] if the entity has no identity after mapping, or any
    /// mapping error.
    pub async fn save<T: Entity>(&self, entity: &mut T) -> MappingResult<Key> {
        let instance = shared(std::mem::take(entity));
        let result = self.save_shared(&instance).await;
        *entity = unshare(instance);
        result
    }

    /// Saves a shared entity and returns its key.
    ///
    /// # Errors
    ///
    /// See [`Datastore::save`].
    pub async fn save_shared<T: Entity>(&self, entity: &Shared<T>) -> MappingResult<Key> {
        let descriptor = self.mapper.map::<T>()?;
        self.assign_generated_id(&descriptor, entity)?;

        let mut ctx = self.context();
        let mut document = self.mapper.to_document_shared(&mut ctx, entity)?;

        let id = match document.get(ID_KEY) {
            Some(id) if !is_unset(id) => id.clone(),
            _ => return Err(MappingError::IdentityRequired(descriptor.class_name().to_string())),
        };

        let check = match descriptor.version_field() {
            Some(field) => {
                let current = match document.get(field.stored_name()) {
                    Some(Bson::Int32(0)) | Some(Bson::Int64(0)) | Some(Bson::Null) | None => None,
                    Some(version @ (Bson::Int32(_) | Bson::Int64(_))) => Some(version.clone()),
                    Some(other) => {
                        return Err(MappingError::type_mismatch("integer version", other.to_string()));
                    }
                };

                let next = next_version(field.shape(), current.as_ref()).ok_or_else(|| {
                    MappingError::VersionOverflow(descriptor.class_name().to_string())
                })?;
                document.insert(field.stored_name(), next.clone());

                Some((
                    VersionCheck {
                        field: field.stored_name().to_string(),
                        expected: current,
                    },
                    next,
                ))
            }
            None => None,
        };

        let collection = descriptor.collection().to_string();
        let (check, next) = match check {
            Some((check, next)) => (Some(check), Some(next)),
            None => (None, None),
        };

        self.backend
            .save_document(&collection, document, check)
            .await?;

        if let Some(next) = next {
            self.apply_version(&descriptor, entity, next)?;
        }

        debug!(collection = %collection, id = %id, "saved entity");

        Ok(Key::new(collection, id))
    }

    fn assign_generated_id<T: Entity>(
        &self,
        descriptor: &TypeDescriptor,
        entity: &Shared<T>,
    ) -> MappingResult<()> {
        let Some(field) = descriptor.id_field() else {
            return Ok(());
        };
        if *field.shape().strip_optional() != TypeShape::ObjectId {
            return Ok(());
        }

        let object: ObjectRef = entity.clone();
        let mut unset = false;
        object.read_with(&mut |instance: &dyn Any| {
            unset = field.get(instance)?.is_unset_identity();
            Ok(())
        })?;

        if unset {
            self.mapper
                .update_key_info(entity, Bson::ObjectId(ObjectId::new()))?;
        }

        Ok(())
    }

    fn apply_version<T: Entity>(
        &self,
        descriptor: &TypeDescriptor,
        entity: &Shared<T>,
        next: Bson,
    ) -> MappingResult<()> {
        let Some(field) = descriptor.version_field() else {
            return Ok(());
        };

        let value = match next {
            Bson::Int32(version) => Value::Int32(version),
            Bson::Int64(version) => Value::Int64(version),
            other => return Err(MappingError::type_mismatch("integer version", other.to_string())),
        };

        let object: ObjectRef = entity.clone();
        let mut value = Some(value);
        object.write_with(&mut |instance: &mut dyn Any| match value.take() {
            Some(value) => field.set(instance, value),
            None => Ok(()),
        })
    }

    /// Loads an entity by identifier, resolving its references through this datastore.
    ///
    /// # Returns
    ///
    /// Returns `Ok(None)` if no such document exists.
    pub async fn get<T: Entity>(&self, id: impl Into<Bson> + Send) -> MappingResult<Option<Shared<T>>> {
        let mut ctx = self.context();
        self.get_in(&mut ctx, id).await
    }

    /// Loads an entity by identifier through a caller-owned context.
    ///
    /// Entities already read through `ctx` are reused, and warnings are left in `ctx`.
    pub async fn get_in<T: Entity>(
        &self,
        ctx: &mut MappingContext,
        id: impl Into<Bson> + Send,
    ) -> MappingResult<Option<Shared<T>>> {
        let descriptor = self.mapper.map::<T>()?;
        let id = id.into();

        match self
            .backend
            .fetch_document(descriptor.collection(), &id)
            .await?
        {
            Some(document) => self
                .mapper
                .from_document::<T>(ctx, &document)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    pub async fn exists<T: Entity>(&self, id: impl Into<Bson> + Send) -> MappingResult<bool> {
        let descriptor = self.mapper.map::<T>()?;
        self.backend
            .exists_document(descriptor.collection(), &id.into())
            .await
    }

    /// Deletes an entity by identifier.
    ///
    /// # Returns
    ///
    /// Returns `true` if a document was deleted.
    pub async fn delete<T: Entity>(&self, id: impl Into<Bson> + Send) -> MappingResult<bool> {
        let descriptor = self.mapper.map::<T>()?;
        self.backend
            .delete_document(descriptor.collection(), &id.into())
            .await
    }

    pub async fn shutdown(&self) -> MappingResult<()> {
        self.backend.shutdown().await
    }
}

fn is_unset(id: &Bson) -> bool {
    match id {
        Bson::Null | Bson::Int32(0) | Bson::Int64(0) => true,
        Bson::String(id) => id.is_empty(),
        Bson::Binary(binary) => {
            binary.subtype == BinarySubtype::Uuid && binary.bytes.iter().all(|byte| *byte == 0)
        }
        _ => false,
    }
}

/// Returns the version following `current`, keeping 32-bit fields 32-bit.
///
/// Returns `None` when the field's width holds no larger value.
fn next_version(shape: &TypeShape, current: Option<&Bson>) -> Option<Bson> {
    let current = match current {
        Some(Bson::Int32(version)) => i64::from(*version),
        Some(Bson::Int64(version)) => *version,
        _ => 0,
    };
    let next = current.checked_add(1)?;

    match shape.strip_optional() {
        TypeShape::Int32 => i32::try_from(next).ok().map(Bson::Int32),
        _ => Some(Bson::Int64(next)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_start_at_one_and_keep_their_width() {
        assert_eq!(next_version(&TypeShape::Int64, None), Some(Bson::Int64(1)));
        assert_eq!(
            next_version(&TypeShape::Int32, Some(&Bson::Int32(4))),
            Some(Bson::Int32(5))
        );
        assert_eq!(
            next_version(&TypeShape::Optional(Box::new(TypeShape::Int64)), Some(&Bson::Int32(2))),
            Some(Bson::Int64(3))
        );
    }

    #[test]
    fn versions_at_their_maximum_have_no_successor() {
        assert_eq!(next_version(&TypeShape::Int32, Some(&Bson::Int32(i32::MAX))), None);
        assert_eq!(next_version(&TypeShape::Int64, Some(&Bson::Int64(i64::MAX))), None);
        assert_eq!(
            next_version(&TypeShape::Int64, Some(&Bson::Int32(i32::MAX))),
            Some(Bson::Int64(i64::from(i32::MAX) + 1))
        );
    }
}
