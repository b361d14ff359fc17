//! The mapping engine.
//!
//! A [`Mapper`] turns entity graphs into BSON documents and back. For every entity it
//! fetches the [`TypeDescriptor`] from its registry and walks the fields in declaration
//! order, dispatching each one by role:
//!
//! 1. the identity field, stored as `_id`
//! 2. reference fields, stored as pointers (see [`crate::reference`])
//! 3. embedded fields whose shape is not store-native (see [`crate::embedded`])
//! 4. plain values, version fields and any other store-native field, through the codec chain
//! 5. anything else is skipped with a warning
//!
//! Writes run `pre_persist` hooks, map the fields, then run `pre_save` hooks. Reads allocate
//! the instance, register it in the context's identity cache, run `pre_load` hooks, map
//! the fields and finally run `post_load` hooks. Entity hooks always run before the
//! mapper's interceptors.
//!
//! # Example
//!
//! ```ignore
//! use docmap::{Mapper, MappingContext};
//!
//! let mapper = Mapper::builder().store_nulls(true).build();
//! mapper.map::<User>()?;
//!
//! let document = mapper.to_document(&mut user)?;
//! let mut ctx = mapper.context();
//! let copy = mapper.from_document::<User>(&mut ctx, &document).await?;
//! ```

use bson::{Bson, Document};
use futures::{FutureExt, future::BoxFuture};
use serde::{Deserialize, Serialize};
use std::{
    any::Any,
    fmt,
    sync::{Arc, PoisonError},
};

use crate::{
    backend::StoreBackend,
    codec::{Codec, Codecs, default_codecs},
    context::MappingContext,
    descriptor::{
        CLASS_NAME_KEY, Entity, EntityType, FieldDescriptor, FieldRole, ID_KEY, LifecyclePhase,
        ReferenceOptions, TypeDescriptor, object_address, simple_name,
    },
    error::{MappingError, MappingResult},
    key::{Key, same_id},
    registry::ClassRegistry,
    value::{ObjectRef, Shared, TypeShape, Value, downcast_object, shared},
};

/// Flags consumed by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperOptions {
    /// Write null-valued fields instead of omitting them.
    pub store_nulls: bool,
    /// Write empty lists and maps instead of omitting them.
    pub store_empties: bool,
    /// Build unresolved handles for lazy reference fields. When disabled, lazy fields are
    /// loaded eagerly unless they demand lazy semantics.
    pub lazy_references: bool,
}

impl Default for MapperOptions {
    fn default() -> Self {
        Self {
            store_nulls: false,
            store_empties: false,
            lazy_references: true,
        }
    }
}

impl MapperOptions {
    /// Parses options from JSON. Missing keys take their default values.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Serialization`] for malformed input.
    pub fn from_json(json: &str) -> MappingResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A cross-cutting hook invoked for every mapped object, after the object's own hooks.
///
/// All methods default to doing nothing.
pub trait EntityInterceptor: Send + Sync {
    fn pre_persist(&self, _descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {}

    fn pre_save(&self, _descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {}

    fn pre_load(&self, _descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {}

    fn post_load(&self, _descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {}
}

/// Builder for [`Mapper`].
#[derive(Default)]
pub struct MapperBuilder {
    options: MapperOptions,
    codecs: Vec<Arc<dyn Codec>>,
    interceptors: Vec<Arc<dyn EntityInterceptor>>,
}

impl MapperBuilder {
    pub fn options(mut self, options: MapperOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store_nulls(mut self, store_nulls: bool) -> Self {
        self.options.store_nulls = store_nulls;
        self
    }

    pub fn store_empties(mut self, store_empties: bool) -> Self {
        self.options.store_empties = store_empties;
        self
    }

    pub fn lazy_references(mut self, lazy_references: bool) -> Self {
        self.options.lazy_references = lazy_references;
        self
    }

    /// Registers a codec consulted after class-level codecs and before the defaults.
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codecs.push(Arc::new(codec));
        self
    }

    /// Appends an interceptor. Interceptors run in registration order.
    pub fn interceptor(mut self, interceptor: impl EntityInterceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> Mapper {
        Mapper {
            inner: Arc::new(MapperInner {
                registry: ClassRegistry::new(),
                options: self.options,
                codecs: self.codecs,
                defaults: default_codecs(),
                interceptors: self.interceptors,
            }),
        }
    }
}

struct MapperInner {
    registry: ClassRegistry,
    options: MapperOptions,
    codecs: Vec<Arc<dyn Codec>>,
    defaults: Vec<Arc<dyn Codec>>,
    interceptors: Vec<Arc<dyn EntityInterceptor>>,
}

/// Converts entities to documents and back. Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Mapper {
    inner: Arc<MapperInner>,
}

impl Default for Mapper {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("options", &self.inner.options)
            .field("codecs", &self.inner.codecs)
            .field("interceptors", &self.inner.interceptors.len())
            .finish()
    }
}

/// How a field is mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Identity,
    Reference(ReferenceOptions),
    Embedded,
    Value,
    Unmapped,
    Skip,
}

impl Mapper {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> MapperBuilder {
        MapperBuilder::default()
    }

    pub fn with_options(options: MapperOptions) -> Self {
        Self::builder().options(options).build()
    }

    pub fn options(&self) -> &MapperOptions {
        &self.inner.options
    }

    pub fn registry(&self) -> &ClassRegistry {
        &self.inner.registry
    }

    /// Registers and validates an entity type ahead of use.
    ///
    /// Types are also registered on first use, but polymorphic reads can only resolve the
    /// `className` of types that are registered already.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Validation`] if the type is structurally invalid.
    pub fn map<T: Entity>(&self) -> MappingResult<Arc<TypeDescriptor>> {
        self.descriptor(EntityType::of::<T>())
    }

    /// Returns the descriptor of a type, building it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Validation`] if the type is structurally invalid.
    pub fn descriptor(&self, entity_type: EntityType) -> MappingResult<Arc<TypeDescriptor>> {
        self.inner.registry.get_or_build(entity_type)
    }

    /// Creates a context without a store; reference fields cannot be read through it.
    pub fn context(&self) -> MappingContext {
        MappingContext::new()
    }

    /// Creates a context resolving references through `source`.
    pub fn context_with(&self, source: Arc<dyn StoreBackend>) -> MappingContext {
        MappingContext::with_source(source)
    }

    /// Returns the codec chain for fields of the described class.
    pub fn codecs_for<'a>(&'a self, descriptor: &'a TypeDescriptor) -> Codecs<'a> {
        Codecs::new(descriptor.codecs(), &self.inner.codecs, &self.inner.defaults)
    }

    /// Returns the key of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::IdentityRequired`] if the type has no identity field or the
    /// identity is unset.
    pub fn key_of<T: Entity>(&self, entity: &T) -> MappingResult<Key> {
        let descriptor = self.map::<T>()?;
        self.key_from(&descriptor, entity)
    }

    /// Returns the key of a type-erased instance.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::IdentityRequired`] if the type has no identity field or the
    /// identity is unset.
    pub fn key_of_object(&self, object: &ObjectRef) -> MappingResult<Key> {
        let descriptor = self.descriptor(object.entity_type())?;
        let mut key = None;

        object.read_with(&mut |entity: &dyn Any| {
            key = Some(self.key_from(&descriptor, entity)?);
            Ok(())
        })?;

        key.ok_or_else(|| MappingError::IdentityRequired(descriptor.class_name().to_string()))
    }

    fn key_from(&self, descriptor: &TypeDescriptor, entity: &dyn Any) -> MappingResult<Key> {
        let required = || MappingError::IdentityRequired(descriptor.class_name().to_string());
        let field = descriptor.id_field().ok_or_else(required)?;

        let id = field.get(entity)?;
        if id.is_unset_identity() {
            return Err(required());
        }

        let id = self
            .codecs_for(descriptor)
            .for_field(field)
            .encode(id, field.shape())?;

        Ok(Key::new(descriptor.collection(), id))
    }

    /// Converts an entity into a document.
    ///
    /// Hooks may modify the entity; the modified entity is left in place.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while mapping a field, wrapped in
    /// [`MappingError::Field`].
    pub fn to_document<T: Entity>(&self, entity: &mut T) -> MappingResult<Document> {
        let mut ctx = self.context();
        self.to_document_in(&mut ctx, entity)
    }

    /// Converts an entity into a document, recording warnings in `ctx`.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while mapping a field.
    pub fn to_document_in<T: Entity>(
        &self,
        ctx: &mut MappingContext,
        entity: &mut T,
    ) -> MappingResult<Document> {
        let instance = shared(std::mem::take(entity));
        let result = self.to_document_shared(ctx, &instance);
        *entity = unshare(instance);
        result
    }

    /// Converts a shared entity into a document.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while mapping a field.
    pub fn to_document_shared<T: Entity>(
        &self,
        ctx: &mut MappingContext,
        entity: &Shared<T>,
    ) -> MappingResult<Document> {
        let object: ObjectRef = entity.clone();
        let result = self.write_object(ctx, &object);
        ctx.written.clear();
        result
    }

    /// Reads a document into a new instance of `T`.
    ///
    /// Instances are registered in the context's identity cache under their key, so reading
    /// the same document twice in one context yields the same instance.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while mapping a field, wrapped in
    /// [`MappingError::Field`].
    pub async fn from_document<T: Entity>(
        &self,
        ctx: &mut MappingContext,
        document: &Document,
    ) -> MappingResult<Shared<T>> {
        let object = self
            .read_object(ctx, document, Some(EntityType::of::<T>()))
            .await?;

        downcast_object(object)
    }

    /// Reads a document into an existing instance.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::IdentityMismatch`] (wrapped in [`MappingError::Field`]) if
    /// the instance already carries a different identity than the document.
    pub async fn read_into<T: Entity>(
        &self,
        ctx: &mut MappingContext,
        entity: &Shared<T>,
        document: &Document,
    ) -> MappingResult<()> {
        let descriptor = self.map::<T>()?;
        let object: ObjectRef = entity.clone();

        if let Some(key) = document_key(&descriptor, document) {
            ctx.register(key, object.clone());
        }

        self.read_fields(ctx, &object, &descriptor, document).await
    }

    /// Applies an identity value to an entity.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::IdentityMismatch`] if the entity already carries a different,
    /// non-null identity, and [`MappingError::IdentityRequired`] if the type has no
    /// identity field.
    pub fn update_key_info<T: Entity>(&self, entity: &Shared<T>, id: Bson) -> MappingResult<()> {
        let descriptor = self.map::<T>()?;
        let field = descriptor
            .id_field()
            .ok_or_else(|| MappingError::IdentityRequired(descriptor.class_name().to_string()))?;

        let value = self
            .codecs_for(&descriptor)
            .for_field(field)
            .decode(id.clone(), field.shape())?;
        let object: ObjectRef = entity.clone();

        self.apply_identity(&object, &descriptor, field, &id, value)
    }

    fn apply_identity(
        &self,
        object: &ObjectRef,
        descriptor: &TypeDescriptor,
        field: &FieldDescriptor,
        incoming: &Bson,
        value: Value,
    ) -> MappingResult<()> {
        let mut existing = Value::Null;
        object.read_with(&mut |entity: &dyn Any| {
            existing = field.get(entity)?;
            Ok(())
        })?;

        if !existing.is_unset_identity() {
            let existing = self
                .codecs_for(descriptor)
                .for_field(field)
                .encode(existing, field.shape())?;

            if !same_id(&existing, incoming) {
                return Err(MappingError::IdentityMismatch {
                    class: descriptor.class_name().to_string(),
                    existing: existing.to_string(),
                    incoming: incoming.to_string(),
                });
            }
        }

        assign(object, field, value)
    }

    pub(crate) fn dispatch(&self, field: &FieldDescriptor, codecs: Codecs<'_>) -> Dispatch {
        let shape = field.shape();

        match field.role() {
            FieldRole::Transient => Dispatch::Skip,
            FieldRole::Id => Dispatch::Identity,
            FieldRole::Reference(options) => Dispatch::Reference(options),
            FieldRole::Auto if shape.is_reference() => {
                Dispatch::Reference(ReferenceOptions::default())
            }
            FieldRole::Embedded | FieldRole::Auto
                if !shape.is_store_native() && shape.is_embeddable() =>
            {
                Dispatch::Embedded
            }
            _ if codecs.find(shape).is_some() => Dispatch::Value,
            _ if shape.is_embeddable() => Dispatch::Embedded,
            _ => Dispatch::Unmapped,
        }
    }

    fn run_hooks(
        &self,
        descriptor: &TypeDescriptor,
        phase: LifecyclePhase,
        entity: &mut dyn Any,
        document: &mut Document,
    ) -> MappingResult<()> {
        for hook in descriptor.hooks(phase) {
            hook(&mut *entity, &mut *document)?;
        }

        for interceptor in &self.inner.interceptors {
            match phase {
                LifecyclePhase::PrePersist => interceptor.pre_persist(descriptor, entity, document),
                LifecyclePhase::PreSave => interceptor.pre_save(descriptor, entity, document),
                LifecyclePhase::PreLoad => interceptor.pre_load(descriptor, entity, document),
                LifecyclePhase::PostLoad => interceptor.post_load(descriptor, entity, document),
            }
        }

        Ok(())
    }

    /// Writes one object, reusing its document if it was written earlier in this operation.
    pub(crate) fn write_object(
        &self,
        ctx: &mut MappingContext,
        object: &ObjectRef,
    ) -> MappingResult<Document> {
        let address = object_address(object);
        if let Some((_, document)) = ctx.written.get(&address) {
            return Ok(document.clone());
        }

        let descriptor = self.descriptor(object.entity_type())?;

        ctx.in_flight.insert(address);
        let result = self.write_fields(ctx, object, &descriptor);
        ctx.in_flight.remove(&address);

        let document = result?;
        ctx.written
            .insert(address, (object.clone(), document.clone()));

        Ok(document)
    }

    fn write_fields(
        &self,
        ctx: &mut MappingContext,
        object: &ObjectRef,
        descriptor: &TypeDescriptor,
    ) -> MappingResult<Document> {
        let mut document = Document::new();

        object.write_with(&mut |entity: &mut dyn Any| {
            self.run_hooks(descriptor, LifecyclePhase::PrePersist, entity, &mut document)
        })?;

        let mut values = Vec::with_capacity(descriptor.fields().len());
        object.read_with(&mut |entity: &dyn Any| {
            for field in descriptor.fields() {
                if field.role() != FieldRole::Transient {
                    let value = field
                        .get(entity)
                        .map_err(|err| field_error(descriptor, field, err))?;
                    values.push((field, value));
                }
            }
            Ok(())
        })?;

        if descriptor.stores_class_name() {
            document.insert(CLASS_NAME_KEY, descriptor.class_name());
        }

        let codecs = self.codecs_for(descriptor);
        for (field, value) in values {
            let written = self
                .write_field(ctx, descriptor, field, value, codecs.for_field(field))
                .map_err(|err| field_error(descriptor, field, err))?;

            if let Some(bson) = written {
                if self.should_store(field, &bson) {
                    document.insert(field.stored_name(), bson);
                }
            }
        }

        object.write_with(&mut |entity: &mut dyn Any| {
            self.run_hooks(descriptor, LifecyclePhase::PreSave, entity, &mut document)
        })?;

        Ok(document)
    }

    fn write_field(
        &self,
        ctx: &mut MappingContext,
        descriptor: &TypeDescriptor,
        field: &FieldDescriptor,
        value: Value,
        codecs: Codecs<'_>,
    ) -> MappingResult<Option<Bson>> {
        match self.dispatch(field, codecs) {
            Dispatch::Skip => Ok(None),
            Dispatch::Identity if value.is_null() => Ok(None),
            Dispatch::Identity | Dispatch::Value => codecs.encode(value, field.shape()).map(Some),
            Dispatch::Reference(_) => self.write_reference(value),
            Dispatch::Embedded => {
                self.write_embedded(ctx, value, field.shape(), codecs, &qualified(descriptor, field))
            }
            Dispatch::Unmapped => {
                ctx.warn(
                    qualified(descriptor, field),
                    format!("no codec or mapper handles {:?}; field skipped", field.shape()),
                );
                Ok(None)
            }
        }
    }

    fn should_store(&self, field: &FieldDescriptor, bson: &Bson) -> bool {
        let is_container = matches!(
            field.shape().strip_optional(),
            TypeShape::List(_)
                | TypeShape::Set(_)
                | TypeShape::Map(..)
                | TypeShape::ReferenceList(_)
                | TypeShape::ReferenceMap(_)
        );

        match bson {
            Bson::Null => self.inner.options.store_nulls,
            Bson::Array(items) if is_container && items.is_empty() => {
                self.inner.options.store_empties
            }
            Bson::Document(entries) if is_container && entries.is_empty() => {
                self.inner.options.store_empties
            }
            _ => true,
        }
    }

    /// Reads one document, reusing the cached instance if its key was seen before.
    ///
    /// `declared` is the statically known type; without it the type is looked up by the
    /// document's `className`.
    pub(crate) fn read_object<'a>(
        &'a self,
        ctx: &'a mut MappingContext,
        document: &'a Document,
        declared: Option<EntityType>,
    ) -> BoxFuture<'a, MappingResult<ObjectRef>> {
        async move {
            let entity_type = self.resolve_type(document, declared)?;
            let descriptor = self.descriptor(entity_type)?;
            let key = document_key(&descriptor, document);

            if let Some(cached) = key.as_ref().and_then(|key| ctx.cached(key)) {
                return Ok(cached.clone());
            }

            let object = entity_type.instantiate();
            if let Some(key) = key {
                ctx.register(key, object.clone());
            }

            self.read_fields(ctx, &object, &descriptor, document).await?;

            Ok(object)
        }
        .boxed()
    }

    fn resolve_type(
        &self,
        document: &Document,
        declared: Option<EntityType>,
    ) -> MappingResult<EntityType> {
        if let Some(declared) = declared {
            return Ok(declared);
        }

        match document.get(CLASS_NAME_KEY) {
            Some(Bson::String(class_name)) => self
                .inner
                .registry
                .by_class_name(class_name)
                .ok_or_else(|| MappingError::UnknownClass(class_name.clone())),
            _ => Err(MappingError::UnknownClass(format!(
                "document without {CLASS_NAME_KEY}"
            ))),
        }
    }

    async fn read_fields(
        &self,
        ctx: &mut MappingContext,
        object: &ObjectRef,
        descriptor: &TypeDescriptor,
        document: &Document,
    ) -> MappingResult<()> {
        let mut document = document.clone();

        object.write_with(&mut |entity: &mut dyn Any| {
            self.run_hooks(descriptor, LifecyclePhase::PreLoad, entity, &mut document)
        })?;

        let codecs = self.codecs_for(descriptor);
        for field in descriptor.fields() {
            self.read_field(ctx, object, descriptor, field, &document, codecs.for_field(field))
                .await
                .map_err(|err| field_error(descriptor, field, err))?;
        }

        object.write_with(&mut |entity: &mut dyn Any| {
            self.run_hooks(descriptor, LifecyclePhase::PostLoad, entity, &mut document)
        })
    }

    async fn read_field(
        &self,
        ctx: &mut MappingContext,
        object: &ObjectRef,
        descriptor: &TypeDescriptor,
        field: &FieldDescriptor,
        document: &Document,
        codecs: Codecs<'_>,
    ) -> MappingResult<()> {
        let dispatch = self.dispatch(field, codecs);
        let Some(stored) = document.get(field.stored_name()) else {
            return Ok(());
        };

        let stored = stored.clone();
        if stored == Bson::Null && !matches!(field.shape(), TypeShape::Optional(_)) {
            return Ok(());
        }

        match dispatch {
            Dispatch::Skip => Ok(()),
            Dispatch::Unmapped => {
                ctx.warn(
                    qualified(descriptor, field),
                    format!("no codec or mapper handles {:?}; field skipped", field.shape()),
                );
                Ok(())
            }
            Dispatch::Identity => {
                let value = codecs.decode(stored.clone(), field.shape())?;
                self.apply_identity(object, descriptor, field, &stored, value)
            }
            Dispatch::Value => {
                let value = codecs.decode(stored, field.shape())?;
                assign(object, field, value)
            }
            Dispatch::Embedded => {
                let name = qualified(descriptor, field);
                let value = self
                    .read_embedded(ctx, stored, field.shape(), codecs, &name)
                    .await?;
                assign(object, field, value)
            }
            Dispatch::Reference(options) => {
                let name = qualified(descriptor, field);
                let value = self
                    .read_reference(ctx, stored, field.shape(), options, &name)
                    .await?;

                match value {
                    Some(value) => assign(object, field, value),
                    None => Ok(()),
                }
            }
        }
    }
}

/// Returns the key a document is addressed by, if its type has an identity.
fn document_key(descriptor: &TypeDescriptor, document: &Document) -> Option<Key> {
    descriptor.id_field()?;

    match document.get(ID_KEY) {
        Some(Bson::Null) | None => None,
        Some(id) => Some(Key::new(descriptor.collection(), id.clone())),
    }
}

fn assign(object: &ObjectRef, field: &FieldDescriptor, value: Value) -> MappingResult<()> {
    let mut value = Some(value);

    object.write_with(&mut |entity: &mut dyn Any| match value.take() {
        Some(value) => field.set(entity, value),
        None => Ok(()),
    })
}

/// Returns the `Type.field` name used in errors and warnings.
pub(crate) fn qualified(descriptor: &TypeDescriptor, field: &FieldDescriptor) -> String {
    format!("{}.{}", simple_name(descriptor.class_name()), field.name())
}

fn field_error(
    descriptor: &TypeDescriptor,
    field: &FieldDescriptor,
    err: MappingError,
) -> MappingError {
    MappingError::field(qualified(descriptor, field), err)
}

/// Takes an entity back out of a shared handle, cloning it if the handle is still shared.
pub fn unshare<T: Entity>(entity: Shared<T>) -> T {
    match Arc::try_unwrap(entity) {
        Ok(lock) => lock.into_inner().unwrap_or_else(PoisonError::into_inner),
        Err(entity) => entity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DescriptorBuilder;
    use bson::doc;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Note {
        id: i64,
        title: String,
        tags: Vec<String>,
        rating: Option<f64>,
        trail: Vec<String>,
    }

    impl Entity for Note {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.collection("notes");
            builder.field::<i64>("id", |n| &n.id, |n| &mut n.id).id();
            builder.field::<String>("title", |n| &n.title, |n| &mut n.title);
            builder.field::<Vec<String>>("tags", |n| &n.tags, |n| &mut n.tags);
            builder.field::<Option<f64>>("rating", |n| &n.rating, |n| &mut n.rating);
            builder
                .field::<Vec<String>>("trail", |n| &n.trail, |n| &mut n.trail)
                .transient();
            builder.hook(LifecyclePhase::PrePersist, |note, _| {
                note.trail.push("entity".to_string());
            });
        }
    }

    #[derive(Debug, Default)]
    struct Recorder {
        phases: Mutex<Vec<String>>,
    }

    impl EntityInterceptor for Arc<Recorder> {
        fn pre_persist(&self, _: &TypeDescriptor, entity: &mut dyn Any, _: &mut Document) {
            if let Some(note) = entity.downcast_mut::<Note>() {
                note.trail.push("interceptor".to_string());
            }
            self.phases.lock().unwrap().push("pre_persist".to_string());
        }

        fn post_load(&self, _: &TypeDescriptor, _: &mut dyn Any, _: &mut Document) {
            self.phases.lock().unwrap().push("post_load".to_string());
        }
    }

    #[tokio::test]
    async fn round_trips_plain_values() {
        let mapper = Mapper::new();
        let mut note = Note {
            id: 3,
            title: "groceries".into(),
            tags: vec!["home".into(), "weekly".into()],
            rating: Some(4.5),
            trail: vec![],
        };

        let document = mapper.to_document(&mut note).unwrap();
        assert_eq!(document.get_i64("_id").unwrap(), 3);
        assert!(document.get("trail").is_none());

        let mut ctx = mapper.context();
        let read = mapper.from_document::<Note>(&mut ctx, &document).await.unwrap();
        let read = read.read().unwrap();

        assert_eq!(read.title, note.title);
        assert_eq!(read.tags, note.tags);
        assert_eq!(read.rating, note.rating);
    }

    #[test]
    fn nulls_and_empties_are_omitted_by_default() {
        let mut note = Note {
            id: 1,
            ..Note::default()
        };

        let document = Mapper::new().to_document(&mut note).unwrap();
        assert!(!document.contains_key("rating"));
        assert!(!document.contains_key("tags"));

        let document = Mapper::builder()
            .store_nulls(true)
            .store_empties(true)
            .build()
            .to_document(&mut note)
            .unwrap();
        assert_eq!(document.get("rating"), Some(&Bson::Null));
        assert_eq!(document.get("tags"), Some(&Bson::Array(vec![])));
    }

    #[test]
    fn interceptors_run_after_entity_hooks() {
        let recorder = Arc::new(Recorder::default());
        let mapper = Mapper::builder().interceptor(recorder.clone()).build();
        let mut note = Note::default();

        mapper.to_document(&mut note).unwrap();

        assert_eq!(note.trail, vec!["entity".to_string(), "interceptor".to_string()]);
        assert_eq!(*recorder.phases.lock().unwrap(), vec!["pre_persist".to_string()]);
    }

    #[test]
    fn identity_mismatch_is_rejected() {
        let mapper = Mapper::new();
        let note = shared(Note {
            id: 3,
            ..Note::default()
        });

        let err = mapper.update_key_info(&note, Bson::Int64(7)).unwrap_err();
        assert!(matches!(err, MappingError::IdentityMismatch { .. }));
        assert_eq!(note.read().unwrap().id, 3);

        assert!(mapper.update_key_info(&note, Bson::Int64(3)).is_ok());
    }

    #[test]
    fn narrower_integer_ids_match_the_assigned_identity() {
        let mapper = Mapper::new();
        let note = shared(Note {
            id: 3,
            ..Note::default()
        });

        mapper.update_key_info(&note, Bson::Int32(3)).unwrap();
        assert_eq!(note.read().unwrap().id, 3);

        let err = mapper.update_key_info(&note, Bson::Int32(4)).unwrap_err();
        assert!(matches!(err, MappingError::IdentityMismatch { .. }));
    }

    #[tokio::test]
    async fn reading_an_int32_id_into_an_assigned_instance() {
        let mapper = Mapper::new();
        let note = shared(Note {
            id: 3,
            ..Note::default()
        });
        let document = doc! { "_id": 3_i32, "title": "refreshed" };

        mapper
            .read_into(&mut mapper.context(), &note, &document)
            .await
            .unwrap();

        let note = note.read().unwrap();
        assert_eq!(note.id, 3);
        assert_eq!(note.title, "refreshed");
    }

    #[tokio::test]
    async fn reading_twice_in_one_context_yields_one_instance() {
        let mapper = Mapper::new();
        let document = doc! { "_id": 9_i64, "title": "shared" };
        let mut ctx = mapper.context();

        let first = mapper.from_document::<Note>(&mut ctx, &document).await.unwrap();
        let second = mapper.from_document::<Note>(&mut ctx, &document).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn options_parse_from_json() {
        let options = MapperOptions::from_json(r#"{ "store_nulls": true }"#).unwrap();

        assert!(options.store_nulls);
        assert!(!options.store_empties);
        assert!(options.lazy_references);
        assert!(MapperOptions::from_json("{").is_err());
    }
}
