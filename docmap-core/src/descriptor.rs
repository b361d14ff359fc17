//! Per-type mapping metadata.
//!
//! A [`TypeDescriptor`] is the reusable mapping plan of one entity type: its ordered fields,
//! identity and version fields, collection and class names, lifecycle hooks and class-level
//! codecs. Descriptors are produced by [`Entity::describe`], usually generated by
//! `#[derive(Entity)]`, and cached by the [`ClassRegistry`](crate::registry::ClassRegistry).
//!
//! Field access goes through accessor closures built once at registration time, so no
//! per-call lookup is needed.
//!
//! # Example
//!
//! ```ignore
//! use docmap::descriptor::{DescriptorBuilder, Entity};
//!
//! #[derive(Debug, Clone, Default)]
//! struct User {
//!     id: i64,
//!     name: String,
//! }
//!
//! impl Entity for User {
//!     fn describe(builder: &mut DescriptorBuilder<Self>) {
//!         builder.collection("users");
//!         builder.field::<i64>("id", |u| &u.id, |u| &mut u.id).id();
//!         builder.field::<String>("name", |u| &u.name, |u| &mut u.name);
//!     }
//! }
//! ```

use bson::Document;
use std::{
    any::{Any, TypeId, type_name},
    fmt,
    sync::{Arc, RwLock},
};

use crate::{
    codec::Codec,
    error::{MappingError, MappingResult},
    value::{ObjectRef, Persist, TypeShape, Value},
};

/// Name of the document field holding the identity.
pub const ID_KEY: &str = "_id";
/// Name of the document field holding the concrete type name.
pub const CLASS_NAME_KEY: &str = "className";

/// A mapped type.
///
/// Entities describe their fields once; the result is validated and cached per type.
/// `Default` is used to allocate instances before their fields are read.
pub trait Entity: Default + Clone + Send + Sync + 'static {
    fn describe(builder: &mut DescriptorBuilder<Self>);
}

/// A copyable handle identifying an entity type at runtime.
#[derive(Clone, Copy)]
pub struct EntityType {
    type_id: TypeId,
    name: &'static str,
    build: fn() -> TypeDescriptor,
    instantiate: fn() -> ObjectRef,
}

impl EntityType {
    pub fn of<T: Entity>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: type_name::<T>(),
            build: TypeDescriptor::build::<T>,
            instantiate: instantiate::<T>,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The fully qualified type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Builds a fresh, unvalidated descriptor for this type.
    pub fn describe(&self) -> TypeDescriptor {
        (self.build)()
    }

    /// Allocates a default instance of this type.
    pub fn instantiate(&self) -> ObjectRef {
        (self.instantiate)()
    }
}

fn instantiate<T: Entity>() -> ObjectRef {
    Arc::new(RwLock::new(T::default()))
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EntityType {}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityType({})", self.name)
    }
}

/// Type-erased access to a live entity instance.
///
/// Implemented for `RwLock<T>` of every entity, so any [`Shared`](crate::value::Shared)
/// handle coerces into an [`ObjectRef`]. Locks are only held for the duration of the
/// callback.
pub trait MappedObject: Send + Sync + 'static {
    fn entity_type(&self) -> EntityType;

    /// Runs `f` with shared access to the instance.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Poisoned`] if the lock was poisoned, or whatever `f` returns.
    fn read_with(&self, f: &mut dyn FnMut(&dyn Any) -> MappingResult<()>) -> MappingResult<()>;

    /// Runs `f` with exclusive access to the instance.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Poisoned`] if the lock was poisoned, or whatever `f` returns.
    fn write_with(
        &self,
        f: &mut dyn FnMut(&mut dyn Any) -> MappingResult<()>,
    ) -> MappingResult<()>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Entity> MappedObject for RwLock<T> {
    fn entity_type(&self) -> EntityType {
        EntityType::of::<T>()
    }

    fn read_with(&self, f: &mut dyn FnMut(&dyn Any) -> MappingResult<()>) -> MappingResult<()> {
        let guard = self
            .read()
            .map_err(|_| MappingError::Poisoned(type_name::<T>().to_string()))?;

        f(&*guard)
    }

    fn write_with(
        &self,
        f: &mut dyn FnMut(&mut dyn Any) -> MappingResult<()>,
    ) -> MappingResult<()> {
        let mut guard = self
            .write()
            .map_err(|_| MappingError::Poisoned(type_name::<T>().to_string()))?;

        f(&mut *guard)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl fmt::Debug for dyn MappedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappedObject({})", self.entity_type().name())
    }
}

/// Returns the identity of an instance, stable for as long as it is alive.
pub fn object_address(object: &ObjectRef) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

/// Options of a reference field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceOptions {
    /// Resolve the target on first access instead of while reading.
    pub lazy: bool,
    /// Leave missing targets out instead of failing.
    pub ignore_missing: bool,
    /// Fail instead of loading eagerly when lazy loading is disabled.
    pub require_lazy: bool,
}

/// How the engine maps a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Id,
    Version,
    Reference(ReferenceOptions),
    Embedded,
    Property,
    /// No explicit role; the declared shape decides.
    Auto,
    Transient,
}

/// The lifecycle phases at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    PrePersist,
    PreSave,
    PreLoad,
    PostLoad,
}

type Getter = Arc<dyn Fn(&dyn Any) -> MappingResult<Value> + Send + Sync>;
type Setter = Arc<dyn Fn(&mut dyn Any, Value) -> MappingResult<()> + Send + Sync>;

/// A type-erased lifecycle hook.
pub type Hook = Arc<dyn Fn(&mut dyn Any, &mut Document) -> MappingResult<()> + Send + Sync>;

fn wrong_instance<T>() -> MappingError {
    MappingError::type_mismatch(type_name::<T>(), "another entity type")
}

/// Describes one persistable member of an entity.
#[derive(Clone)]
pub struct FieldDescriptor {
    name: String,
    stored_name: String,
    shape: TypeShape,
    role: FieldRole,
    getter: Getter,
    setter: Option<Setter>,
}

impl FieldDescriptor {
    /// The member name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the field in the document. Identity fields are always stored as `_id`.
    pub fn stored_name(&self) -> &str {
        match self.role {
            FieldRole::Id => ID_KEY,
            _ => &self.stored_name,
        }
    }

    pub fn shape(&self) -> &TypeShape {
        &self.shape
    }

    pub fn role(&self) -> FieldRole {
        self.role
    }

    pub fn is_settable(&self) -> bool {
        self.setter.is_some()
    }

    /// Reads the current value of the field off an instance.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::TypeMismatch`] if `instance` is not of the described type.
    pub fn get(&self, instance: &dyn Any) -> MappingResult<Value> {
        (self.getter)(instance)
    }

    /// Assigns a value to the field of an instance.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Validation`] for read-only fields, or a conversion error.
    pub fn set(&self, instance: &mut dyn Any, value: Value) -> MappingResult<()> {
        match &self.setter {
            Some(setter) => setter(instance, value),
            None => Err(MappingError::Validation {
                class: self.name.clone(),
                reason: "field is read-only".to_string(),
            }),
        }
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("stored_name", &self.stored_name())
            .field("shape", &self.shape)
            .field("role", &self.role)
            .field("settable", &self.is_settable())
            .finish()
    }
}

/// The immutable mapping plan of one entity type.
#[derive(Clone)]
pub struct TypeDescriptor {
    entity_type: EntityType,
    class_name: String,
    collection: String,
    store_class_name: bool,
    fields: Vec<FieldDescriptor>,
    hooks: Vec<(LifecyclePhase, Hook)>,
    codecs: Vec<Arc<dyn Codec>>,
}

impl TypeDescriptor {
    /// Runs [`Entity::describe`] and collects the result.
    ///
    /// The descriptor is not validated; see [`TypeDescriptor::validate`].
    pub fn build<T: Entity>() -> Self {
        let mut builder = DescriptorBuilder::<T>::new();
        T::describe(&mut builder);
        builder.finish()
    }

    /// Checks the structural invariants of the descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Validation`] naming the class if there is more than one
    /// identity or version field, the identity field cannot be set or is not a plain value,
    /// a version field is not an integer, or a reference role is declared on a field that
    /// does not hold a reference handle.
    pub fn validate(&self) -> MappingResult<()> {
        let fail = |reason: String| MappingError::Validation {
            class: self.class_name.clone(),
            reason,
        };

        let ids = self.fields_with(|role| role == FieldRole::Id);
        if ids.len() > 1 {
            return Err(fail(format!("multiple identity fields: {}", ids.join(", "))));
        }

        let versions = self.fields_with(|role| role == FieldRole::Version);
        if versions.len() > 1 {
            return Err(fail(format!("multiple version fields: {}", versions.join(", "))));
        }

        for field in &self.fields {
            match field.role {
                FieldRole::Id if !field.is_settable() => {
                    return Err(fail(format!("identity field {} has no setter", field.name)));
                }
                FieldRole::Id if !field.shape.is_store_native() => {
                    return Err(fail(format!(
                        "identity field {} must be a plain value, found {:?}",
                        field.name, field.shape
                    )));
                }
                FieldRole::Version if !field.shape.is_integer() => {
                    return Err(fail(format!(
                        "version field {} must be an integer, found {:?}",
                        field.name, field.shape
                    )));
                }
                FieldRole::Reference(_) if !field.shape.is_reference() => {
                    return Err(fail(format!(
                        "reference field {} must hold a reference handle, found {:?}",
                        field.name, field.shape
                    )));
                }
                _ => {}
            }
        }

        Ok(())
    }

    fn fields_with(&self, predicate: impl Fn(FieldRole) -> bool) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|field| predicate(field.role))
            .map(|field| field.name.as_str())
            .collect()
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    /// The name stored in the `className` field.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Whether documents of this type carry their `className`.
    pub fn stores_class_name(&self) -> bool {
        self.store_class_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn id_field(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.role == FieldRole::Id)
    }

    pub fn version_field(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|field| field.role == FieldRole::Version)
    }

    /// Codecs declared by the class, consulted before any other codec.
    pub fn codecs(&self) -> &[Arc<dyn Codec>] {
        &self.codecs
    }

    /// Returns the hooks registered for a phase, in registration order.
    pub fn hooks(&self, phase: LifecyclePhase) -> impl Iterator<Item = &Hook> {
        self.hooks
            .iter()
            .filter(move |(registered, _)| *registered == phase)
            .map(|(_, hook)| hook)
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("class_name", &self.class_name)
            .field("collection", &self.collection)
            .field("store_class_name", &self.store_class_name)
            .field("fields", &self.fields)
            .field("hooks", &self.hooks.len())
            .field("codecs", &self.codecs)
            .finish()
    }
}

/// Returns the last path segment of a type name, without generic arguments.
pub fn simple_name(type_name: &str) -> &str {
    let base = type_name.split('<').next().unwrap_or(type_name);
    base.rsplit("::").next().unwrap_or(base)
}

/// Collects the mapping metadata of an entity type.
pub struct DescriptorBuilder<T: Entity> {
    descriptor: TypeDescriptor,
    _entity: std::marker::PhantomData<fn() -> T>,
}

impl<T: Entity> DescriptorBuilder<T> {
    fn new() -> Self {
        let entity_type = EntityType::of::<T>();

        Self {
            descriptor: TypeDescriptor {
                entity_type,
                class_name: entity_type.name().to_string(),
                collection: simple_name(entity_type.name()).to_string(),
                store_class_name: true,
                fields: Vec::new(),
                hooks: Vec::new(),
                codecs: Vec::new(),
            },
            _entity: std::marker::PhantomData,
        }
    }

    fn finish(self) -> TypeDescriptor {
        self.descriptor
    }

    /// Overrides the collection name, which defaults to the simple type name.
    pub fn collection(&mut self, name: impl Into<String>) -> &mut Self {
        self.descriptor.collection = name.into();
        self
    }

    /// Overrides the name stored in `className`.
    pub fn class_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.descriptor.class_name = name.into();
        self
    }

    /// Stops writing `className` into documents of this type.
    pub fn no_class_name(&mut self) -> &mut Self {
        self.descriptor.store_class_name = false;
        self
    }

    /// Declares a codec that takes priority over every other codec for this class.
    pub fn codec(&mut self, codec: impl Codec + 'static) -> &mut Self {
        self.descriptor.codecs.push(Arc::new(codec));
        self
    }

    /// Registers a lifecycle hook. Hooks of one phase run in registration order.
    pub fn hook<F>(&mut self, phase: LifecyclePhase, hook: F) -> &mut Self
    where
        F: Fn(&mut T, &mut Document) + Send + Sync + 'static,
    {
        let erased: Hook = Arc::new(move |instance: &mut dyn Any, document: &mut Document| {
            let entity = instance
                .downcast_mut::<T>()
                .ok_or_else(wrong_instance::<T>)?;
            hook(entity, document);
            Ok(())
        });

        self.descriptor.hooks.push((phase, erased));
        self
    }

    /// Registers a readable and writable field.
    ///
    /// # Arguments
    ///
    /// * `name` - The member name, also the default stored name
    /// * `get` - Borrows the field off an instance
    /// * `get_mut` - Mutably borrows the field off an instance
    pub fn field<V: Persist>(
        &mut self,
        name: &str,
        get: fn(&T) -> &V,
        get_mut: fn(&mut T) -> &mut V,
    ) -> FieldBuilder<'_> {
        let setter: Setter = Arc::new(move |instance: &mut dyn Any, value: Value| {
            let entity = instance
                .downcast_mut::<T>()
                .ok_or_else(wrong_instance::<T>)?;
            *get_mut(entity) = V::from_value(value)?;
            Ok(())
        });

        self.push::<V>(name, get, Some(setter))
    }

    /// Registers a field without a setter.
    pub fn read_only<V: Persist>(&mut self, name: &str, get: fn(&T) -> &V) -> FieldBuilder<'_> {
        self.push::<V>(name, get, None)
    }

    fn push<V: Persist>(
        &mut self,
        name: &str,
        get: fn(&T) -> &V,
        setter: Option<Setter>,
    ) -> FieldBuilder<'_> {
        let getter: Getter = Arc::new(move |instance: &dyn Any| {
            let entity = instance.downcast_ref::<T>().ok_or_else(wrong_instance::<T>)?;
            get(entity).to_value()
        });

        self.descriptor.fields.push(FieldDescriptor {
            name: name.to_string(),
            stored_name: name.to_string(),
            shape: V::shape(),
            role: FieldRole::Auto,
            getter,
            setter,
        });

        let index = self.descriptor.fields.len() - 1;
        FieldBuilder {
            field: &mut self.descriptor.fields[index],
        }
    }
}

/// Refines the field that was just registered.
pub struct FieldBuilder<'a> {
    field: &'a mut FieldDescriptor,
}

impl FieldBuilder<'_> {
    pub fn id(self) -> Self {
        self.role(FieldRole::Id)
    }

    pub fn version(self) -> Self {
        self.role(FieldRole::Version)
    }

    pub fn embedded(self) -> Self {
        self.role(FieldRole::Embedded)
    }

    pub fn property(self) -> Self {
        self.role(FieldRole::Property)
    }

    pub fn transient(self) -> Self {
        self.role(FieldRole::Transient)
    }

    pub fn reference(self) -> Self {
        match self.field.role {
            FieldRole::Reference(_) => self,
            _ => self.role(FieldRole::Reference(ReferenceOptions::default())),
        }
    }

    pub fn lazy(self) -> Self {
        self.reference_options(|options| options.lazy = true)
    }

    pub fn ignore_missing(self) -> Self {
        self.reference_options(|options| options.ignore_missing = true)
    }

    /// Demands lazy semantics: reading fails if lazy loading is disabled.
    pub fn require_lazy(self) -> Self {
        self.reference_options(|options| {
            options.lazy = true;
            options.require_lazy = true;
        })
    }

    /// Stores the field under another name.
    pub fn rename(self, stored_name: impl Into<String>) -> Self {
        self.field.stored_name = stored_name.into();
        self
    }

    fn role(self, role: FieldRole) -> Self {
        self.field.role = role;
        self
    }

    fn reference_options(self, apply: impl FnOnce(&mut ReferenceOptions)) -> Self {
        let mut options = match self.field.role {
            FieldRole::Reference(options) => options,
            _ => ReferenceOptions::default(),
        };
        apply(&mut options);
        self.role(FieldRole::Reference(options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    struct Account {
        id: i64,
        name: String,
        revision: i64,
        legacy_revision: i64,
    }

    impl Entity for Account {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.collection("accounts");
            builder.field::<i64>("id", |a| &a.id, |a| &mut a.id).id();
            builder
                .field::<String>("name", |a| &a.name, |a| &mut a.name)
                .rename("n");
            builder
                .field::<i64>("revision", |a| &a.revision, |a| &mut a.revision)
                .version();
        }
    }

    #[derive(Debug, Clone, Default)]
    struct DoubleVersioned(Account);

    impl Entity for DoubleVersioned {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder
                .field::<i64>("revision", |a| &a.0.revision, |a| &mut a.0.revision)
                .version();
            builder
                .field::<i64>("legacy_revision", |a| &a.0.legacy_revision, |a| {
                    &mut a.0.legacy_revision
                })
                .version();
        }
    }

    #[derive(Debug, Clone, Default)]
    struct ReadOnlyId(Account);

    impl Entity for ReadOnlyId {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.read_only::<i64>("id", |a| &a.0.id).id();
        }
    }

    #[test]
    fn builds_fields_in_declaration_order() {
        let descriptor = TypeDescriptor::build::<Account>();

        assert!(descriptor.validate().is_ok());
        assert_eq!(descriptor.collection(), "accounts");
        assert!(descriptor.class_name().ends_with("Account"));
        assert_eq!(descriptor.fields().len(), 3);
        assert_eq!(descriptor.id_field().map(FieldDescriptor::stored_name), Some("_id"));
        assert_eq!(descriptor.field("name").map(FieldDescriptor::stored_name), Some("n"));
        assert_eq!(descriptor.version_field().map(FieldDescriptor::name), Some("revision"));
    }

    #[test]
    fn rejects_two_version_fields_naming_the_class() {
        let err = TypeDescriptor::build::<DoubleVersioned>()
            .validate()
            .unwrap_err();

        assert!(err.is_validation());
        assert!(err.to_string().contains("DoubleVersioned"));
    }

    #[test]
    fn rejects_identity_without_setter() {
        let err = TypeDescriptor::build::<ReadOnlyId>().validate().unwrap_err();
        assert!(err.to_string().contains("has no setter"));
    }

    #[test]
    fn accessors_read_and_write_instances() {
        let descriptor = TypeDescriptor::build::<Account>();
        let field = descriptor.field("name").unwrap();
        let mut account = Account::default();

        field
            .set(&mut account, Value::String("alice".to_string()))
            .unwrap();

        assert_eq!(account.name, "alice");
        assert!(matches!(field.get(&account).unwrap(), Value::String(name) if name == "alice"));
        assert!(field.get(&"not an account").is_err());
    }

    #[test]
    fn simple_names_drop_paths_and_generics() {
        assert_eq!(simple_name("app::model::User"), "User");
        assert_eq!(simple_name("app::Wrapper<app::model::User>"), "Wrapper");
        assert_eq!(simple_name("User"), "User");
    }
}
