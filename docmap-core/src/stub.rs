//! Reference handles.
//!
//! Fields pointing at other stored entities hold one of [`Reference`], [`ReferenceList`] or
//! [`ReferenceMap`]. A handle is either *resolved*, wrapping live [`Shared`] instances, or
//! *unresolved*, wrapping the key(s) of its targets and a [`Resolver`] able to load them.
//! The first call to `get` on an unresolved handle loads the targets exactly once, even
//! when called concurrently, and the handle stays resolved from then on. Clones of a
//! handle share its state.
//!
//! # Example
//!
//! ```ignore
//! let order = datastore.get::<Order>(7_i64).await?.unwrap();
//! let customer = order.read().unwrap().customer.clone();
//!
//! assert!(!customer.is_resolved());
//! let customer = customer.get().await?;
//! ```

use async_trait::async_trait;
use mea::rwlock::RwLock as Gate;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, PoisonError, RwLock},
};

use crate::{
    descriptor::{Entity, EntityType},
    error::{MappingError, MappingResult},
    key::Key,
    value::{Link, ObjectRef, Persist, Shared, TypeShape, Value, downcast_object, shared},
};

/// Loads referenced entities for unresolved handles.
#[async_trait]
pub trait Resolver: Send + Sync + fmt::Debug {
    /// Loads the entities behind `keys`.
    ///
    /// The result is aligned with `keys`; entries are `None` for targets that no longer
    /// exist and may be skipped.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::DanglingReference`] for missing targets that may not be
    /// skipped, or any error raised while reading them.
    async fn resolve(
        &self,
        entity_type: EntityType,
        keys: &[Key],
    ) -> MappingResult<Vec<Option<ObjectRef>>>;
}

enum State<R, K> {
    Resolved(R),
    Unresolved(K, Arc<dyn Resolver>),
}

struct Slot<R, K> {
    state: RwLock<State<R, K>>,
    gate: Gate<()>,
}

impl<R: Clone, K: Clone> Slot<R, K> {
    fn new(state: State<R, K>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(state),
            gate: Gate::new(()),
        })
    }

    fn resolved(&self) -> Option<R> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Resolved(value) => Some(value.clone()),
            State::Unresolved(..) => None,
        }
    }

    fn pending(&self) -> Option<(K, Arc<dyn Resolver>)> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Resolved(_) => None,
            State::Unresolved(keys, resolver) => Some((keys.clone(), resolver.clone())),
        }
    }

    fn link(&self) -> Link<R, K> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            State::Resolved(value) => Link::Resolved(value.clone()),
            State::Unresolved(keys, resolver) => Link::Pending(keys.clone(), resolver.clone()),
        }
    }

    /// Returns the resolved value, loading it with `load` on first use.
    async fn get_or_resolve<F, Fut>(&self, load: F) -> MappingResult<R>
    where
        F: FnOnce(K, Arc<dyn Resolver>) -> Fut,
        Fut: Future<Output = MappingResult<R>>,
    {
        if let Some(value) = self.resolved() {
            return Ok(value);
        }

        let _gate = self.gate.write().await;

        let Some((keys, resolver)) = self.pending() else {
            return self
                .resolved()
                .ok_or_else(|| MappingError::LazyUnavailable("reference state lost".to_string()));
        };

        let value = load(keys, resolver).await?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = State::Resolved(value.clone());

        Ok(value)
    }
}

fn downcast_all<T: Entity>(objects: Vec<ObjectRef>) -> MappingResult<Vec<Shared<T>>> {
    objects.into_iter().map(downcast_object::<T>).collect()
}

/// A handle to a single referenced entity.
pub struct Reference<T: Entity> {
    slot: Arc<Slot<Shared<T>, Key>>,
}

impl<T: Entity> Reference<T> {
    /// Creates a resolved handle to a shared entity.
    pub fn new(entity: Shared<T>) -> Self {
        Self {
            slot: Slot::new(State::Resolved(entity)),
        }
    }

    /// Creates a resolved handle owning a fresh copy of `entity`.
    pub fn from_entity(entity: T) -> Self {
        Self::new(shared(entity))
    }

    /// Creates an unresolved handle.
    pub fn unresolved(key: Key, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            slot: Slot::new(State::Unresolved(key, resolver)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.resolved().is_some()
    }

    /// Returns the key of the target if the handle has not been resolved.
    pub fn key(&self) -> Option<Key> {
        self.slot.pending().map(|(key, _)| key)
    }

    /// Returns the target if it has been loaded, without loading it.
    pub fn peek(&self) -> Option<Shared<T>> {
        self.slot.resolved()
    }

    /// Returns the referenced entity, loading it on first access.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::DanglingReference`] if the target no longer exists.
    pub async fn get(&self) -> MappingResult<Shared<T>> {
        self.slot
            .get_or_resolve(|key, resolver| async move {
                let loaded = resolver
                    .resolve(EntityType::of::<T>(), std::slice::from_ref(&key))
                    .await?;

                match loaded.into_iter().next().flatten() {
                    Some(object) => downcast_object::<T>(object),
                    None => Err(MappingError::DanglingReference {
                        pointer: key.to_string(),
                        field: EntityType::of::<T>().name().to_string(),
                    }),
                }
            })
            .await
    }
}

impl<T: Entity> Clone for Reference<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for Reference<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "Reference(unresolved {key})"),
            None => write!(f, "Reference({})", EntityType::of::<T>().name()),
        }
    }
}

impl<T: Entity> Persist for Reference<T> {
    fn shape() -> TypeShape {
        TypeShape::Reference(EntityType::of::<T>())
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Reference(match self.slot.link() {
            Link::Resolved(entity) => Link::Resolved(entity as ObjectRef),
            Link::Pending(key, resolver) => Link::Pending(key, resolver),
        }))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::Reference(Link::Resolved(object)) => Ok(Self::new(downcast_object(object)?)),
            Value::Reference(Link::Pending(key, resolver)) => Ok(Self::unresolved(key, resolver)),
            other => Err(MappingError::type_mismatch("reference", other.kind())),
        }
    }
}

/// A handle to an ordered list of referenced entities.
pub struct ReferenceList<T: Entity> {
    slot: Arc<Slot<Vec<Shared<T>>, Vec<Key>>>,
}

impl<T: Entity> ReferenceList<T> {
    pub fn new(entities: Vec<Shared<T>>) -> Self {
        Self {
            slot: Slot::new(State::Resolved(entities)),
        }
    }

    pub fn unresolved(keys: Vec<Key>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            slot: Slot::new(State::Unresolved(keys, resolver)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.resolved().is_some()
    }

    /// Returns the keys of the targets if the handle has not been resolved.
    pub fn keys(&self) -> Option<Vec<Key>> {
        self.slot.pending().map(|(keys, _)| keys)
    }

    pub fn peek(&self) -> Option<Vec<Shared<T>>> {
        self.slot.resolved()
    }

    /// Returns the referenced entities, loading them on first access.
    ///
    /// Targets that no longer exist are left out when the field ignores missing targets.
    /// The warnings for them are only logged, since loading runs outside the context the
    /// list was read in.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::DanglingReference`] for missing targets that may not be
    /// skipped.
    pub async fn get(&self) -> MappingResult<Vec<Shared<T>>> {
        self.slot
            .get_or_resolve(|keys, resolver| async move {
                let loaded = resolver.resolve(EntityType::of::<T>(), &keys).await?;
                downcast_all(loaded.into_iter().flatten().collect())
            })
            .await
    }
}

impl<T: Entity> Default for ReferenceList<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T: Entity> Clone for ReferenceList<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Entity> FromIterator<Shared<T>> for ReferenceList<T> {
    fn from_iter<I: IntoIterator<Item = Shared<T>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<T: Entity> fmt::Debug for ReferenceList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.keys() {
            Some(keys) => write!(f, "ReferenceList(unresolved, {} keys)", keys.len()),
            None => write!(f, "ReferenceList({})", EntityType::of::<T>().name()),
        }
    }
}

impl<T: Entity> Persist for ReferenceList<T> {
    fn shape() -> TypeShape {
        TypeShape::ReferenceList(EntityType::of::<T>())
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::ReferenceList(match self.slot.link() {
            Link::Resolved(entities) => Link::Resolved(
                entities
                    .into_iter()
                    .map(|entity| entity as ObjectRef)
                    .collect(),
            ),
            Link::Pending(keys, resolver) => Link::Pending(keys, resolver),
        }))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::ReferenceList(Link::Resolved(objects)) => Ok(Self::new(downcast_all(objects)?)),
            Value::ReferenceList(Link::Pending(keys, resolver)) => {
                Ok(Self::unresolved(keys, resolver))
            }
            Value::Null => Ok(Self::default()),
            other => Err(MappingError::type_mismatch("reference list", other.kind())),
        }
    }
}

/// A handle to a string-keyed map of referenced entities.
pub struct ReferenceMap<T: Entity> {
    slot: Arc<Slot<BTreeMap<String, Shared<T>>, Vec<(String, Key)>>>,
}

impl<T: Entity> ReferenceMap<T> {
    pub fn new(entities: BTreeMap<String, Shared<T>>) -> Self {
        Self {
            slot: Slot::new(State::Resolved(entities)),
        }
    }

    pub fn unresolved(keys: Vec<(String, Key)>, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            slot: Slot::new(State::Unresolved(keys, resolver)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.resolved().is_some()
    }

    /// Returns the map keys and target keys if the handle has not been resolved.
    pub fn keys(&self) -> Option<Vec<(String, Key)>> {
        self.slot.pending().map(|(keys, _)| keys)
    }

    pub fn peek(&self) -> Option<BTreeMap<String, Shared<T>>> {
        self.slot.resolved()
    }

    /// Returns the referenced entities by map key, loading them on first access.
    ///
    /// As with [`ReferenceList::get`], warnings for skipped targets are only logged.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::DanglingReference`] for missing targets that may not be
    /// skipped.
    pub async fn get(&self) -> MappingResult<BTreeMap<String, Shared<T>>> {
        self.slot
            .get_or_resolve(|entries, resolver| async move {
                let keys: Vec<Key> = entries.iter().map(|(_, key)| key.clone()).collect();
                let loaded = resolver.resolve(EntityType::of::<T>(), &keys).await?;

                let mut resolved = BTreeMap::new();
                for ((name, _), object) in entries.into_iter().zip(loaded) {
                    if let Some(object) = object {
                        resolved.insert(name, downcast_object::<T>(object)?);
                    }
                }
                Ok(resolved)
            })
            .await
    }
}

impl<T: Entity> Default for ReferenceMap<T> {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl<T: Entity> Clone for ReferenceMap<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T: Entity> fmt::Debug for ReferenceMap<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.keys() {
            Some(keys) => write!(f, "ReferenceMap(unresolved, {} keys)", keys.len()),
            None => write!(f, "ReferenceMap({})", EntityType::of::<T>().name()),
        }
    }
}

impl<T: Entity> Persist for ReferenceMap<T> {
    fn shape() -> TypeShape {
        TypeShape::ReferenceMap(EntityType::of::<T>())
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::ReferenceMap(match self.slot.link() {
            Link::Resolved(entities) => Link::Resolved(
                entities
                    .into_iter()
                    .map(|(name, entity)| (name, entity as ObjectRef))
                    .collect(),
            ),
            Link::Pending(keys, resolver) => Link::Pending(keys, resolver),
        }))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        match value {
            Value::ReferenceMap(Link::Resolved(entries)) => entries
                .into_iter()
                .map(|(name, object)| Ok((name, downcast_object::<T>(object)?)))
                .collect::<MappingResult<_>>()
                .map(Self::new),
            Value::ReferenceMap(Link::Pending(keys, resolver)) => {
                Ok(Self::unresolved(keys, resolver))
            }
            Value::Null => Ok(Self::default()),
            other => Err(MappingError::type_mismatch("reference map", other.kind())),
        }
    }
}
