//! Mapping of references to other stored entities.
//!
//! References are written as pointers (see [`Key::to_pointer`]). On read, a reference is
//! either resolved eagerly, by fetching and mapping its target through the same context,
//! or turned into an unresolved handle backed by a [`LazyLoader`].
//!
//! Eager reads consult the context's identity cache before touching the store, so cycles
//! and repeated targets resolve to one instance. Lists and maps of references fetch all
//! cache misses of one collection with a single batched lookup.

use async_trait::async_trait;
use bson::{Bson, Document};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::{
    backend::StoreBackend,
    context::MappingContext,
    descriptor::{EntityType, ID_KEY, ReferenceOptions},
    error::{MappingError, MappingResult},
    key::{Key, same_id},
    mapper::Mapper,
    stub::Resolver,
    value::{Link, ObjectRef, TypeShape, Value},
};

fn dangling(key: &Key, field: &str) -> MappingError {
    MappingError::DanglingReference {
        pointer: key.to_string(),
        field: field.to_string(),
    }
}

fn no_source(field: &str) -> MappingError {
    MappingError::Initialization(format!(
        "{field} holds a reference but the mapping context has no store"
    ))
}

impl Mapper {
    /// Writes a reference value as one or more pointers.
    ///
    /// Unresolved handles are written from their known keys without loading anything.
    pub(crate) fn write_reference(&self, value: Value) -> MappingResult<Option<Bson>> {
        let bson = match value {
            Value::Null => Bson::Null,
            Value::Reference(Link::Resolved(object)) => self.key_of_object(&object)?.to_pointer(),
            Value::Reference(Link::Pending(key, _)) => key.to_pointer(),
            Value::ReferenceList(Link::Resolved(objects)) => Bson::Array(
                objects
                    .iter()
                    .map(|object| Ok(self.key_of_object(object)?.to_pointer()))
                    .collect::<MappingResult<_>>()?,
            ),
            Value::ReferenceList(Link::Pending(keys, _)) => {
                Bson::Array(keys.iter().map(Key::to_pointer).collect())
            }
            Value::ReferenceMap(Link::Resolved(entries)) => {
                let mut document = Document::new();
                for (name, object) in entries {
                    document.insert(name, self.key_of_object(&object)?.to_pointer());
                }
                Bson::Document(document)
            }
            Value::ReferenceMap(Link::Pending(entries, _)) => {
                let mut document = Document::new();
                for (name, key) in entries {
                    document.insert(name, key.to_pointer());
                }
                Bson::Document(document)
            }
            other => return Err(MappingError::type_mismatch("reference", other.kind())),
        };

        Ok(Some(bson))
    }

    /// Reads a stored reference value.
    ///
    /// Returns `None` if the field should be left untouched, which happens for a missing
    /// single target that may be ignored.
    pub(crate) async fn read_reference(
        &self,
        ctx: &mut MappingContext,
        stored: Bson,
        shape: &TypeShape,
        options: ReferenceOptions,
        field: &str,
    ) -> MappingResult<Option<Value>> {
        if stored == Bson::Null {
            return Ok(Some(Value::Null));
        }

        let entity_type = shape
            .referenced_type()
            .ok_or_else(|| MappingError::UnsupportedType(format!("{shape:?}")))?;
        let lazy = self.use_lazy(options, field)?;

        match shape.strip_optional() {
            TypeShape::Reference(_) => {
                let key = Key::from_pointer(&stored)?;

                if lazy {
                    return self.lazy_single(ctx, entity_type, key, options, field).await;
                }

                let resolved = self
                    .resolve_many(ctx, entity_type, std::slice::from_ref(&key), options.ignore_missing, field)
                    .await?;

                Ok(resolved
                    .into_iter()
                    .next()
                    .flatten()
                    .map(|object| Value::Reference(Link::Resolved(object))))
            }
            TypeShape::ReferenceList(_) => {
                let keys = pointer_list(&stored)?;

                if lazy {
                    self.check_exists(ctx, &keys, options, field).await?;
                    let loader = self.loader(ctx, options, field)?;
                    return Ok(Some(Value::ReferenceList(Link::Pending(keys, loader))));
                }

                let resolved = self
                    .resolve_many(ctx, entity_type, &keys, options.ignore_missing, field)
                    .await?;

                Ok(Some(Value::ReferenceList(Link::Resolved(
                    resolved.into_iter().flatten().collect(),
                ))))
            }
            TypeShape::ReferenceMap(_) => {
                let entries = pointer_map(&stored)?;

                if lazy {
                    let keys: Vec<Key> = entries.iter().map(|(_, key)| key.clone()).collect();
                    self.check_exists(ctx, &keys, options, field).await?;
                    let loader = self.loader(ctx, options, field)?;
                    return Ok(Some(Value::ReferenceMap(Link::Pending(entries, loader))));
                }

                let keys: Vec<Key> = entries.iter().map(|(_, key)| key.clone()).collect();
                let resolved = self
                    .resolve_many(ctx, entity_type, &keys, options.ignore_missing, field)
                    .await?;

                Ok(Some(Value::ReferenceMap(Link::Resolved(
                    entries
                        .into_iter()
                        .zip(resolved)
                        .filter_map(|((name, _), object)| object.map(|object| (name, object)))
                        .collect(),
                ))))
            }
            other => Err(MappingError::UnsupportedType(format!("{other:?}"))),
        }
    }

    fn use_lazy(&self, options: ReferenceOptions, field: &str) -> MappingResult<bool> {
        if !options.lazy {
            return Ok(false);
        }

        if self.options().lazy_references {
            return Ok(true);
        }

        if options.require_lazy {
            return Err(MappingError::LazyUnavailable(format!(
                "{field} requires lazy loading but the mapper has it disabled"
            )));
        }

        debug!(field, "lazy references disabled; loading eagerly");
        Ok(false)
    }

    fn loader(
        &self,
        ctx: &MappingContext,
        options: ReferenceOptions,
        field: &str,
    ) -> MappingResult<Arc<dyn Resolver>> {
        let source = ctx.source().cloned().ok_or_else(|| no_source(field))?;

        Ok(Arc::new(LazyLoader {
            mapper: self.clone(),
            source,
            field: field.to_string(),
            ignore_missing: options.ignore_missing,
        }))
    }

    async fn lazy_single(
        &self,
        ctx: &mut MappingContext,
        entity_type: EntityType,
        key: Key,
        options: ReferenceOptions,
        field: &str,
    ) -> MappingResult<Option<Value>> {
        self.descriptor(entity_type)?;

        if let Some(cached) = ctx.cached(&key) {
            return Ok(Some(Value::Reference(Link::Resolved(cached.clone()))));
        }

        if !options.ignore_missing {
            let source = ctx.source().ok_or_else(|| no_source(field))?;
            if !source.exists_document(key.kind(), key.id()).await? {
                return Err(dangling(&key, field));
            }
        }

        let loader = self.loader(ctx, options, field)?;
        Ok(Some(Value::Reference(Link::Pending(key, loader))))
    }

    /// Verifies that every target exists, one batched lookup per collection.
    async fn check_exists(
        &self,
        ctx: &MappingContext,
        keys: &[Key],
        options: ReferenceOptions,
        field: &str,
    ) -> MappingResult<()> {
        if options.ignore_missing || keys.is_empty() {
            return Ok(());
        }

        let source = ctx.source().ok_or_else(|| no_source(field))?;

        for (kind, ids) in group_by_kind(keys.iter().filter(|key| ctx.cached(key).is_none())) {
            let existing = source.existing_ids(&kind, &ids).await?;

            let missing = ids
                .iter()
                .find(|id| !existing.iter().any(|found| same_id(found, id)));

            if let Some(missing) = missing {
                return Err(dangling(&Key::new(kind, missing.clone()), field));
            }
        }

        Ok(())
    }

    /// Resolves keys to instances, aligned with `keys`.
    ///
    /// Cached instances are reused. Misses are fetched in one batch per collection; if a
    /// batch comes back short, each item it lacks is fetched on its own before being
    /// declared missing. Missing targets are `None` when `ignore_missing` is set.
    pub(crate) async fn resolve_many(
        &self,
        ctx: &mut MappingContext,
        entity_type: EntityType,
        keys: &[Key],
        ignore_missing: bool,
        field: &str,
    ) -> MappingResult<Vec<Option<ObjectRef>>> {
        let misses: Vec<&Key> = keys.iter().filter(|key| ctx.cached(key).is_none()).collect();
        let mut fetched: HashMap<Key, Document> = HashMap::new();

        if !misses.is_empty() {
            let source = ctx.source().cloned().ok_or_else(|| no_source(field))?;

            for (kind, ids) in group_by_kind(misses.iter().copied()) {
                for (id, document) in fetch_group(source.as_ref(), &kind, &ids).await? {
                    fetched.insert(Key::new(kind.clone(), id), document);
                }
            }
        }

        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(cached) = ctx.cached(key) {
                resolved.push(Some(cached.clone()));
                continue;
            }

            match fetched.get(key) {
                Some(document) => {
                    let object = self.read_object(ctx, document, Some(entity_type)).await?;
                    ctx.register(key.clone(), object.clone());
                    resolved.push(Some(object));
                }
                None if ignore_missing => {
                    ctx.warn(field, format!("referenced document {key} is missing; left out"));
                    resolved.push(None);
                }
                None => return Err(dangling(key, field)),
            }
        }

        Ok(resolved)
    }
}

/// Fetches one collection's documents by id, returning them keyed by id.
async fn fetch_group(
    source: &dyn StoreBackend,
    kind: &str,
    ids: &[Bson],
) -> MappingResult<Vec<(Bson, Document)>> {
    if let [id] = ids {
        return Ok(source
            .fetch_document(kind, id)
            .await?
            .map(|document| vec![(id.clone(), document)])
            .unwrap_or_default());
    }

    let batch = source.fetch_batch(kind, ids).await?;
    let complete = batch.len() == ids.len();
    let mut found: Vec<(Bson, Document)> = batch
        .into_iter()
        .filter_map(|document| Some((document.get(ID_KEY)?.clone(), document)))
        .collect();

    if complete {
        return Ok(found);
    }

    debug!(
        collection = kind,
        requested = ids.len(),
        returned = found.len(),
        "batch fetch came back short; fetching missing items one by one"
    );

    let missing: Vec<Bson> = ids
        .iter()
        .filter(|id| !found.iter().any(|(found_id, _)| same_id(found_id, id)))
        .cloned()
        .collect();

    for id in missing {
        if let Some(document) = source.fetch_document(kind, &id).await? {
            found.push((id, document));
        }
    }

    Ok(found)
}

/// Groups keys by collection, keeping the first-seen order and dropping duplicates.
fn group_by_kind<'a>(keys: impl Iterator<Item = &'a Key>) -> Vec<(String, Vec<Bson>)> {
    let mut groups: Vec<(String, Vec<Bson>)> = Vec::new();

    for key in keys {
        let position = match groups.iter().position(|(kind, _)| kind == key.kind()) {
            Some(position) => position,
            None => {
                groups.push((key.kind().to_string(), Vec::new()));
                groups.len() - 1
            }
        };

        let ids = &mut groups[position].1;
        if !ids.contains(key.id()) {
            ids.push(key.id().clone());
        }
    }

    groups
}

fn pointer_list(stored: &Bson) -> MappingResult<Vec<Key>> {
    match stored {
        Bson::Array(items) => items.iter().map(Key::from_pointer).collect(),
        single => Ok(vec![Key::from_pointer(single)?]),
    }
}

fn pointer_map(stored: &Bson) -> MappingResult<Vec<(String, Key)>> {
    match stored {
        Bson::Document(document) => document
            .iter()
            .map(|(name, pointer)| Ok((name.clone(), Key::from_pointer(pointer)?)))
            .collect(),
        other => Err(MappingError::type_mismatch("map of pointers", other.to_string())),
    }
}

/// Resolves unresolved handles with a fresh, self-contained read.
///
/// The read does not share the context the handle was created in. Warnings raised while
/// resolving, such as targets skipped under `ignore_missing`, are logged through `tracing`
/// and never added to that context.
pub struct LazyLoader {
    mapper: Mapper,
    source: Arc<dyn StoreBackend>,
    field: String,
    ignore_missing: bool,
}

impl std::fmt::Debug for LazyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyLoader")
            .field("field", &self.field)
            .field("ignore_missing", &self.ignore_missing)
            .finish()
    }
}

#[async_trait]
impl Resolver for LazyLoader {
    async fn resolve(
        &self,
        entity_type: EntityType,
        keys: &[Key],
    ) -> MappingResult<Vec<Option<ObjectRef>>> {
        let mut ctx = self.mapper.context_with(self.source.clone());

        self.mapper
            .resolve_many(&mut ctx, entity_type, keys, self.ignore_missing, &self.field)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_keep_order_and_drop_duplicates() {
        let keys = [
            Key::new("users", 1_i64),
            Key::new("teams", 9_i64),
            Key::new("users", 2_i64),
            Key::new("users", 1_i64),
        ];

        let groups = group_by_kind(keys.iter());
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "users");
        assert_eq!(groups[0].1, vec![Bson::Int64(1), Bson::Int64(2)]);
        assert_eq!(groups[1].1, vec![Bson::Int64(9)]);
    }

    #[test]
    fn single_pointers_read_as_lists() {
        let pointer = Key::new("users", 4_i64).to_pointer();

        let keys = pointer_list(&pointer).unwrap();
        assert_eq!(keys, vec![Key::new("users", 4_i64)]);
        assert!(pointer_map(&pointer).is_err());
        assert!(pointer_list(&Bson::Int32(1)).is_err());
    }

    #[test]
    fn lazy_requirements_follow_mapper_options() {
        let eager = Mapper::builder().lazy_references(false).build();
        let lazy = ReferenceOptions {
            lazy: true,
            ..ReferenceOptions::default()
        };
        let required = ReferenceOptions {
            require_lazy: true,
            ..lazy
        };

        assert!(Mapper::new().use_lazy(lazy, "A.b").unwrap());
        assert!(!eager.use_lazy(lazy, "A.b").unwrap());
        assert!(matches!(
            eager.use_lazy(required, "A.b"),
            Err(MappingError::LazyUnavailable(_))
        ));
    }
}
