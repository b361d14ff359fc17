//! Process-wide cache of type descriptors.
//!
//! The registry is written once per distinct entity type (plus explicit remaps) and read on
//! every mapping call. Lookups take a shared lock; a miss takes the exclusive lock, checks
//! again and builds the descriptor, so concurrent first callers for a type all observe one
//! descriptor and none is ever built twice.

use std::{
    any::TypeId,
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

use crate::{
    descriptor::{EntityType, TypeDescriptor},
    error::{MappingError, MappingResult},
};

#[derive(Debug, Default)]
pub struct ClassRegistry {
    by_type: RwLock<HashMap<TypeId, Arc<TypeDescriptor>>>,
    by_name: RwLock<HashMap<String, EntityType>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the descriptor of a type, building and validating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Validation`] if the type is structurally invalid or its class
    /// name is already registered for another type. Nothing is cached in that case.
    pub fn get_or_build(&self, entity_type: EntityType) -> MappingResult<Arc<TypeDescriptor>> {
        if let Some(descriptor) = self.cached(entity_type) {
            return Ok(descriptor);
        }

        let mut by_type = self.by_type.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(descriptor) = by_type.get(&entity_type.type_id()) {
            return Ok(descriptor.clone());
        }

        let descriptor = entity_type.describe();
        descriptor.validate()?;

        let mut by_name = self.by_name.write().unwrap_or_else(PoisonError::into_inner);
        check_name_owner(&by_name, &descriptor, entity_type)?;

        let descriptor = Arc::new(descriptor);
        by_name.insert(descriptor.class_name().to_string(), entity_type);
        by_type.insert(entity_type.type_id(), descriptor.clone());

        debug!(class = descriptor.class_name(), "registered entity type");

        Ok(descriptor)
    }

    /// Returns the descriptor of a type if it has been built already.
    pub fn cached(&self, entity_type: EntityType) -> Option<Arc<TypeDescriptor>> {
        self.by_type
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entity_type.type_id())
            .cloned()
    }

    /// Looks up a registered type by the name stored in `className`.
    pub fn by_class_name(&self, class_name: &str) -> Option<EntityType> {
        self.by_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class_name)
            .copied()
    }

    pub fn is_mapped(&self, entity_type: EntityType) -> bool {
        self.cached(entity_type).is_some()
    }

    /// Rebuilds the descriptor of a type, replacing any cached one.
    ///
    /// Operations already holding the previous descriptor keep using it.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the rebuilt descriptor is invalid or its class name
    /// belongs to another type; the previous descriptor stays in place in that case.
    pub fn remap(&self, entity_type: EntityType) -> MappingResult<Arc<TypeDescriptor>> {
        let descriptor = entity_type.describe();
        descriptor.validate()?;

        let mut by_type = self.by_type.write().unwrap_or_else(PoisonError::into_inner);
        let mut by_name = self.by_name.write().unwrap_or_else(PoisonError::into_inner);
        check_name_owner(&by_name, &descriptor, entity_type)?;

        let descriptor = Arc::new(descriptor);
        if let Some(previous) = by_type.insert(entity_type.type_id(), descriptor.clone()) {
            by_name.remove(previous.class_name());
        }
        by_name.insert(descriptor.class_name().to_string(), entity_type);

        debug!(class = descriptor.class_name(), "remapped entity type");

        Ok(descriptor)
    }
}

/// Fails if `descriptor`'s class name is registered for a type other than `entity_type`.
fn check_name_owner(
    by_name: &HashMap<String, EntityType>,
    descriptor: &TypeDescriptor,
    entity_type: EntityType,
) -> MappingResult<()> {
    match by_name.get(descriptor.class_name()) {
        Some(owner) if *owner != entity_type => Err(MappingError::Validation {
            class: descriptor.class_name().to_string(),
            reason: format!("class name is already registered for {}", owner.name()),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DescriptorBuilder, Entity};
    use std::thread;

    #[derive(Debug, Clone, Default)]
    struct Widget {
        id: String,
        version: i64,
        shadow_version: i64,
    }

    impl Entity for Widget {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.field::<String>("id", |w| &w.id, |w| &mut w.id).id();
            builder
                .field::<i64>("version", |w| &w.version, |w| &mut w.version)
                .version();
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Broken(Widget);

    impl Entity for Broken {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder
                .field::<i64>("version", |w| &w.0.version, |w| &mut w.0.version)
                .version();
            builder
                .field::<i64>("shadow_version", |w| &w.0.shadow_version, |w| {
                    &mut w.0.shadow_version
                })
                .version();
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Gadget(Widget);

    impl Entity for Gadget {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.class_name("Device");
            builder.field::<String>("id", |g| &g.0.id, |g| &mut g.0.id).id();
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Gizmo(Widget);

    impl Entity for Gizmo {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.class_name("Device");
            builder.field::<String>("id", |g| &g.0.id, |g| &mut g.0.id).id();
        }
    }

    #[test]
    fn concurrent_callers_observe_one_descriptor() {
        let registry = Arc::new(ClassRegistry::new());

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.get_or_build(EntityType::of::<Widget>()).unwrap())
            })
            .collect();

        let descriptors: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect();

        assert!(descriptors
            .windows(2)
            .all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    }

    #[test]
    fn class_names_resolve_to_types() {
        let registry = ClassRegistry::new();
        let descriptor = registry.get_or_build(EntityType::of::<Widget>()).unwrap();

        assert_eq!(
            registry.by_class_name(descriptor.class_name()),
            Some(EntityType::of::<Widget>())
        );
        assert_eq!(registry.by_class_name("Unknown"), None);
    }

    #[test]
    fn invalid_types_are_not_cached() {
        let registry = ClassRegistry::new();
        let err = registry.get_or_build(EntityType::of::<Broken>()).unwrap_err();

        assert!(err.is_validation());
        assert!(!registry.is_mapped(EntityType::of::<Broken>()));
    }

    #[test]
    fn remap_replaces_the_cached_descriptor() {
        let registry = ClassRegistry::new();
        let first = registry.get_or_build(EntityType::of::<Widget>()).unwrap();
        let second = registry.remap(EntityType::of::<Widget>()).unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &second,
            &registry.get_or_build(EntityType::of::<Widget>()).unwrap()
        ));
    }

    #[test]
    fn class_names_belong_to_one_type() {
        let registry = ClassRegistry::new();
        registry.get_or_build(EntityType::of::<Gadget>()).unwrap();

        let err = registry.get_or_build(EntityType::of::<Gizmo>()).unwrap_err();
        assert!(err.is_validation());
        assert!(!registry.is_mapped(EntityType::of::<Gizmo>()));
        assert_eq!(
            registry.by_class_name("Device"),
            Some(EntityType::of::<Gadget>())
        );

        assert!(registry.remap(EntityType::of::<Gizmo>()).unwrap_err().is_validation());
        assert!(registry.remap(EntityType::of::<Gadget>()).is_ok());
    }
}
