//! Mapping of embedded values.
//!
//! Embedded entities are written as nested documents through the full engine, so their own
//! hooks, codecs and references apply. Lists, sets, maps and optional values of entities
//! are handled here too, element by element.
//!
//! Within one write, an object that is still being written (a cycle back to an ancestor) is
//! skipped with a warning, and an object that was already written is not traversed again:
//! its finished document is reused.

use bson::{Bson, Document};
use futures::{FutureExt, future::BoxFuture};

use crate::{
    codec::{Codecs, key_string},
    context::MappingContext,
    descriptor::object_address,
    error::{MappingError, MappingResult},
    mapper::Mapper,
    value::{TypeShape, Value},
};

fn mismatch(shape: &TypeShape, found: impl ToString) -> MappingError {
    MappingError::type_mismatch(format!("{shape:?}"), found.to_string())
}

impl Mapper {
    /// Writes an embedded value.
    ///
    /// Returns `None` if the value was skipped, which only happens for cyclic entities.
    pub(crate) fn write_embedded(
        &self,
        ctx: &mut MappingContext,
        value: Value,
        shape: &TypeShape,
        codecs: Codecs<'_>,
        field: &str,
    ) -> MappingResult<Option<Bson>> {
        if value.is_null() {
            return Ok(Some(Bson::Null));
        }

        if shape.is_store_native() {
            return codecs.encode(value, shape).map(Some);
        }

        match (shape, value) {
            (TypeShape::Optional(inner), value) => {
                self.write_embedded(ctx, value, inner, codecs, field)
            }
            (TypeShape::Entity(_) | TypeShape::Polymorphic, Value::Object(object)) => {
                if ctx.in_flight.contains(&object_address(&object)) {
                    ctx.warn(
                        field,
                        format!(
                            "cyclic reference to embedded {}; value skipped",
                            object.entity_type().name()
                        ),
                    );
                    return Ok(None);
                }

                self.write_object(ctx, &object)
                    .map(|document| Some(Bson::Document(document)))
            }
            (TypeShape::List(element) | TypeShape::Set(element), Value::List(items)) => {
                let mut array = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(bson) = self.write_embedded(ctx, item, element, codecs, field)? {
                        array.push(bson);
                    }
                }
                Ok(Some(Bson::Array(array)))
            }
            (TypeShape::Map(key_shape, value_shape), Value::Map(entries)) => {
                let mut document = Document::new();
                for (key, value) in entries {
                    let key = key_string(codecs.encode(key, key_shape)?)?;
                    if let Some(bson) = self.write_embedded(ctx, value, value_shape, codecs, field)? {
                        document.insert(key, bson);
                    }
                }
                Ok(Some(Bson::Document(document)))
            }
            (shape, other) => Err(mismatch(shape, other.kind())),
        }
    }

    /// Reads an embedded value.
    pub(crate) fn read_embedded<'a>(
        &'a self,
        ctx: &'a mut MappingContext,
        stored: Bson,
        shape: &'a TypeShape,
        codecs: Codecs<'a>,
        field: &'a str,
    ) -> BoxFuture<'a, MappingResult<Value>> {
        async move {
            if stored == Bson::Null {
                return Ok(Value::Null);
            }

            if shape.is_store_native() {
                return codecs.decode(stored, shape);
            }

            match (shape, stored) {
                (TypeShape::Optional(inner), stored) => {
                    self.read_embedded(ctx, stored, inner, codecs, field).await
                }
                (TypeShape::Entity(entity_type), Bson::Document(document)) => self
                    .read_object(ctx, &document, Some(*entity_type))
                    .await
                    .map(Value::Object),
                (TypeShape::Polymorphic, Bson::Document(document)) => self
                    .read_object(ctx, &document, None)
                    .await
                    .map(Value::Object),
                (TypeShape::List(element) | TypeShape::Set(element), Bson::Array(items)) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.read_embedded(ctx, item, element, codecs, field).await?);
                    }
                    Ok(Value::List(values))
                }
                (TypeShape::List(element) | TypeShape::Set(element), single) => {
                    let value = self.read_embedded(ctx, single, element, codecs, field).await?;
                    Ok(Value::List(vec![value]))
                }
                (TypeShape::Map(key_shape, value_shape), Bson::Document(document)) => {
                    let mut entries = Vec::with_capacity(document.len());
                    for (key, value) in document {
                        let key = codecs.decode(Bson::String(key), key_shape)?;
                        let value = self
                            .read_embedded(ctx, value, value_shape, codecs, field)
                            .await?;
                        entries.push((key, value));
                    }
                    Ok(Value::Map(entries))
                }
                (shape, other) => Err(mismatch(shape, other)),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        descriptor::{DescriptorBuilder, Entity},
        error::MappingError,
        mapper::Mapper,
        value::{ObjectRef, Shared, shared},
    };
    use bson::doc;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, Default)]
    struct Address {
        city: String,
    }

    impl Entity for Address {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.class_name("Address");
            builder.field::<String>("city", |a| &a.city, |a| &mut a.city);
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Node {
        label: String,
        next: Option<Shared<Node>>,
    }

    impl Entity for Node {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.field::<String>("label", |n| &n.label, |n| &mut n.label);
            builder
                .field::<Option<Shared<Node>>>("next", |n| &n.next, |n| &mut n.next)
                .embedded();
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Person {
        home: Option<Shared<Address>>,
        work: Option<Shared<Address>>,
        history: Vec<Shared<Address>>,
        by_name: BTreeMap<String, Shared<Address>>,
        anything: Vec<ObjectRef>,
    }

    impl Entity for Person {
        fn describe(builder: &mut DescriptorBuilder<Self>) {
            builder.field::<Option<Shared<Address>>>("home", |p| &p.home, |p| &mut p.home);
            builder.field::<Option<Shared<Address>>>("work", |p| &p.work, |p| &mut p.work);
            builder.field::<Vec<Shared<Address>>>("history", |p| &p.history, |p| &mut p.history);
            builder.field::<BTreeMap<String, Shared<Address>>>(
                "by_name",
                |p| &p.by_name,
                |p| &mut p.by_name,
            );
            builder.field::<Vec<ObjectRef>>("anything", |p| &p.anything, |p| &mut p.anything);
        }
    }

    fn city(address: &Shared<Address>) -> String {
        address.read().unwrap().city.clone()
    }

    #[test]
    fn cycles_are_cut_with_a_warning() {
        let mapper = Mapper::new();
        let first = shared(Node {
            label: "first".into(),
            next: None,
        });
        let second = shared(Node {
            label: "second".into(),
            next: Some(first.clone()),
        });
        first.write().unwrap().next = Some(second.clone());

        let mut ctx = mapper.context();
        let document = mapper.to_document_shared(&mut ctx, &first).unwrap();

        let nested = document.get_document("next").unwrap();
        assert_eq!(nested.get_str("label").unwrap(), "second");
        assert!(!nested.contains_key("next"));
        assert_eq!(ctx.warnings().len(), 1);
        assert_eq!(ctx.warnings()[0].field, "Node.next");

        first.write().unwrap().next = None;
    }

    #[test]
    fn shared_objects_are_written_once_and_reused() {
        let mapper = Mapper::new();
        let office = shared(Address {
            city: "Lyon".into(),
        });
        let mut person = Person {
            home: Some(office.clone()),
            work: Some(office.clone()),
            ..Person::default()
        };

        let document = mapper.to_document(&mut person).unwrap();
        assert_eq!(document.get_document("home").unwrap(), document.get_document("work").unwrap());
        assert_eq!(document.get_document("home").unwrap().get_str("className").unwrap(), "Address");
    }

    #[tokio::test]
    async fn collections_and_maps_round_trip() {
        let mapper = Mapper::new();
        mapper.map::<Address>().unwrap();

        let mut by_name = BTreeMap::new();
        by_name.insert("north".to_string(), shared(Address { city: "Lille".into() }));
        let mut person = Person {
            history: vec![shared(Address { city: "Nantes".into() })],
            by_name,
            anything: vec![shared(Address { city: "Brest".into() }) as ObjectRef],
            ..Person::default()
        };

        let document = mapper.to_document(&mut person).unwrap();
        let mut ctx = mapper.context();
        let read = mapper.from_document::<Person>(&mut ctx, &document).await.unwrap();
        let read = read.read().unwrap();

        assert_eq!(city(&read.history[0]), "Nantes");
        assert_eq!(city(&read.by_name["north"]), "Lille");
        assert_eq!(read.anything[0].entity_type().name(), std::any::type_name::<Address>());
        assert!(read.home.is_none());
    }

    #[tokio::test]
    async fn single_value_reads_as_one_element_list() {
        let mapper = Mapper::new();
        let document = doc! { "history": { "city": "Metz" } };

        let mut ctx = mapper.context();
        let read = mapper.from_document::<Person>(&mut ctx, &document).await.unwrap();
        let read = read.read().unwrap();

        assert_eq!(read.history.len(), 1);
        assert_eq!(city(&read.history[0]), "Metz");
    }

    #[tokio::test]
    async fn unknown_class_names_fail_polymorphic_reads() {
        let mapper = Mapper::new();
        let document = doc! { "anything": [{ "className": "Nowhere", "city": "x" }] };

        let mut ctx = mapper.context();
        let err = mapper
            .from_document::<Person>(&mut ctx, &document)
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), MappingError::UnknownClass(name) if name == "Nowhere"));
        assert!(err.to_string().contains("Person.anything"));
    }
}
