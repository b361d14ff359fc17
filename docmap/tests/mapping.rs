use std::{collections::HashMap, fmt, sync::Arc, thread};

use chrono::{DateTime, Utc};
use docmap::{
    codec::{Codec, Codecs},
    descriptor::FieldDescriptor,
    prelude::*,
    value::{TypeShape, Value},
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, MappedEnum)]
enum Status {
    #[default]
    Draft,
    Published,
    Archived,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Dimensions {
    width: u32,
    height: u32,
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(collection = "addresses", class_name = "Address")]
struct Address {
    street: String,
    city: String,
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(collection = "profiles")]
struct Profile {
    #[mapped(id)]
    id: uuid::Uuid,
    #[mapped(name = "n")]
    name: String,
    initial: char,
    status: Status,
    history: Vec<Status>,
    joined: Option<DateTime<Utc>>,
    scores: HashMap<String, i32>,
    avatar: Vec<u8>,
    size: Serialized<Dimensions>,
    home: Address,
    previous: Vec<Address>,
    #[mapped(transient)]
    session: Option<String>,
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(class_name = "Circle")]
struct Circle {
    radius: f64,
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(class_name = "Square")]
struct Square {
    side: f64,
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(collection = "drawings")]
struct Drawing {
    #[mapped(id)]
    id: i64,
    shapes: Vec<ObjectRef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Money {
    cents: i64,
}

impl Persist for Money {
    fn shape() -> TypeShape {
        TypeShape::Custom("Money")
    }

    fn to_value(&self) -> MappingResult<Value> {
        Ok(Value::Int64(self.cents))
    }

    fn from_value(value: Value) -> MappingResult<Self> {
        i64::from_value(value).map(|cents| Money { cents })
    }
}

#[derive(Debug)]
struct MoneyCodec;

impl Codec for MoneyCodec {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::Custom("Money")
    }

    fn encode(&self, value: Value, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::Int64(cents) => Ok(Bson::String(format!("{}.{:02}", cents / 100, cents % 100))),
            other => Err(MappingError::type_mismatch("money", other.kind())),
        }
    }

    fn decode(&self, bson: Bson, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        let text = match &bson {
            Bson::String(text) => text,
            other => return Err(MappingError::type_mismatch("money", other.to_string())),
        };
        let cents = text
            .replace('.', "")
            .parse()
            .map_err(|_| MappingError::type_mismatch("money", text.clone()))?;

        Ok(Value::Int64(cents))
    }
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(collection = "wallets")]
struct Wallet {
    #[mapped(id)]
    id: i64,
    owner: String,
    balance: Money,
}

#[derive(Debug)]
struct UpperCase;

impl Codec for UpperCase {
    fn can_handle(&self, shape: &TypeShape, field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::String && field.is_some_and(|field| field.name() == "code")
    }

    fn encode(&self, value: Value, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::String(text) => Ok(Bson::String(text.to_uppercase())),
            other => Err(MappingError::type_mismatch("string", other.kind())),
        }
    }

    fn decode(&self, bson: Bson, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match bson {
            Bson::String(text) => Ok(Value::String(text.to_lowercase())),
            other => Err(MappingError::type_mismatch("string", other.to_string())),
        }
    }
}

#[derive(Debug)]
struct Reversed;

impl Codec for Reversed {
    fn can_handle(&self, shape: &TypeShape, _field: Option<&FieldDescriptor>) -> bool {
        *shape == TypeShape::String
    }

    fn encode(&self, value: Value, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Bson> {
        match value {
            Value::String(text) => Ok(Bson::String(text.chars().rev().collect())),
            other => Err(MappingError::type_mismatch("string", other.kind())),
        }
    }

    fn decode(&self, bson: Bson, _shape: &TypeShape, _codecs: Codecs<'_>) -> MappingResult<Value> {
        match bson {
            Bson::String(text) => Ok(Value::String(text.chars().rev().collect())),
            other => Err(MappingError::type_mismatch("string", other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(collection = "products", codec = "UpperCase")]
struct Product {
    #[mapped(id)]
    id: i64,
    code: String,
    name: String,
}

fn profile() -> Profile {
    Profile {
        id: uuid::Uuid::new_v4(),
        name: "Ada".to_string(),
        initial: 'A',
        status: Status::Published,
        history: vec![Status::Draft, Status::Published],
        joined: DateTime::from_timestamp_millis(1_700_000_000_123),
        scores: HashMap::from([("chess".to_string(), 1800), ("go".to_string(), 3)]),
        avatar: vec![0, 1, 2, 254],
        size: Serialized(Dimensions {
            width: 640,
            height: 480,
        }),
        home: Address {
            street: "12 Analytical Row".to_string(),
            city: "London".to_string(),
        },
        previous: vec![Address {
            street: "1 Engine Lane".to_string(),
            city: "Marylebone".to_string(),
        }],
        session: Some("transient".to_string()),
    }
}

#[tokio::test]
async fn derived_entities_round_trip() {
    let mapper = Mapper::new();
    let mut original = profile();

    let document = mapper.to_document(&mut original).unwrap();
    assert_eq!(document.get_str("n").unwrap(), "Ada");
    assert_eq!(document.get_str("initial").unwrap(), "A");
    assert!(!document.contains_key("session"));
    assert_eq!(
        document.get_document("home").unwrap().get_str("className").unwrap(),
        "Address"
    );

    let mut ctx = mapper.context();
    let read = mapper
        .from_document::<Profile>(&mut ctx, &document)
        .await
        .unwrap();
    let read = read.read().unwrap();

    assert_eq!(read.id, original.id);
    assert_eq!(read.name, original.name);
    assert_eq!(read.initial, 'A');
    assert_eq!(read.history, original.history);
    assert_eq!(read.joined, original.joined);
    assert_eq!(read.scores, original.scores);
    assert_eq!(read.avatar, original.avatar);
    assert_eq!(read.size, original.size);
    assert_eq!(read.home.city, "London");
    assert_eq!(read.previous.len(), 1);
    assert_eq!(read.previous[0].street, "1 Engine Lane");
    assert_eq!(read.session, None);
    assert!(ctx.warnings().is_empty());
}

#[tokio::test]
async fn enums_are_stored_by_variant_name() {
    let mapper = Mapper::new();
    let mut original = profile();
    original.status = Status::Archived;

    let document = mapper.to_document(&mut original).unwrap();
    assert_eq!(document.get_str("status").unwrap(), "Archived");
    assert_eq!(
        document.get_array("history").unwrap(),
        &vec![Bson::String("Draft".into()), Bson::String("Published".into())]
    );

    let mut tampered = document.clone();
    tampered.insert("status", "Deleted");

    let err = mapper
        .from_document::<Profile>(&mut mapper.context(), &tampered)
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), MappingError::TypeMismatch { .. }));
    assert!(err.to_string().contains("Profile.status"));
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, MappedEnum)]
enum Priority {
    #[default]
    Low,
    High,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ignored")
    }
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(collection = "tasks")]
struct Task {
    #[mapped(id)]
    id: i64,
    priority: Priority,
}

#[tokio::test]
async fn enum_names_ignore_display_formatting() {
    let mapper = Mapper::new();
    let mut task = Task {
        id: 1,
        priority: Priority::High,
    };
    assert_eq!(Priority::High.to_string(), "ignored");

    let document = mapper.to_document(&mut task).unwrap();
    assert_eq!(document.get_str("priority").unwrap(), "High");

    let read = mapper
        .from_document::<Task>(&mut mapper.context(), &document)
        .await
        .unwrap();
    assert_eq!(read.read().unwrap().priority, Priority::High);
}

#[tokio::test]
async fn polymorphic_values_are_read_by_class_name() {
    let mapper = Mapper::new();
    mapper.map::<Circle>().unwrap();
    mapper.map::<Square>().unwrap();

    let mut drawing = Drawing {
        id: 1,
        shapes: vec![
            shared(Circle { radius: 2.0 }) as ObjectRef,
            shared(Square { side: 3.0 }) as ObjectRef,
        ],
    };

    let document = mapper.to_document(&mut drawing).unwrap();
    let read = mapper
        .from_document::<Drawing>(&mut mapper.context(), &document)
        .await
        .unwrap();
    let read = read.read().unwrap();

    let names: Vec<&str> = read
        .shapes
        .iter()
        .map(|shape| shape.entity_type().name())
        .collect();
    assert!(names[0].ends_with("Circle"));
    assert!(names[1].ends_with("Square"));

    let circle = docmap::value::downcast_object::<Circle>(read.shapes[0].clone()).unwrap();
    assert_eq!(circle.read().unwrap().radius, 2.0);
}

#[tokio::test]
async fn unknown_classes_fail_polymorphic_reads() {
    let mapper = Mapper::new();
    let document = doc! {
        "_id": 1_i64,
        "shapes": [{ "className": "Hexagon", "side": 1.0 }],
    };

    let err = mapper
        .from_document::<Drawing>(&mut mapper.context(), &document)
        .await
        .unwrap_err();
    assert!(matches!(err.root_cause(), MappingError::UnknownClass(name) if name == "Hexagon"));
}

#[test]
fn types_without_codecs_are_skipped_with_a_warning() {
    let mapper = Mapper::new();
    let mut wallet = Wallet {
        id: 1,
        owner: "Ada".to_string(),
        balance: Money { cents: 250 },
    };

    let mut ctx = mapper.context();
    let document = mapper.to_document_in(&mut ctx, &mut wallet).unwrap();

    assert!(!document.contains_key("balance"));
    assert_eq!(document.get_str("owner").unwrap(), "Ada");
    assert_eq!(ctx.warnings().len(), 1);
    assert_eq!(ctx.warnings()[0].field, "Wallet.balance");
}

#[tokio::test]
async fn registered_codecs_handle_custom_types() {
    let mapper = Mapper::builder().codec(MoneyCodec).build();
    let mut wallet = Wallet {
        id: 1,
        owner: "Ada".to_string(),
        balance: Money { cents: 1205 },
    };

    let document = mapper.to_document(&mut wallet).unwrap();
    assert_eq!(document.get_str("balance").unwrap(), "12.05");

    let read = mapper
        .from_document::<Wallet>(&mut mapper.context(), &document)
        .await
        .unwrap();
    assert_eq!(read.read().unwrap().balance, Money { cents: 1205 });
}

#[tokio::test]
async fn class_codecs_take_priority_over_mapper_codecs() {
    let mapper = Mapper::builder().codec(Reversed).build();
    let mut product = Product {
        id: 4,
        code: "abc".to_string(),
        name: "tea".to_string(),
    };

    let document = mapper.to_document(&mut product).unwrap();
    assert_eq!(document.get_str("code").unwrap(), "ABC");
    assert_eq!(document.get_str("name").unwrap(), "aet");
    assert_eq!(document.get_i64("_id").unwrap(), 4);

    let read = mapper
        .from_document::<Product>(&mut mapper.context(), &document)
        .await
        .unwrap();
    let read = read.read().unwrap();
    assert_eq!(read.code, "abc");
    assert_eq!(read.name, "tea");
}

#[test]
fn concurrent_registration_builds_one_descriptor() {
    let mapper = Mapper::new();

    let descriptors: Vec<_> = (0..8)
        .map(|_| {
            let mapper = mapper.clone();
            thread::spawn(move || mapper.map::<Profile>().unwrap())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert!(descriptors.iter().all(|descriptor| Arc::ptr_eq(descriptor, &descriptors[0])));
    assert_eq!(descriptors[0].collection(), "profiles");
    assert!(mapper.registry().is_mapped(docmap::EntityType::of::<Profile>()));
}

#[test]
fn keys_are_derived_from_identities() {
    let mapper = Mapper::new();
    let original = profile();

    let key = mapper.key_of(&original).unwrap();
    assert_eq!(key.kind(), "profiles");

    let err = mapper.key_of(&Wallet::default()).unwrap_err();
    assert!(matches!(err, MappingError::IdentityRequired(_)));
}
