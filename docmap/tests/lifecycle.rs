use std::{
    any::Any,
    sync::{Arc, Mutex},
};

use docmap::{TypeDescriptor, memory::InMemoryStore, prelude::*};

#[derive(Debug, Clone, Default, Entity)]
#[entity(class_name = "Line", pre_persist = "touch", post_load = "mark")]
struct Line {
    sku: String,
    quantity: i32,
    touched: bool,
    #[mapped(transient)]
    loaded: bool,
}

impl Line {
    fn touch(&mut self, _document: &mut Document) {
        self.touched = true;
    }

    fn mark(&mut self, _document: &mut Document) {
        self.loaded = true;
    }
}

#[derive(Debug, Clone, Default, Entity)]
#[entity(
    collection = "tickets",
    class_name = "Ticket",
    pre_persist = "stamp",
    pre_save = "audit",
    pre_load = "migrate",
    post_load = "loaded"
)]
struct Ticket {
    #[mapped(id)]
    id: i64,
    title: String,
    stamped: bool,
    lines: Vec<Line>,
    #[mapped(transient)]
    events: Vec<String>,
}

impl Ticket {
    fn stamp(&mut self, _document: &mut Document) {
        self.stamped = true;
        self.events.push("stamp".to_string());
    }

    fn audit(&mut self, document: &mut Document) {
        document.insert("audited", true);
    }

    fn migrate(&mut self, document: &mut Document) {
        if let Some(name) = document.remove("name") {
            document.insert("title", name);
        }
    }

    fn loaded(&mut self, _document: &mut Document) {
        self.events.push("loaded".to_string());
    }
}

#[derive(Debug, Clone, Default)]
struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    fn record(&self, phase: &str, descriptor: &TypeDescriptor) {
        self.0
            .lock()
            .unwrap()
            .push(format!("{phase}:{}", descriptor.class_name()));
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl EntityInterceptor for Recorder {
    fn pre_persist(&self, descriptor: &TypeDescriptor, entity: &mut dyn Any, _document: &mut Document) {
        self.record("pre_persist", descriptor);
        if let Some(ticket) = entity.downcast_mut::<Ticket>() {
            ticket.events.push("interceptor".to_string());
        }
    }

    fn pre_save(&self, descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {
        self.record("pre_save", descriptor);
    }

    fn pre_load(&self, descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {
        self.record("pre_load", descriptor);
    }

    fn post_load(&self, descriptor: &TypeDescriptor, _entity: &mut dyn Any, _document: &mut Document) {
        self.record("post_load", descriptor);
    }
}

fn ticket() -> Ticket {
    Ticket {
        id: 1,
        title: "Broken build".to_string(),
        lines: vec![Line {
            sku: "B-12".to_string(),
            quantity: 2,
            ..Line::default()
        }],
        ..Ticket::default()
    }
}

#[test]
fn write_hooks_run_outside_in() {
    let recorder = Recorder::default();
    let mapper = Mapper::builder().interceptor(recorder.clone()).build();
    let mut ticket = ticket();

    let document = mapper.to_document(&mut ticket).unwrap();

    assert_eq!(
        recorder.take(),
        vec![
            "pre_persist:Ticket",
            "pre_persist:Line",
            "pre_save:Line",
            "pre_save:Ticket",
        ]
    );
    assert_eq!(ticket.events, vec!["stamp", "interceptor"]);
    assert!(document.get_bool("stamped").unwrap());
    assert!(document.get_bool("audited").unwrap());

    let line = document.get_array("lines").unwrap()[0].as_document().unwrap();
    assert!(line.get_bool("touched").unwrap());
    assert!(!line.contains_key("loaded"));
}

#[tokio::test]
async fn read_hooks_run_outside_in() {
    let recorder = Recorder::default();
    let mapper = Mapper::builder().interceptor(recorder.clone()).build();
    let document = mapper.to_document(&mut ticket()).unwrap();
    recorder.take();

    let read = mapper
        .from_document::<Ticket>(&mut mapper.context(), &document)
        .await
        .unwrap();

    assert_eq!(
        recorder.take(),
        vec![
            "pre_load:Ticket",
            "pre_load:Line",
            "post_load:Line",
            "post_load:Ticket",
        ]
    );

    let read = read.read().unwrap();
    assert_eq!(read.events, vec!["loaded"]);
    assert_eq!(read.lines.len(), 1);
    assert_eq!(read.lines[0].quantity, 2);
    assert!(read.lines[0].loaded);
}

#[tokio::test]
async fn pre_load_hooks_can_rewrite_stored_documents() {
    let mapper = Mapper::new();
    let legacy = doc! {
        "_id": 4_i64,
        "className": "Ticket",
        "name": "Imported ticket",
    };

    let read = mapper
        .from_document::<Ticket>(&mut mapper.context(), &legacy)
        .await
        .unwrap();

    assert_eq!(read.read().unwrap().title, "Imported ticket");
}

#[tokio::test]
async fn saved_documents_carry_hook_changes() {
    let store = InMemoryStore::new();
    let datastore = Datastore::new(store.clone());
    let mut ticket = ticket();

    datastore.save(&mut ticket).await.unwrap();
    assert!(ticket.stamped);

    let stored = store
        .fetch_document("tickets", &Bson::Int64(1))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.get_bool("audited").unwrap());
    assert_eq!(stored.get_str("className").unwrap(), "Ticket");

    let loaded = datastore.get::<Ticket>(1_i64).await.unwrap().unwrap();
    assert_eq!(loaded.read().unwrap().events, vec!["loaded"]);
}
