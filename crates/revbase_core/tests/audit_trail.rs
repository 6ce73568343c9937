use revbase_core::{
    AnyBackend, AuditAction, CollectionOptions, CollectionSchema, CoreError, Database,
    DocumentBackend, FieldSpec, Filter, Query, Record, StaticActor, Value,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn databases() -> Vec<Database> {
    vec![
        Database::connect("sqlite:///:memory:").unwrap(),
        Database::new(AnyBackend::Document(DocumentBackend::new())),
    ]
}

fn plain_schema() -> CollectionSchema {
    CollectionSchema::new(
        "prim_int_table_name",
        vec![
            FieldSpec::integer("key").primary_key().auto_increment(),
            FieldSpec::text("other"),
        ],
    )
    .unwrap()
}

fn versioned_schema() -> CollectionSchema {
    CollectionSchema::new(
        "versioned_table_name",
        vec![
            FieldSpec::text("key").primary_key(),
            FieldSpec::integer("value"),
        ],
    )
    .unwrap()
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

#[test]
fn plain_audit_numbers_entries_and_keeps_snapshots() {
    for database in databases() {
        let collection = database
            .collection(plain_schema(), CollectionOptions::audited())
            .unwrap();

        collection.insert(&record(json!({"other": "test1"}))).unwrap();
        collection.delete(&Filter::all()).unwrap();
        collection.insert(&record(json!({"other": "test1"}))).unwrap();
        collection
            .update(&record(json!({"key": 1, "other": "test2"})))
            .unwrap();

        let entries = collection.get_audit(&Query::all()).unwrap();
        let summary: Vec<_> = entries
            .iter()
            .map(|entry| (entry.revision, entry.action, Value::Object(entry.snapshot.clone())))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, AuditAction::Insert, json!({"key": 1, "other": "test1"})),
                (2, AuditAction::Delete, json!({"key": 1, "other": "test1"})),
                (3, AuditAction::Insert, json!({"key": 1, "other": "test1"})),
                (4, AuditAction::Update, json!({"key": 1, "other": "test2"})),
            ]
        );
        assert!(entries.iter().all(|entry| entry.actor.is_empty()));

        let row = entries[0].to_record();
        assert_eq!(row["audit_action"], json!("Insert"));
        assert_eq!(row["revision"], json!(1));
        assert!(row["audit_date_utc"].as_str().unwrap().ends_with('Z'));
    }
}

#[test]
fn plain_audit_is_filterable_on_snapshot_and_audit_fields() {
    for database in databases() {
        let collection = database
            .collection(plain_schema(), CollectionOptions::audited())
            .unwrap();
        collection
            .insert_many(&[record(json!({"other": "a"})), record(json!({"other": "b"}))])
            .unwrap();
        collection.delete(&Filter::all().eq("other", "a")).unwrap();

        let about_a = collection
            .get_audit(&Query::filtered(Filter::all().eq("other", "a")))
            .unwrap();
        assert_eq!(about_a.len(), 2);

        let deletes = collection
            .get_audit(&Query::filtered(Filter::all().eq("audit_action", "Delete")))
            .unwrap();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].revision, 3);

        let by_revision = collection
            .get_audit(&Query::filtered(Filter::all().eq("revision", 2)))
            .unwrap();
        assert_eq!(by_revision[0].snapshot["other"], json!("b"));
    }
}

#[test]
fn versioned_audit_borrows_engine_revisions() {
    for database in databases() {
        let collection = database
            .versioned(versioned_schema(), CollectionOptions::audited())
            .unwrap();
        collection.insert(&record(json!({"key": "a", "value": 1}))).unwrap();
        collection.update(&record(json!({"key": "a", "value": 2}))).unwrap();
        collection.delete(&Filter::all()).unwrap();

        let entries = collection.get_audit(&Query::all()).unwrap();
        let summary: Vec<_> = entries
            .iter()
            .map(|entry| (entry.revision, entry.action))
            .collect();
        assert_eq!(
            summary,
            vec![
                (1, AuditAction::Insert),
                (2, AuditAction::Update),
                (3, AuditAction::Delete),
            ]
        );
        assert!(entries.iter().all(|entry| entry.snapshot.is_empty()));
    }
}

#[test]
fn failed_mutations_leave_no_audit_entry() {
    for database in databases() {
        let collection = database
            .versioned(versioned_schema(), CollectionOptions::audited())
            .unwrap();
        collection.insert(&record(json!({"key": "a"}))).unwrap();
        assert!(collection.insert(&record(json!({"key": "a"}))).is_err());
        assert!(collection.update(&record(json!({"key": "b"}))).is_err());

        assert_eq!(collection.get_audit(&Query::all()).unwrap().len(), 1);
    }
}

#[test]
fn actor_comes_from_database_or_collection_options() {
    for database in databases() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let database = database.with_actor(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "service".to_string()
        });

        let from_database = database
            .collection(plain_schema(), CollectionOptions::audited())
            .unwrap();
        from_database.insert(&record(json!({"other": "x"}))).unwrap();
        assert_eq!(
            from_database.get_audit(&Query::all()).unwrap()[0].actor,
            "service"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let overridden = database
            .versioned(
                versioned_schema(),
                CollectionOptions::audited().with_actor(StaticActor("alice".to_string())),
            )
            .unwrap();
        overridden.insert(&record(json!({"key": "a"}))).unwrap();
        assert_eq!(overridden.get_audit(&Query::all()).unwrap()[0].actor, "alice");
    }
}

#[test]
fn unaudited_collections_reject_audit_reads() {
    for database in databases() {
        let collection = database
            .collection(plain_schema(), CollectionOptions::default())
            .unwrap();
        assert!(matches!(
            collection.get_audit(&Query::all()),
            Err(CoreError::Schema(_))
        ));
    }
}
