use revbase_core::{
    AnyBackend, CollectionOptions, CollectionSchema, CoreError, Database, DocumentBackend,
    FieldSpec, Filter, Query, Record, RevisionSequencer, Value, VersionedCollection,
};
use serde_json::json;

fn databases() -> Vec<Database> {
    vec![
        Database::connect("sqlite:///:memory:").unwrap(),
        Database::new(AnyBackend::Document(DocumentBackend::new())),
    ]
}

fn test_schema(name: &str) -> CollectionSchema {
    CollectionSchema::new(
        name,
        vec![
            FieldSpec::text("key").primary_key(),
            FieldSpec::dict(
                "dict_field",
                vec![
                    FieldSpec::enumeration("first_key", ["Value1", "Value2"]),
                    FieldSpec::integer("second_key"),
                ],
            ),
        ],
    )
    .unwrap()
}

fn open(database: &Database) -> VersionedCollection<AnyBackend> {
    database
        .versioned(test_schema("test"), CollectionOptions::default())
        .unwrap()
}

fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
}

fn rows(records: Vec<Record>) -> Value {
    Value::Array(records.into_iter().map(Value::Object).collect())
}

fn first_value1(collection: &VersionedCollection<AnyBackend>) -> Record {
    collection
        .insert(&record(json!({
            "key": "first",
            "dict_field.first_key": "Value1",
            "dict_field.second_key": 1,
        })))
        .unwrap()
}

#[test]
fn insert_opens_an_unbounded_interval() {
    for database in databases() {
        let collection = open(&database);
        assert_eq!(collection.current_revision().unwrap(), 0);

        let inserted = first_value1(&collection);
        assert_eq!(
            Value::Object(inserted),
            json!({
                "key": "first",
                "dict_field": {"first_key": "Value1", "second_key": 1},
                "valid_since_revision": 1,
                "valid_until_revision": -1,
            })
        );
        assert_eq!(collection.current_revision().unwrap(), 1);
        assert_eq!(database.current_revision().unwrap(), 1);
    }
}

#[test]
fn update_closes_previous_interval_and_appends_merged_record() {
    for database in databases() {
        let collection = open(&database);
        first_value1(&collection);

        let (previous, updated) = collection
            .update(&record(json!({"key": "first", "dict_field.first_key": "Value2"})))
            .unwrap();
        assert_eq!(
            Value::Object(previous),
            json!({
                "key": "first",
                "dict_field": {"first_key": "Value1", "second_key": 1},
                "valid_since_revision": 1,
                "valid_until_revision": -1,
            })
        );
        assert_eq!(
            Value::Object(updated),
            json!({
                "key": "first",
                "dict_field": {"first_key": "Value2", "second_key": 1},
                "valid_since_revision": 2,
                "valid_until_revision": -1,
            })
        );

        assert_eq!(
            rows(collection.get_history(&Query::all()).unwrap()),
            json!([
                {
                    "key": "first",
                    "dict_field": {"first_key": "Value2", "second_key": 1},
                    "valid_since_revision": 2,
                    "valid_until_revision": -1,
                },
                {
                    "key": "first",
                    "dict_field": {"first_key": "Value1", "second_key": 1},
                    "valid_since_revision": 1,
                    "valid_until_revision": 2,
                },
            ])
        );
        assert_eq!(
            rows(collection.get(&Query::all()).unwrap()),
            json!([{
                "key": "first",
                "dict_field": {"first_key": "Value2", "second_key": 1},
                "valid_since_revision": 2,
                "valid_until_revision": -1,
            }])
        );
    }
}

#[test]
fn update_with_identical_values_still_appends_an_interval() {
    for database in databases() {
        let collection = open(&database);
        first_value1(&collection);

        let (_, updated) = collection.update(&record(json!({"key": "first"}))).unwrap();
        assert_eq!(updated["valid_since_revision"], json!(2));
        assert_eq!(updated["dict_field"], json!({"first_key": "Value1", "second_key": 1}));

        assert_eq!(collection.get_history(&Query::all()).unwrap().len(), 2);
        let current = collection.get(&Query::all()).unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0]["valid_since_revision"], json!(2));
    }
}

#[test]
fn explicit_null_clears_nullable_sub_field() {
    for database in databases() {
        let collection = open(&database);
        first_value1(&collection);

        let (_, updated) = collection
            .update(&record(json!({"key": "first", "dict_field.second_key": null})))
            .unwrap();
        assert_eq!(
            updated["dict_field"],
            json!({"first_key": "Value1", "second_key": null})
        );
    }
}

#[test]
fn delete_closes_current_record_and_is_idempotent() {
    for database in databases() {
        let collection = open(&database);
        first_value1(&collection);
        collection
            .update(&record(json!({"key": "first", "dict_field.first_key": "Value2"})))
            .unwrap();

        let key = Filter::all().eq("key", "first");
        assert_eq!(collection.delete(&key).unwrap(), 1);
        assert_eq!(collection.delete(&key).unwrap(), 0);
        assert_eq!(collection.current_revision().unwrap(), 3);

        assert!(collection.get(&Query::all()).unwrap().is_empty());
        let history = collection.get_history(&Query::all()).unwrap();
        assert_eq!(history[0]["valid_since_revision"], json!(2));
        assert_eq!(history[0]["valid_until_revision"], json!(3));
        assert_eq!(history[1]["valid_until_revision"], json!(2));
    }
}

#[test]
fn filtered_delete_spends_one_revision_per_entity() {
    for database in databases() {
        let collection = open(&database);
        collection.insert(&record(json!({"key": "a"}))).unwrap();
        collection.insert(&record(json!({"key": "b"}))).unwrap();

        assert_eq!(collection.delete(&Filter::all()).unwrap(), 2);
        let closed: Vec<_> = collection
            .get_history(&Query::all())
            .unwrap()
            .into_iter()
            .map(|row| (row["key"].clone(), row["valid_until_revision"].clone()))
            .collect();
        assert_eq!(
            closed,
            vec![(json!("b"), json!(4)), (json!("a"), json!(3))]
        );
    }
}

#[test]
fn insert_on_current_key_is_rejected_but_allowed_after_delete() {
    for database in databases() {
        let collection = open(&database);
        first_value1(&collection);

        let duplicate = record(json!({"key": "first"}));
        match collection.insert(&duplicate) {
            Err(CoreError::AlreadyExists { payload }) => assert_eq!(payload, duplicate),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(collection.current_revision().unwrap(), 1);

        collection.delete(&Filter::all().eq("key", "first")).unwrap();
        let reinserted = collection.insert(&duplicate).unwrap();
        assert_eq!(reinserted["valid_since_revision"], json!(3));
        assert_eq!(collection.get_history(&Query::all()).unwrap().len(), 2);
    }
}

#[test]
fn update_of_unknown_key_reports_not_found() {
    for database in databases() {
        let collection = open(&database);
        match collection.update(&record(json!({"key": "unknown"}))) {
            Err(CoreError::NotFound { requested }) => assert_eq!(
                Value::Object(requested),
                json!({"key": "unknown", "valid_until_revision": -1})
            ),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(collection.current_revision().unwrap(), 0);
    }
}

#[test]
fn invalid_payloads_are_rejected_before_any_revision() {
    for database in databases() {
        let collection = open(&database);

        match collection.insert(&Record::new()) {
            Err(CoreError::ValidationFailed { errors, .. }) => {
                assert_eq!(errors[""], vec!["No data provided.".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let payload = record(json!({"dict_field.second_key": "invalid"}));
        match collection.insert(&payload) {
            Err(CoreError::ValidationFailed { errors, received }) => {
                assert_eq!(
                    errors["key"],
                    vec!["Missing data for required field.".to_string()]
                );
                assert_eq!(
                    errors["dict_field.second_key"],
                    vec!["Not a valid int.".to_string()]
                );
                assert_eq!(received, payload);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(collection.current_revision().unwrap(), 0);
    }
}

#[test]
fn revisions_are_shared_across_collections() {
    for database in databases() {
        let first = database
            .versioned(test_schema("first_collection"), CollectionOptions::default())
            .unwrap();
        let second = database
            .versioned(test_schema("second_collection"), CollectionOptions::default())
            .unwrap();

        let a = first.insert(&record(json!({"key": "a"}))).unwrap();
        let b = second.insert(&record(json!({"key": "b"}))).unwrap();
        let (_, a2) = first.update(&record(json!({"key": "a"}))).unwrap();

        assert_eq!(a["valid_since_revision"], json!(1));
        assert_eq!(b["valid_since_revision"], json!(2));
        assert_eq!(a2["valid_since_revision"], json!(3));
        assert_eq!(second.current_revision().unwrap(), 3);
    }
}

#[test]
fn insert_many_gives_each_entry_its_own_revision() {
    for database in databases() {
        let collection = open(&database);
        let inserted = collection
            .insert_many(&[
                record(json!({"key": "a"})),
                record(json!({"key": "b"})),
                record(json!({"key": "c"})),
            ])
            .unwrap();
        let since: Vec<_> = inserted
            .iter()
            .map(|row| row["valid_since_revision"].clone())
            .collect();
        assert_eq!(since, vec![json!(1), json!(2), json!(3)]);
    }
}

#[test]
fn insert_many_reports_failed_indexes_and_keeps_the_rest() {
    for database in databases() {
        let collection = open(&database);
        let result = collection.insert_many(&[
            record(json!({"key": "a"})),
            record(json!({"key": "a"})),
            record(json!({"key": "b"})),
        ]);

        match result {
            Err(CoreError::ConstraintViolation {
                failures,
                committed,
            }) => {
                assert_eq!(committed, vec![0, 2]);
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[&1], CoreError::AlreadyExists { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let current = collection.get(&Query::all()).unwrap();
        assert_eq!(current.len(), 2);
        assert_eq!(current[1]["valid_since_revision"], json!(2));
    }
}

#[test]
fn update_many_with_unknown_key_fails_only_that_index() {
    for database in databases() {
        let collection = open(&database);
        collection
            .insert_many(&[record(json!({"key": "a"})), record(json!({"key": "b"}))])
            .unwrap();

        let result = collection.update_many(&[
            record(json!({"key": "a", "dict_field.second_key": 5})),
            record(json!({"key": "missing"})),
            record(json!({"key": "b", "dict_field.second_key": 6})),
        ]);
        match result {
            Err(CoreError::ConstraintViolation {
                failures,
                committed,
            }) => {
                assert_eq!(committed, vec![0, 2]);
                assert!(matches!(failures[&1], CoreError::NotFound { .. }));
            }
            other => panic!("unexpected result: {other:?}"),
        }

        let b = collection
            .get_one(&Filter::all().eq("key", "b"))
            .unwrap()
            .unwrap();
        assert_eq!(b["dict_field"]["second_key"], json!(6));
        assert_eq!(b["valid_since_revision"], json!(4));
    }
}

#[test]
fn delete_many_runs_each_filter() {
    for database in databases() {
        let collection = open(&database);
        collection
            .insert_many(&[record(json!({"key": "a"})), record(json!({"key": "b"}))])
            .unwrap();

        let removed = collection
            .delete_many(&[
                Filter::all().eq("key", "a"),
                Filter::all().eq("key", "missing"),
            ])
            .unwrap();
        assert_eq!(removed, vec![1, 0]);
        assert_eq!(collection.get(&Query::all()).unwrap().len(), 1);
    }
}

#[test]
fn reads_filter_on_dotted_fields_and_paginate() {
    for database in databases() {
        let collection = open(&database);
        collection
            .insert_many(&[
                record(json!({"key": "a", "dict_field": {"first_key": "Value1", "second_key": 1}})),
                record(json!({"key": "b", "dict_field": {"first_key": "Value2", "second_key": 2}})),
                record(json!({"key": "c", "dict_field": {"first_key": "Value1", "second_key": 3}})),
            ])
            .unwrap();

        let value1 = collection
            .get(&Query::filtered(Filter::all().eq("dict_field.first_key", "Value1")))
            .unwrap();
        assert_eq!(value1.len(), 2);

        let by_int = collection
            .get(&Query::filtered(Filter::all().eq("dict_field.second_key", "2")))
            .unwrap();
        assert_eq!(by_int.len(), 1);
        assert_eq!(by_int[0]["key"], json!("b"));

        let any_of = collection
            .get(&Query::filtered(
                Filter::all().any_of("key", vec![json!("a"), json!("c")]),
            ))
            .unwrap();
        assert_eq!(any_of.len(), 2);

        let page = collection
            .get(&Query::all().with_offset(1).with_limit(1))
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0]["key"], json!("b"));

        let since = collection
            .get_history(&Query::filtered(Filter::all().eq("valid_since_revision", 3)))
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0]["key"], json!("c"));
    }
}

#[test]
fn unknown_criteria_are_ignored_and_mistyped_ones_rejected() {
    for database in databases() {
        let collection = open(&database);
        collection
            .insert_many(&[record(json!({"key": "a"})), record(json!({"key": "b"}))])
            .unwrap();

        let rows = collection
            .get(&Query::filtered(Filter::all().eq("unknown", 1).eq("key", "a")))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["key"], json!("a"));
        assert_eq!(
            collection
                .get(&Query::filtered(Filter::all().eq("dict_field.unknown", "x")))
                .unwrap()
                .len(),
            2
        );
        assert_eq!(
            collection
                .delete(&Filter::all().eq("dict_field.unknown", "x"))
                .unwrap(),
            2
        );

        match collection.get(&Query::filtered(
            Filter::all().eq("dict_field.second_key", "invalid"),
        )) {
            Err(CoreError::ValidationFailed { errors, .. }) => {
                assert_eq!(
                    errors["dict_field.second_key"],
                    vec!["Not a valid int.".to_string()]
                );
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

#[test]
fn get_one_returns_none_single_or_rejects_many() {
    for database in databases() {
        let collection = open(&database);
        assert!(collection.get_one(&Filter::all()).unwrap().is_none());

        collection
            .insert_many(&[record(json!({"key": "a"})), record(json!({"key": "b"}))])
            .unwrap();
        let a = collection.get_one(&Filter::all().eq("key", "a")).unwrap().unwrap();
        assert_eq!(a["key"], json!("a"));

        match collection.get_one(&Filter::all()) {
            Err(CoreError::ValidationFailed { errors, .. }) => assert_eq!(
                errors[""],
                vec!["More than one result: Consider another filtering.".to_string()]
            ),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

#[test]
fn get_as_of_reconstructs_past_states() {
    for database in databases() {
        let collection = open(&database);
        first_value1(&collection);
        collection
            .update(&record(json!({"key": "first", "dict_field.first_key": "Value2"})))
            .unwrap();
        collection.insert(&record(json!({"key": "second"}))).unwrap();
        collection.delete(&Filter::all().eq("key", "first")).unwrap();

        let at = |revision| collection.get_as_of(revision, &Query::all()).unwrap();
        assert!(at(0).is_empty());
        assert_eq!(at(1)[0]["dict_field"]["first_key"], json!("Value1"));
        assert_eq!(at(2)[0]["dict_field"]["first_key"], json!("Value2"));
        assert_eq!(at(3).len(), 2);
        let after_delete = at(4);
        assert_eq!(after_delete.len(), 1);
        assert_eq!(after_delete[0]["key"], json!("second"));
    }
}

#[test]
fn auto_incremented_keys_are_never_reused_within_history() {
    for database in databases() {
        let schema = CollectionSchema::new(
            "numbered",
            vec![
                FieldSpec::integer("id").primary_key().auto_increment(),
                FieldSpec::text("label"),
            ],
        )
        .unwrap();
        let collection = database.versioned(schema, CollectionOptions::default()).unwrap();

        let first = collection.insert(&record(json!({"label": "a"}))).unwrap();
        let second = collection
            .insert(&record(json!({"id": 40, "label": "b"})))
            .unwrap();
        assert_eq!(first["id"], json!(1));
        assert_eq!(second["id"], json!(2));

        collection.delete(&Filter::all().eq("id", 2)).unwrap();
        let third = collection.insert(&record(json!({"label": "c"}))).unwrap();
        assert_eq!(third["id"], json!(3));
    }
}

#[test]
fn auto_text_keys_are_uuids() {
    for database in databases() {
        let schema = CollectionSchema::new(
            "documents",
            vec![
                FieldSpec::text("uid").primary_key().auto_increment(),
                FieldSpec::text("title"),
            ],
        )
        .unwrap();
        let collection = database.versioned(schema, CollectionOptions::default()).unwrap();

        let inserted = collection.insert(&record(json!({"title": "a"}))).unwrap();
        let uid = inserted["uid"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(uid).is_ok());
    }
}

#[test]
fn unique_fields_only_conflict_with_current_records() {
    for database in databases() {
        let schema = CollectionSchema::new(
            "accounts",
            vec![
                FieldSpec::integer("id").primary_key(),
                FieldSpec::text("email").unique(),
            ],
        )
        .unwrap();
        let collection = database.versioned(schema, CollectionOptions::default()).unwrap();

        collection
            .insert(&record(json!({"id": 1, "email": "a@example.com"})))
            .unwrap();
        let clash = record(json!({"id": 2, "email": "a@example.com"}));
        match collection.insert(&clash) {
            Err(CoreError::AlreadyExists { payload }) => assert_eq!(payload, clash),
            other => panic!("unexpected result: {other:?}"),
        }

        collection.update(&record(json!({"id": 1, "email": "b@example.com"}))).unwrap();
        collection.insert(&clash).unwrap();
        assert_eq!(collection.get(&Query::all()).unwrap().len(), 2);
    }
}
