//! Input normalization against a collection schema.
//!
//! # Responsibility
//! - Expand dotted keys, drop unknown fields and coerce values to the
//!   declared field kinds before records reach the engine.
//! - Merge partial updates over the previous state of a record.
//! - Type-check filter criteria.
//!
//! # Invariants
//! - Every failure is reported as `ValidationFailed` keyed by the dotted
//!   field name, carrying the payload exactly as received.
//! - Auto-incremented fields are never taken from caller input on insert.

use crate::error::{CoreError, CoreResult, FieldErrors};
use crate::model::filter::{Condition, Filter};
use crate::model::record::{expand_dotted, Record, Value};
use crate::model::schema::{CollectionSchema, FieldKind, FieldSpec};
use log::debug;

const MISSING: &str = "Missing data for required field.";
const NO_DATA: &str = "No data provided.";

/// Normalizes an insert payload into a complete record.
///
/// Every declared field is present in the result: provided values are
/// coerced, missing ones take their default or `null`, and dicts default to a
/// dict of nulls. Auto-incremented fields are left `null` for the caller to
/// generate.
pub fn prepare_insert(schema: &CollectionSchema, input: &Record) -> CoreResult<Record> {
    if input.is_empty() {
        return Err(CoreError::validation("", NO_DATA, input));
    }
    let expanded = expand_dotted(input);
    let mut errors = FieldErrors::new();
    let mut record = Record::new();

    for field in schema.fields() {
        let provided = expanded.get(&field.name).filter(|value| !value.is_null());
        let value = match provided {
            _ if field.auto_increment => Value::Null,
            Some(value) => match coerce(&field.name, &field.kind, value, &mut errors) {
                Some(value) => complete_dict(&field.kind, value),
                None => continue,
            },
            None => match &field.default {
                Some(default) => default.clone(),
                None if field.primary_key || !field.nullable => {
                    push_error(&mut errors, &field.name, MISSING);
                    continue;
                }
                None => empty_value(&field.kind),
            },
        };
        record.insert(field.name.clone(), value);
    }

    finish(errors, input).map(|()| record)
}

/// Normalizes an update payload.
///
/// Only provided fields are returned; primary key fields are mandatory
/// because they identify the entity to update.
pub fn prepare_update(schema: &CollectionSchema, input: &Record) -> CoreResult<Record> {
    if input.is_empty() {
        return Err(CoreError::validation("", NO_DATA, input));
    }
    let expanded = expand_dotted(input);
    let mut errors = FieldErrors::new();
    let mut changes = Record::new();

    for field in schema.fields() {
        match expanded.get(&field.name) {
            Some(Value::Null) | None if field.primary_key => {
                push_error(&mut errors, &field.name, MISSING);
            }
            Some(Value::Null) => {
                changes.insert(field.name.clone(), Value::Null);
            }
            Some(value) => {
                if let Some(value) = coerce(&field.name, &field.kind, value, &mut errors) {
                    changes.insert(field.name.clone(), value);
                }
            }
            None => {}
        }
    }

    finish(errors, input).map(|()| changes)
}

/// Merges update changes over the previous business fields.
///
/// Omitted fields keep their value. Explicit nulls clear nullable fields and
/// are ignored for mandatory ones. Dicts merge per sub-field.
pub fn merge_update(schema: &CollectionSchema, previous: &Record, changes: &Record) -> Record {
    let mut merged = previous.clone();
    for field in schema.fields() {
        if let Some(change) = changes.get(&field.name) {
            let slot = merged.entry(field.name.clone()).or_insert(Value::Null);
            merge_field(field, slot, change);
        }
    }
    merged
}

fn merge_field(field: &FieldSpec, slot: &mut Value, change: &Value) {
    match (&field.kind, slot.as_object_mut(), change) {
        (FieldKind::Dict { fields }, Some(current), Value::Object(nested)) => {
            for sub_field in fields {
                if let Some(sub_change) = nested.get(&sub_field.name) {
                    let sub_slot = current.entry(sub_field.name.clone()).or_insert(Value::Null);
                    merge_field(sub_field, sub_slot, sub_change);
                }
            }
        }
        _ if change.is_null() && !field.nullable => {}
        _ => *slot = change.clone(),
    }
}

/// Type-checks filter criteria against the schema.
///
/// `extra` declares bookkeeping columns that are also valid filter targets
/// (interval fields, audit fields). Paths the schema does not declare are
/// dropped, leaving that criterion unconstrained.
pub fn check_filter(
    schema: &CollectionSchema,
    filter: &Filter,
    extra: &[(&str, FieldKind)],
) -> CoreResult<Filter> {
    let mut errors = FieldErrors::new();
    let mut checked = Filter::all();

    for (path, condition) in filter.conditions() {
        let kind = extra
            .iter()
            .find(|(name, _)| *name == path)
            .map(|(_, kind)| kind)
            .or_else(|| schema.resolve_path(path));
        let Some(kind) = kind else {
            debug!("event=filter_check module=validation status=ok dropped_path={path}");
            continue;
        };
        let mut coerced = Vec::new();
        for value in condition.values() {
            if let Some(value) = coerce(path, kind, value, &mut errors) {
                coerced.push(value);
            }
        }
        let condition = match condition {
            Condition::Eq(_) => coerced.pop().map(Condition::Eq),
            Condition::AnyOf(_) => Some(Condition::AnyOf(coerced)),
        };
        if let Some(condition) = condition {
            checked = checked.with(path, condition);
        }
    }

    finish(errors, &filter.to_record()).map(|()| checked)
}

/// Coerces one value to `kind`, recording a message under `path` on failure.
pub fn coerce(
    path: &str,
    kind: &FieldKind,
    value: &Value,
    errors: &mut FieldErrors,
) -> Option<Value> {
    if value.is_null() {
        return Some(Value::Null);
    }
    let coerced = match kind {
        FieldKind::Text => value.as_str().map(Value::from).ok_or("Not a valid string."),
        FieldKind::Integer => coerce_integer(value).ok_or("Not a valid int."),
        FieldKind::Float => coerce_float(value).ok_or("Not a valid number."),
        FieldKind::Boolean => coerce_boolean(value).ok_or("Not a valid boolean."),
        FieldKind::Enum { choices } => value
            .as_str()
            .filter(|text| choices.iter().any(|choice| choice == text))
            .map(Value::from)
            .ok_or("Not a valid choice."),
        FieldKind::List { item } => match value {
            Value::Array(items) => {
                let before = error_count(errors);
                let items: Vec<Value> = items
                    .iter()
                    .filter_map(|item_value| coerce(path, item, item_value, errors))
                    .collect();
                if error_count(errors) > before {
                    return None;
                }
                Ok(Value::Array(items))
            }
            _ => Err("Not a valid list."),
        },
        FieldKind::Dict { fields } => match value {
            Value::Object(nested) => {
                let before = error_count(errors);
                let mut coerced = Record::new();
                for sub_field in fields {
                    if let Some(sub_value) = nested.get(&sub_field.name) {
                        let sub_path = format!("{path}.{}", sub_field.name);
                        if let Some(sub_value) =
                            coerce(&sub_path, &sub_field.kind, sub_value, errors)
                        {
                            coerced.insert(sub_field.name.clone(), sub_value);
                        }
                    }
                }
                if error_count(errors) > before {
                    return None;
                }
                Ok(Value::Object(coerced))
            }
            _ => Err("Not a valid dict."),
        },
    };

    match coerced {
        Ok(value) => Some(value),
        Err(message) => {
            push_error(errors, path, message);
            None
        }
    }
}

fn coerce_integer(value: &Value) -> Option<Value> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Value::from),
        Value::String(text) => text.trim().parse::<i64>().ok().map(Value::from),
        _ => None,
    }
}

fn coerce_float(value: &Value) -> Option<Value> {
    match value {
        Value::Number(number) => number.as_f64().map(Value::from),
        Value::String(text) => text.trim().parse::<f64>().ok().map(Value::from),
        _ => None,
    }
}

fn coerce_boolean(value: &Value) -> Option<Value> {
    match value {
        Value::Bool(flag) => Some(Value::Bool(*flag)),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        Value::Number(number) => match number.as_i64() {
            Some(1) => Some(Value::Bool(true)),
            Some(0) => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

/// Fills undeclared-but-omitted dict sub-fields with `null`.
fn complete_dict(kind: &FieldKind, value: Value) -> Value {
    match (kind, value) {
        (FieldKind::Dict { fields }, Value::Object(mut nested)) => {
            for sub_field in fields {
                let sub_value = nested.remove(&sub_field.name).unwrap_or(Value::Null);
                let sub_value = if sub_value.is_null() {
                    sub_field.default.clone().unwrap_or_else(|| empty_value(&sub_field.kind))
                } else {
                    complete_dict(&sub_field.kind, sub_value)
                };
                nested.insert(sub_field.name.clone(), sub_value);
            }
            Value::Object(nested)
        }
        (_, value) => value,
    }
}

/// Value stored for an omitted optional field.
fn empty_value(kind: &FieldKind) -> Value {
    match kind {
        FieldKind::Dict { .. } => complete_dict(kind, Value::Object(Record::new())),
        _ => Value::Null,
    }
}

fn error_count(errors: &FieldErrors) -> usize {
    errors.values().map(Vec::len).sum()
}

fn push_error(errors: &mut FieldErrors, path: &str, message: &str) {
    errors
        .entry(path.to_string())
        .or_default()
        .push(message.to_string());
}

fn finish(errors: FieldErrors, received: &Record) -> CoreResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(CoreError::ValidationFailed {
            errors,
            received: received.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{check_filter, merge_update, prepare_insert, prepare_update};
    use crate::error::CoreError;
    use crate::model::filter::Filter;
    use crate::model::record::Record;
    use crate::model::schema::{CollectionSchema, FieldSpec};
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema::new(
            "test",
            vec![
                FieldSpec::text("key").primary_key(),
                FieldSpec::dict(
                    "dict_field",
                    vec![
                        FieldSpec::enumeration("first_key", ["Value1", "Value2"]).required(),
                        FieldSpec::integer("second_key").required(),
                    ],
                ),
                FieldSpec::text("optional"),
            ],
        )
        .unwrap()
    }

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_fills_missing_dict_with_nulls() {
        let prepared = prepare_insert(&schema(), &record(json!({"key": "first"}))).unwrap();
        assert_eq!(
            serde_json::Value::Object(prepared),
            json!({
                "key": "first",
                "dict_field": {"first_key": null, "second_key": null},
                "optional": null,
            })
        );
    }

    #[test]
    fn insert_ignores_unknown_fields_and_expands_dotted_keys() {
        let prepared = prepare_insert(
            &schema(),
            &record(json!({"key": "first", "dict_field.second_key": "3", "unknown": 1})),
        )
        .unwrap();
        assert_eq!(prepared["dict_field"], json!({"first_key": null, "second_key": 3}));
        assert!(!prepared.contains_key("unknown"));
    }

    #[test]
    fn insert_without_key_reports_missing_field() {
        let input = record(json!({"optional": "x"}));
        let err = prepare_insert(&schema(), &input).unwrap_err();
        match err {
            CoreError::ValidationFailed { errors, received } => {
                assert_eq!(errors["key"], vec!["Missing data for required field."]);
                assert_eq!(received, input);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_payload_is_rejected() {
        let err = prepare_insert(&schema(), &Record::new()).unwrap_err();
        assert!(
            matches!(err, CoreError::ValidationFailed { errors, .. } if errors.contains_key(""))
        );
    }

    #[test]
    fn wrong_sub_field_type_is_keyed_by_dotted_path() {
        let err = prepare_update(
            &schema(),
            &record(json!({"key": "first", "dict_field.first_key": "Value3"})),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::ValidationFailed { errors, .. }
                if errors["dict_field.first_key"] == vec!["Not a valid choice."]
        ));
    }

    #[test]
    fn merge_keeps_mandatory_values_and_clears_nullable_ones() {
        let schema = schema();
        let previous = record(json!({
            "key": "first",
            "dict_field": {"first_key": "Value1", "second_key": 1},
            "optional": "set",
        }));
        let changes = prepare_update(
            &schema,
            &record(json!({
                "key": "first",
                "dict_field.first_key": "Value2",
                "dict_field.second_key": null,
                "optional": null,
            })),
        )
        .unwrap();

        let merged = merge_update(&schema, &previous, &changes);
        assert_eq!(merged["dict_field"], json!({"first_key": "Value2", "second_key": 1}));
        assert_eq!(merged["optional"], json!(null));
    }

    #[test]
    fn filter_check_coerces_and_rejects_bad_types() {
        let schema = schema();
        let filter = Filter::all().eq("dict_field.second_key", "2");
        let checked = check_filter(&schema, &filter, &[]).unwrap();
        assert_eq!(checked, Filter::all().eq("dict_field.second_key", 2));

        let invalid = Filter::all().eq("dict_field.second_key", "invalid");
        let err = check_filter(&schema, &invalid, &[]).unwrap_err();
        match err {
            CoreError::ValidationFailed { errors, received } => {
                assert_eq!(errors["dict_field.second_key"], vec!["Not a valid int."]);
                assert_eq!(received["dict_field.second_key"], json!("invalid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn filter_drops_unknown_paths_and_keeps_known_ones() {
        let filter = Filter::all()
            .eq("typo", 1)
            .eq("dict_field.unknown", "x")
            .eq("key", "first");
        let checked = check_filter(&schema(), &filter, &[]).unwrap();
        assert_eq!(checked, Filter::all().eq("key", "first"));
    }
}
