//! Helpers shared by the collection services.

use crate::error::{CoreError, CoreResult};
use crate::model::filter::Query;
use crate::model::record::{Record, Value};
use crate::model::schema::{CollectionSchema, FieldKind};
use crate::store::{StoreTx, TableDef};
use crate::validation::check_filter;
use log::warn;
use std::collections::BTreeMap;
use uuid::Uuid;

pub(crate) const NO_DATA: &str = "No data provided.";
pub(crate) const MORE_THAN_ONE: &str = "More than one result: Consider another filtering.";

/// Fills auto-incremented fields left `null` by input normalization.
///
/// Integer fields get `max(stored) + 1` over the whole table, text primary
/// keys a fresh UUID v4.
pub(crate) fn assign_generated_keys(
    tx: &dyn StoreTx,
    schema: &CollectionSchema,
    table: &TableDef,
    record: &mut Record,
) -> CoreResult<()> {
    for field in schema.fields().iter().filter(|field| field.auto_increment) {
        if !record.get(&field.name).map_or(true, Value::is_null) {
            continue;
        }
        let value = match field.kind {
            FieldKind::Integer => Value::from(tx.max_integer(table, &field.name)?.unwrap_or(0) + 1),
            _ => Value::from(Uuid::new_v4().to_string()),
        };
        record.insert(field.name.clone(), value);
    }
    Ok(())
}

/// Runs `each` over every batch entry, collecting per-index failures.
///
/// Entries commit independently; when any fails the result is a
/// `ConstraintViolation` listing failed and committed indexes.
pub(crate) fn run_batch<I, T>(
    collection: &str,
    items: &[I],
    mut each: impl FnMut(&I) -> CoreResult<T>,
) -> CoreResult<Vec<T>> {
    if items.is_empty() {
        return Err(CoreError::validation("", NO_DATA, &Record::new()));
    }

    let mut results = Vec::with_capacity(items.len());
    let mut failures = BTreeMap::new();
    let mut committed = Vec::new();
    for (index, item) in items.iter().enumerate() {
        match each(item) {
            Ok(result) => {
                results.push(result);
                committed.push(index);
            }
            Err(err) => {
                failures.insert(index, err);
            }
        }
    }

    if failures.is_empty() {
        return Ok(results);
    }
    warn!(
        "event=batch_partial module=service status=error collection={} failed={} committed={}",
        collection,
        failures.len(),
        committed.len()
    );
    Err(CoreError::ConstraintViolation {
        failures,
        committed,
    })
}

/// Type-checks a read query's filter.
pub(crate) fn checked_query(
    schema: &CollectionSchema,
    query: &Query,
    extra: &[(&str, FieldKind)],
) -> CoreResult<Query> {
    Ok(Query {
        filter: check_filter(schema, &query.filter, extra)?,
        ..query.clone()
    })
}

/// Picks the single row of a `get_one` read.
pub(crate) fn single(rows: Vec<Record>, criteria: &Record) -> CoreResult<Option<Record>> {
    if rows.len() > 1 {
        return Err(CoreError::validation("", MORE_THAN_ONE, criteria));
    }
    Ok(rows.into_iter().next())
}

/// Attributes a uniqueness conflict to the payload the caller sent.
pub(crate) fn attribute_conflict(err: CoreError, input: &Record) -> CoreError {
    match err {
        CoreError::AlreadyExists { .. } => CoreError::AlreadyExists {
            payload: input.clone(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::run_batch;
    use crate::error::CoreError;
    use crate::model::record::Record;

    #[test]
    fn run_batch_reports_failed_and_committed_indexes() {
        let result = run_batch("items", &[1, 2, 3], |value| {
            if *value == 2 {
                Err(CoreError::NotFound {
                    requested: Record::new(),
                })
            } else {
                Ok(value * 10)
            }
        });

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
    }

    #[test]
    fn run_batch_rejects_empty_input() {
        let result = run_batch::<i32, i32>("items", &[], |value| Ok(*value));
        match result {
            Err(CoreError::ValidationFailed { errors, .. }) => {
                assert_eq!(errors[""], vec!["No data provided.".to_string()]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
