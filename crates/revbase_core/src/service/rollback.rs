//! Rollback requests and per-entity rollback planning.
//!
//! # Responsibility
//! - Parse the `{"revision": <int>, ...criteria}` request shape.
//! - Decide, for one logical entity, which corrective action restores its
//!   state as of a target revision.
//!
//! # Invariants
//! - Planning is pure: it reads the entity's stored intervals and never
//!   writes.
//! - Rollback only closes current rows and appends new ones; historical
//!   intervals are never rewritten.

use crate::error::{CoreError, CoreResult, FieldErrors};
use crate::model::filter::Filter;
use crate::model::record::{is_current, is_valid_at, without_interval, Record, Value};
use crate::model::schema::{CollectionSchema, FieldKind};
use crate::revision::Revision;
use crate::validation::{check_filter, coerce};

const REVISION_FIELD: &str = "revision";

/// Target revision plus criteria restricting the affected entities.
#[derive(Debug, Clone, PartialEq)]
pub struct RollbackRequest {
    pub revision: Revision,
    pub filter: Filter,
}

impl RollbackRequest {
    /// Rollback of every entity in the collection.
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            filter: Filter::all(),
        }
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Parses an API-layer rollback payload.
    ///
    /// # Errors
    /// - `ValidationFailed` keyed `revision` when it is missing or not an
    ///   integer (carrying the whole payload).
    /// - `ValidationFailed` keyed by field path when a criterion does not
    ///   type-check (carrying the criteria).
    pub fn from_record(schema: &CollectionSchema, payload: &Record) -> CoreResult<Self> {
        let mut errors = FieldErrors::new();
        let revision = match payload.get(REVISION_FIELD) {
            None | Some(Value::Null) => {
                return Err(CoreError::validation(
                    REVISION_FIELD,
                    "Missing data for required field.",
                    payload,
                ));
            }
            Some(value) => coerce(REVISION_FIELD, &FieldKind::Integer, value, &mut errors)
                .and_then(|value| value.as_i64()),
        };
        let Some(revision) = revision else {
            return Err(CoreError::ValidationFailed {
                errors,
                received: payload.clone(),
            });
        };

        let criteria: Record = payload
            .iter()
            .filter(|(field, _)| field.as_str() != REVISION_FIELD)
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        let filter = check_filter(schema, &Filter::from_record(&criteria), &[])?;
        Ok(Self { revision, filter })
    }
}

/// Corrective action for one logical entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPlan {
    /// Current state already matches the target revision.
    Unchanged,
    /// Entity did not exist at the target revision: close the current row.
    Close,
    /// Re-insert the fields valid at the target revision, closing the
    /// current row first when there is one.
    Restore { close_current: bool, fields: Record },
}

/// Plans the rollback of one entity from all of its stored intervals.
pub fn plan_entity(rows: &[Record], target: Revision) -> EntityPlan {
    let current = rows.iter().find(|row| is_current(row));
    let wanted = rows.iter().find(|row| is_valid_at(row, target));

    match (current, wanted) {
        (None, None) => EntityPlan::Unchanged,
        (Some(current), Some(wanted)) if current == wanted => EntityPlan::Unchanged,
        (Some(_), None) => EntityPlan::Close,
        (current, Some(wanted)) => EntityPlan::Restore {
            close_current: current.is_some(),
            fields: without_interval(wanted),
        },
    }
}
