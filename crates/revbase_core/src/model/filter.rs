//! Filter criteria and list queries.
//!
//! # Responsibility
//! - Represent equality criteria on top-level or dotted fields.
//! - Carry pagination options for list reads.
//!
//! # Invariants
//! - A `null` criterion means "unconstrained" and is never stored.
//! - Criteria never express ranges; interval reads are computed by the
//!   history store.

use crate::model::record::{lookup, values_equal, Record, Value};
use std::collections::BTreeMap;

/// Constraint applied to one field path.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    /// Multi-valued criterion (`key=first&key=second`).
    AnyOf(Vec<Value>),
}

impl Condition {
    pub fn matches(&self, actual: Option<&Value>) -> bool {
        let actual = actual.unwrap_or(&Value::Null);
        match self {
            Self::Eq(expected) => values_equal(expected, actual),
            Self::AnyOf(candidates) => candidates
                .iter()
                .any(|expected| values_equal(expected, actual)),
        }
    }

    /// Values carried by the condition, for type checking.
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Eq(value) => std::slice::from_ref(value),
            Self::AnyOf(values) => values,
        }
    }
}

/// Conjunction of per-field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Condition>,
}

impl Filter {
    /// Filter matching every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Adds an equality criterion; `null` leaves the field unconstrained.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.conditions.insert(field.into(), Condition::Eq(value));
        }
        self
    }

    /// Adds a multi-valued criterion.
    pub fn any_of(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.insert(field.into(), Condition::AnyOf(values));
        self
    }

    /// Builds a filter from API-layer criteria.
    ///
    /// Null values are skipped and arrays become "any of" criteria.
    pub fn from_record(criteria: &Record) -> Self {
        let mut filter = Self::all();
        for (field, value) in criteria {
            filter = match value {
                Value::Null => filter,
                Value::Array(values) => filter.any_of(field.clone(), values.clone()),
                other => filter.eq(field.clone(), other.clone()),
            };
        }
        filter
    }

    /// Returns a copy with one more condition.
    pub fn with(&self, field: impl Into<String>, condition: Condition) -> Self {
        let mut filter = self.clone();
        filter.conditions.insert(field.into(), condition);
        filter
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions
            .iter()
            .map(|(field, condition)| (field.as_str(), condition))
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(path, condition)| condition.matches(lookup(record, path)))
    }

    /// Returns the criteria as a record (the shape reported in errors).
    pub fn to_record(&self) -> Record {
        self.conditions
            .iter()
            .map(|(field, condition)| {
                let value = match condition {
                    Condition::Eq(value) => value.clone(),
                    Condition::AnyOf(values) => Value::Array(values.clone()),
                };
                (field.clone(), value)
            })
            .collect()
    }
}

/// Filter plus pagination for list reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub limit: Option<u32>,
    pub offset: u32,
}

impl Query {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn filtered(filter: Filter) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Applies `offset`/`limit` to rows already filtered and ordered.
    pub fn paginate<T>(&self, rows: Vec<T>) -> Vec<T> {
        let skipped = rows.into_iter().skip(self.offset as usize);
        match self.limit {
            Some(limit) => skipped.take(limit as usize).collect(),
            None => skipped.collect(),
        }
    }
}

impl From<Filter> for Query {
    fn from(filter: Filter) -> Self {
        Self::filtered(filter)
    }
}
