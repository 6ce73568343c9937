//! Error taxonomy for revbase core.
//!
//! # Responsibility
//! - Give callers one error type with semantic variants for every core
//!   operation (validation, uniqueness, lookup, batch partial failure).
//! - Keep storage transport errors wrapped instead of flattened to strings.
//!
//! # Invariants
//! - `ValidationFailed` always carries the payload exactly as received.
//! - `ConstraintViolation` only reports failed indexes; committed indexes
//!   stay committed.

use crate::db::DbError;
use crate::model::record::Record;
use std::collections::BTreeMap;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Validation messages keyed by (dotted) field name.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// Error returned by every revbase core operation.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input could not be coerced to the collection schema.
    #[error("validation failed for {} field(s)", .errors.len())]
    ValidationFailed {
        errors: FieldErrors,
        received: Record,
    },
    /// Insert would violate a primary key or unique field.
    #[error("a record with the same unique values already exists")]
    AlreadyExists { payload: Record },
    /// Update targets a key without a current record.
    #[error("no current record matches the requested key")]
    NotFound { requested: Record },
    /// One or more batch entries failed; the others were committed.
    #[error("{} batch entries failed, {} committed", .failures.len(), .committed.len())]
    ConstraintViolation {
        failures: BTreeMap<usize, CoreError>,
        committed: Vec<usize>,
    },
    #[error("invalid schema: {0}")]
    Schema(String),
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error("invalid database url: {0}")]
    InvalidUrl(String),
    #[error("logging setup failed: {0}")]
    Logging(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

impl CoreError {
    /// Builds a single-field validation error.
    pub fn validation(
        field: impl Into<String>,
        message: impl Into<String>,
        received: &Record,
    ) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.into(), vec![message.into()]);
        Self::ValidationFailed {
            errors,
            received: received.clone(),
        }
    }

    /// Stable machine-readable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::AlreadyExists { .. } => "already_exists",
            Self::NotFound { .. } => "not_found",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::Schema(_) => "invalid_schema",
            Self::InvalidData(_) => "invalid_data",
            Self::InvalidUrl(_) => "invalid_url",
            Self::Logging(_) => "logging_failed",
            Self::Db(_) => "db_error",
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidData(value.to_string())
    }
}
