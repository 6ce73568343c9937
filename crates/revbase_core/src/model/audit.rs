//! Audit trail entries.
//!
//! # Invariants
//! - Entries are append-only; nothing in core updates or deletes them.
//! - `revision` is the engine revision for versioned collections and a
//!   per-collection audit sequence otherwise.

use crate::error::{CoreError, CoreResult};
use crate::model::record::{Record, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const AUDIT_REVISION: &str = "revision";
pub const AUDIT_ACTION: &str = "audit_action";
pub const AUDIT_USER: &str = "audit_user";
pub const AUDIT_DATE: &str = "audit_date_utc";

/// Prefix of audit tables and audit sequences; reserved for collection names.
pub const AUDIT_PREFIX: &str = "audit_";

/// Name of the table (and, for plain collections, the sequence) holding the
/// audit trail of `collection`.
pub fn audit_name(collection: &str) -> String {
    format!("{AUDIT_PREFIX}{collection}")
}

/// Kind of mutation recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Insert,
    Update,
    Delete,
    Rollback,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Rollback => "Rollback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Insert" => Some(Self::Insert),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Rollback" => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// One immutable audit log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub revision: i64,
    pub action: AuditAction,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
    /// Business fields of the affected record (empty for versioned
    /// collections, whose history rows already hold the snapshot).
    pub snapshot: Record,
}

impl AuditEntry {
    /// Flattens the entry into the stored/API record shape.
    pub fn to_record(&self) -> Record {
        let mut row = self.snapshot.clone();
        row.insert(AUDIT_REVISION.to_string(), Value::from(self.revision));
        row.insert(
            AUDIT_ACTION.to_string(),
            Value::from(self.action.as_str()),
        );
        row.insert(AUDIT_USER.to_string(), Value::from(self.actor.clone()));
        row.insert(
            AUDIT_DATE.to_string(),
            Value::from(format_timestamp(&self.recorded_at)),
        );
        row
    }

    /// Parses a stored audit row.
    pub fn from_record(row: &Record) -> CoreResult<Self> {
        let revision = row
            .get(AUDIT_REVISION)
            .and_then(Value::as_i64)
            .ok_or_else(|| CoreError::InvalidData("audit row without revision".to_string()))?;
        let action_text = row.get(AUDIT_ACTION).and_then(Value::as_str).unwrap_or("");
        let action = AuditAction::parse(action_text).ok_or_else(|| {
            CoreError::InvalidData(format!("invalid audit action `{action_text}`"))
        })?;
        let actor = row
            .get(AUDIT_USER)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let date_text = row.get(AUDIT_DATE).and_then(Value::as_str).unwrap_or("");
        let recorded_at = DateTime::parse_from_rfc3339(date_text)
            .map_err(|err| {
                CoreError::InvalidData(format!("invalid audit date `{date_text}`: {err}"))
            })?
            .with_timezone(&Utc);
        let snapshot = row
            .iter()
            .filter(|(key, _)| !is_audit_column(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(Self {
            revision,
            action,
            actor,
            recorded_at,
            snapshot,
        })
    }
}

pub fn is_audit_column(name: &str) -> bool {
    matches!(name, AUDIT_REVISION | AUDIT_ACTION | AUDIT_USER | AUDIT_DATE)
}

pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Supplies the identity recorded in `audit_user`.
pub trait ActorSource: Send + Sync {
    fn current_actor(&self) -> String;
}

/// Actor that never changes (service accounts, CLI).
#[derive(Debug, Clone, Default)]
pub struct StaticActor(pub String);

impl ActorSource for StaticActor {
    fn current_actor(&self) -> String {
        self.0.clone()
    }
}

impl<F> ActorSource for F
where
    F: Fn() -> String + Send + Sync,
{
    fn current_actor(&self) -> String {
        self()
    }
}
