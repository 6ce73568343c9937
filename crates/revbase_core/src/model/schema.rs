//! Declarative collection schema.
//!
//! # Responsibility
//! - Describe the business fields of a collection and their constraints.
//! - Reject declarations the storage backends cannot honour.
//!
//! # Invariants
//! - Collection and field names are plain identifiers (safe to use as SQL
//!   identifiers and JSON paths).
//! - Every collection declares at least one primary key field.
//! - Interval and audit bookkeeping names are reserved, and so is the
//!   `audit_` collection name prefix.

use crate::error::{CoreError, CoreResult};
use crate::model::audit::AUDIT_PREFIX;
use crate::model::record::{Record, Value, VALID_SINCE, VALID_UNTIL};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").expect("identifier pattern is a valid regex")
});

const RESERVED_FIELDS: &[&str] = &[
    VALID_SINCE,
    VALID_UNTIL,
    "revision",
    "audit_action",
    "audit_user",
    "audit_date_utc",
];

/// Returns whether `name` is usable as a collection or field identifier.
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Value kind of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// Text restricted to a fixed set of choices.
    Enum { choices: Vec<String> },
    /// Nested document with its own declared sub-fields.
    Dict { fields: Vec<FieldSpec> },
    List { item: Box<FieldKind> },
}

impl FieldKind {
    /// Resolves the kind reached by a dotted sub-path (`"first_key"`).
    pub fn resolve(&self, path: &str) -> Option<&FieldKind> {
        if path.is_empty() {
            return Some(self);
        }
        let FieldKind::Dict { fields } = self else {
            return None;
        };
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        fields
            .iter()
            .find(|field| field.name == head)
            .and_then(|field| field.kind.resolve(rest))
    }
}

/// One declared field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

fn default_nullable() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            primary_key: false,
            nullable: true,
            unique: false,
            auto_increment: false,
            default: None,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn enumeration<I, S>(name: impl Into<String>, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            name,
            FieldKind::Enum {
                choices: choices.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn dict(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self::new(name, FieldKind::Dict { fields })
    }

    pub fn list(name: impl Into<String>, item: FieldKind) -> Self {
        Self::new(
            name,
            FieldKind::List {
                item: Box::new(item),
            },
        )
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the field as mandatory (non-nullable).
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Integer fields get `max(existing) + 1`; text primary keys get a UUID.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Whether the engine fills this field when the caller omits it.
    pub fn is_generated(&self) -> bool {
        self.auto_increment || self.default.is_some()
    }

    fn check(&self, nested: bool) -> CoreResult<()> {
        if !is_identifier(&self.name) {
            return Err(CoreError::Schema(format!(
                "`{}` is not a valid field name",
                self.name
            )));
        }
        if !nested && RESERVED_FIELDS.contains(&self.name.as_str()) {
            return Err(CoreError::Schema(format!(
                "`{}` is reserved for revision bookkeeping",
                self.name
            )));
        }
        if self.auto_increment {
            let key_text = self.primary_key && self.kind == FieldKind::Text;
            if self.kind != FieldKind::Integer && !key_text {
                return Err(CoreError::Schema(
                    "Only int fields can be auto incremented.".to_string(),
                ));
            }
            if !self.nullable {
                return Err(CoreError::Schema(
                    "A field cannot be mandatory and auto incremented at the same time."
                        .to_string(),
                ));
            }
        }
        if self.default.is_some() && !self.nullable {
            return Err(CoreError::Schema(
                "A field cannot be mandatory and having a default value at the same time."
                    .to_string(),
            ));
        }
        match &self.kind {
            FieldKind::Dict { fields } => {
                if self.primary_key || self.unique {
                    return Err(CoreError::Schema(format!(
                        "dict field `{}` cannot be a key or unique",
                        self.name
                    )));
                }
                check_unique_names(fields)?;
                fields.iter().try_for_each(|field| field.check(true))
            }
            FieldKind::List { .. } if self.primary_key || self.unique => Err(CoreError::Schema(
                format!("list field `{}` cannot be a key or unique", self.name),
            )),
            FieldKind::Enum { choices } if choices.is_empty() => Err(CoreError::Schema(format!(
                "enum field `{}` declares no choices",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

fn check_unique_names(fields: &[FieldSpec]) -> CoreResult<()> {
    for (index, field) in fields.iter().enumerate() {
        if fields[..index].iter().any(|other| other.name == field.name) {
            return Err(CoreError::Schema(format!(
                "field `{}` is declared twice",
                field.name
            )));
        }
    }
    Ok(())
}

/// Validated schema of one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl CollectionSchema {
    /// Validates and builds a schema.
    ///
    /// # Errors
    /// - `CoreError::Schema` for invalid identifiers, reserved names, duplicate
    ///   fields, missing primary key or contradictory field flags.
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> CoreResult<Self> {
        let schema = Self {
            name: name.into(),
            fields,
        };
        schema.check()?;
        Ok(schema)
    }

    /// Rebuilds a schema persisted in a backend catalog.
    pub fn from_json(json: &str) -> CoreResult<Self> {
        let schema: Self = serde_json::from_str(json)?;
        schema.check()?;
        Ok(schema)
    }

    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn check(&self) -> CoreResult<()> {
        if !is_identifier(&self.name) || self.name.starts_with('_') {
            return Err(CoreError::Schema(format!(
                "`{}` is not a valid collection name",
                self.name
            )));
        }
        if self.name.starts_with(AUDIT_PREFIX) {
            return Err(CoreError::Schema(format!(
                "collection name `{}` uses the reserved `{AUDIT_PREFIX}` prefix",
                self.name
            )));
        }
        check_unique_names(&self.fields)?;
        self.fields.iter().try_for_each(|field| field.check(false))?;
        if !self.fields.iter().any(|field| field.primary_key) {
            return Err(CoreError::Schema(format!(
                "collection `{}` declares no primary key",
                self.name
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|field| field.primary_key)
    }

    /// Extracts the primary key values of `record`.
    pub fn key_of(&self, record: &Record) -> Record {
        self.primary_keys()
            .map(|field| {
                let value = record.get(&field.name).cloned().unwrap_or_default();
                (field.name.clone(), value)
            })
            .collect()
    }

    /// Resolves a top-level or dotted field path to its kind.
    pub fn resolve_path(&self, path: &str) -> Option<&FieldKind> {
        let (head, rest) = path.split_once('.').unwrap_or((path, ""));
        self.field(head).and_then(|field| field.kind.resolve(rest))
    }
}
