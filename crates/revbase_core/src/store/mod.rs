//! Storage backend contracts and shared table descriptions.
//!
//! # Responsibility
//! - Define the row-level primitives (`StoreTx`) every backing store offers
//!   inside one all-or-nothing transaction.
//! - Define the table-level surface (`Backend`) used for registration and
//!   read-only queries.
//! - Describe collection, history and audit tables independently of the
//!   backend that stores them.
//!
//! # Invariants
//! - All writes happen inside `Backend::transaction`; a failed closure leaves
//!   no partial write behind.
//! - Named sequences are the only cross-collection shared state and live in
//!   the backend, never in process memory.

use crate::error::CoreResult;
use crate::model::audit::{audit_name, AUDIT_ACTION, AUDIT_DATE, AUDIT_REVISION, AUDIT_USER};
use crate::model::filter::{Filter, Query};
use crate::model::record::{Record, VALID_SINCE, VALID_UNTIL};
use crate::model::schema::{CollectionSchema, FieldKind};
use serde::{Deserialize, Serialize};

pub mod document;
pub mod sqlite;

pub use document::DocumentBackend;
pub use sqlite::SqliteBackend;

/// One stored column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: FieldKind,
}

/// Rows a unique key applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueScope {
    AllRows,
    /// Only rows whose `valid_until_revision` is unbounded; closed history
    /// rows never conflict.
    CurrentRows,
}

/// Backend-independent description of one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub unique_keys: Vec<Vec<String>>,
    pub unique_scope: UniqueScope,
}

impl TableDef {
    /// Table of a plain collection: one row per entity.
    pub fn for_collection(schema: &CollectionSchema) -> Self {
        Self {
            name: schema.name().to_string(),
            columns: business_columns(schema),
            unique_keys: unique_keys(schema),
            unique_scope: UniqueScope::AllRows,
        }
    }

    /// Table of a versioned collection: one row per validity interval.
    pub fn for_history(schema: &CollectionSchema) -> Self {
        let mut columns = business_columns(schema);
        columns.push(integer_column(VALID_SINCE));
        columns.push(integer_column(VALID_UNTIL));
        Self {
            name: schema.name().to_string(),
            columns,
            unique_keys: unique_keys(schema),
            unique_scope: UniqueScope::CurrentRows,
        }
    }

    /// Audit table; plain collections also store the record snapshot.
    pub fn for_audit(schema: &CollectionSchema, with_snapshot: bool) -> Self {
        let mut columns = vec![
            integer_column(AUDIT_REVISION),
            ColumnDef {
                name: AUDIT_ACTION.to_string(),
                kind: FieldKind::Text,
            },
            ColumnDef {
                name: AUDIT_USER.to_string(),
                kind: FieldKind::Text,
            },
            ColumnDef {
                name: AUDIT_DATE.to_string(),
                kind: FieldKind::Text,
            },
        ];
        if with_snapshot {
            columns.extend(business_columns(schema));
        }
        Self {
            name: audit_name(schema.name()),
            columns,
            unique_keys: vec![vec![AUDIT_REVISION.to_string()]],
            unique_scope: UniqueScope::AllRows,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// Keeps only declared columns, filling absent ones with `null`.
    pub fn project(&self, row: &Record) -> Record {
        self.columns
            .iter()
            .map(|column| {
                let value = row.get(&column.name).cloned().unwrap_or_default();
                (column.name.clone(), value)
            })
            .collect()
    }
}

fn integer_column(name: &str) -> ColumnDef {
    ColumnDef {
        name: name.to_string(),
        kind: FieldKind::Integer,
    }
}

fn business_columns(schema: &CollectionSchema) -> Vec<ColumnDef> {
    schema
        .fields()
        .iter()
        .map(|field| ColumnDef {
            name: field.name.clone(),
            kind: field.kind.clone(),
        })
        .collect()
}

fn unique_keys(schema: &CollectionSchema) -> Vec<Vec<String>> {
    let mut keys = vec![schema
        .primary_keys()
        .map(|field| field.name.clone())
        .collect::<Vec<_>>()];
    keys.extend(
        schema
            .fields()
            .iter()
            .filter(|field| field.unique && !field.primary_key)
            .map(|field| vec![field.name.clone()]),
    );
    keys
}

/// Order of rows returned by reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowOrder {
    /// Order rows were first written in; updates keep a row's position.
    #[default]
    Insertion,
    /// Descending `valid_since_revision`, ties in insertion order.
    NewestRevisionFirst,
}

/// Catalog entry describing a registered collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub schema: CollectionSchema,
    pub versioned: bool,
    pub audited: bool,
}

impl CatalogEntry {
    pub fn name(&self) -> &str {
        self.schema.name()
    }
}

/// Row-level primitives available inside one backend transaction.
pub trait StoreTx {
    fn select(&self, table: &TableDef, filter: &Filter) -> CoreResult<Vec<Record>>;
    /// Inserts one row; unique key conflicts surface as `AlreadyExists`
    /// carrying the offending row.
    fn insert(&mut self, table: &TableDef, row: &Record) -> CoreResult<()>;
    fn update(&mut self, table: &TableDef, filter: &Filter, changes: &Record)
        -> CoreResult<usize>;
    fn delete(&mut self, table: &TableDef, filter: &Filter) -> CoreResult<usize>;
    fn max_integer(&self, table: &TableDef, column: &str) -> CoreResult<Option<i64>>;
    /// Atomically increments a named sequence and returns the new value.
    fn next_sequence(&mut self, name: &str) -> CoreResult<i64>;
    fn current_sequence(&self, name: &str) -> CoreResult<i64>;
}

/// Table-level surface of a backing store.
pub trait Backend: Send + Sync {
    /// Short backend name used in log events.
    fn kind(&self) -> &'static str;
    /// Creates the table and its unique indexes if missing.
    fn ensure_table(&self, table: &TableDef) -> CoreResult<()>;
    /// Records a collection in the catalog; re-registering the same schema
    /// is a no-op, a different schema under the same name is rejected.
    fn register(&self, entry: &CatalogEntry) -> CoreResult<()>;
    fn catalog(&self) -> CoreResult<Vec<CatalogEntry>>;
    fn read(&self, table: &TableDef, query: &Query, order: RowOrder) -> CoreResult<Vec<Record>>;
    fn current_sequence(&self, name: &str) -> CoreResult<i64>;
    /// Runs `work` atomically: committed when it returns `Ok`, discarded
    /// otherwise.
    fn transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> CoreResult<T>;
}

/// Either backend, selected from a connection URL at runtime.
pub enum AnyBackend {
    Sqlite(SqliteBackend),
    Document(DocumentBackend),
}

impl Backend for AnyBackend {
    fn kind(&self) -> &'static str {
        match self {
            Self::Sqlite(backend) => backend.kind(),
            Self::Document(backend) => backend.kind(),
        }
    }

    fn ensure_table(&self, table: &TableDef) -> CoreResult<()> {
        match self {
            Self::Sqlite(backend) => backend.ensure_table(table),
            Self::Document(backend) => backend.ensure_table(table),
        }
    }

    fn register(&self, entry: &CatalogEntry) -> CoreResult<()> {
        match self {
            Self::Sqlite(backend) => backend.register(entry),
            Self::Document(backend) => backend.register(entry),
        }
    }

    fn catalog(&self) -> CoreResult<Vec<CatalogEntry>> {
        match self {
            Self::Sqlite(backend) => backend.catalog(),
            Self::Document(backend) => backend.catalog(),
        }
    }

    fn read(&self, table: &TableDef, query: &Query, order: RowOrder) -> CoreResult<Vec<Record>> {
        match self {
            Self::Sqlite(backend) => backend.read(table, query, order),
            Self::Document(backend) => backend.read(table, query, order),
        }
    }

    fn current_sequence(&self, name: &str) -> CoreResult<i64> {
        match self {
            Self::Sqlite(backend) => backend.current_sequence(name),
            Self::Document(backend) => backend.current_sequence(name),
        }
    }

    fn transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> CoreResult<T>,
    {
        match self {
            Self::Sqlite(backend) => backend.transaction(work),
            Self::Document(backend) => backend.transaction(work),
        }
    }
}
