//! In-process document backend.
//!
//! # Responsibility
//! - Keep tables as ordered row lists behind one lock.
//! - Offer the same transaction contract as the SQLite backend so the engine
//!   runs unchanged on top of it.
//!
//! # Invariants
//! - A transaction holds the state lock for its whole duration and stages
//!   copies of the tables it writes; staged tables replace the committed ones
//!   only when the closure returns `Ok`.
//! - Unique keys are checked on every insert/update; `null` never conflicts.
//! - Backends opened with the same name share one state for the lifetime of
//!   the process.

use crate::error::{CoreError, CoreResult};
use crate::model::filter::{Filter, Query};
use crate::model::record::{
    is_current, revision_field, values_equal, Record, UNBOUNDED, VALID_SINCE,
};
use crate::store::{Backend, CatalogEntry, RowOrder, StoreTx, TableDef, UniqueScope};
use log::debug;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

static NAMED_STORES: Lazy<Mutex<HashMap<String, DocumentBackend>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Document store kept in process memory.
#[derive(Clone, Default)]
pub struct DocumentBackend {
    state: Arc<Mutex<DocumentState>>,
}

#[derive(Default)]
struct DocumentState {
    tables: HashMap<String, DocumentTable>,
    sequences: HashMap<String, i64>,
    catalog: BTreeMap<String, CatalogEntry>,
}

#[derive(Clone)]
struct DocumentTable {
    def: TableDef,
    rows: Vec<Record>,
}

impl DocumentBackend {
    /// Creates a private, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide store registered under `name`, creating it on
    /// first use.
    pub fn named(name: &str) -> Self {
        let mut stores = NAMED_STORES.lock();
        stores
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("event=store_create module=store backend=document name={name}");
                Self::new()
            })
            .clone()
    }
}

impl Backend for DocumentBackend {
    fn kind(&self) -> &'static str {
        "document"
    }

    fn ensure_table(&self, table: &TableDef) -> CoreResult<()> {
        let mut state = self.state.lock();
        state
            .tables
            .entry(table.name.clone())
            .or_insert_with(|| DocumentTable {
                def: table.clone(),
                rows: Vec::new(),
            });
        Ok(())
    }

    fn register(&self, entry: &CatalogEntry) -> CoreResult<()> {
        let mut state = self.state.lock();
        match state.catalog.get_mut(entry.name()) {
            Some(existing) => {
                if existing.schema != entry.schema || existing.versioned != entry.versioned {
                    return Err(CoreError::Schema(format!(
                        "collection `{}` is already registered with a different layout",
                        entry.name()
                    )));
                }
                existing.audited = entry.audited;
            }
            None => {
                state.catalog.insert(entry.name().to_string(), entry.clone());
            }
        }
        Ok(())
    }

    fn catalog(&self) -> CoreResult<Vec<CatalogEntry>> {
        let state = self.state.lock();
        Ok(state.catalog.values().cloned().collect())
    }

    fn read(&self, table: &TableDef, query: &Query, order: RowOrder) -> CoreResult<Vec<Record>> {
        let state = self.state.lock();
        let stored = state
            .tables
            .get(&table.name)
            .ok_or_else(|| unknown_table(&table.name))?;
        check_columns(&stored.def, &query.filter)?;

        let mut rows: Vec<Record> = stored
            .rows
            .iter()
            .filter(|row| query.filter.matches(row))
            .cloned()
            .collect();
        if order == RowOrder::NewestRevisionFirst && stored.def.column(VALID_SINCE).is_some() {
            rows.sort_by_key(|row| Reverse(revision_field(row, VALID_SINCE).unwrap_or(UNBOUNDED)));
        }
        Ok(query.paginate(rows))
    }

    fn current_sequence(&self, name: &str) -> CoreResult<i64> {
        let state = self.state.lock();
        Ok(state.sequences.get(name).copied().unwrap_or(0))
    }

    fn transaction<T, F>(&self, work: F) -> CoreResult<T>
    where
        F: FnOnce(&mut dyn StoreTx) -> CoreResult<T>,
    {
        let mut state = self.state.lock();
        let mut tx = DocumentTx {
            base: &state,
            staged_tables: HashMap::new(),
            staged_sequences: HashMap::new(),
        };
        let value = work(&mut tx)?;

        let DocumentTx {
            staged_tables,
            staged_sequences,
            ..
        } = tx;
        state.tables.extend(staged_tables);
        state.sequences.extend(staged_sequences);
        Ok(value)
    }
}

struct DocumentTx<'s> {
    base: &'s DocumentState,
    staged_tables: HashMap<String, DocumentTable>,
    staged_sequences: HashMap<String, i64>,
}

impl DocumentTx<'_> {
    fn table(&self, name: &str) -> CoreResult<&DocumentTable> {
        self.staged_tables
            .get(name)
            .or_else(|| self.base.tables.get(name))
            .ok_or_else(|| unknown_table(name))
    }

    fn table_mut(&mut self, name: &str) -> CoreResult<&mut DocumentTable> {
        if !self.staged_tables.contains_key(name) {
            let table = self
                .base
                .tables
                .get(name)
                .cloned()
                .ok_or_else(|| unknown_table(name))?;
            self.staged_tables.insert(name.to_string(), table);
        }
        self.staged_tables
            .get_mut(name)
            .ok_or_else(|| unknown_table(name))
    }
}

impl StoreTx for DocumentTx<'_> {
    fn select(&self, table: &TableDef, filter: &Filter) -> CoreResult<Vec<Record>> {
        let stored = self.table(&table.name)?;
        check_columns(&stored.def, filter)?;
        Ok(stored
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    fn insert(&mut self, table: &TableDef, row: &Record) -> CoreResult<()> {
        let stored = self.table_mut(&table.name)?;
        let row = stored.def.project(row);
        check_unique(&stored.def, &stored.rows, None, &row)?;
        stored.rows.push(row);
        Ok(())
    }

    fn update(&mut self, table: &TableDef, filter: &Filter, changes: &Record) -> CoreResult<usize> {
        let stored = self.table_mut(&table.name)?;
        check_columns(&stored.def, filter)?;

        let mut next = stored.rows.clone();
        let mut changed = Vec::new();
        for (index, row) in next.iter_mut().enumerate() {
            if !filter.matches(row) {
                continue;
            }
            for (name, value) in changes {
                if stored.def.column(name).is_some() {
                    row.insert(name.clone(), value.clone());
                }
            }
            changed.push(index);
        }
        for &index in &changed {
            check_unique(&stored.def, &next, Some(index), &next[index])?;
        }

        stored.rows = next;
        Ok(changed.len())
    }

    fn delete(&mut self, table: &TableDef, filter: &Filter) -> CoreResult<usize> {
        let stored = self.table_mut(&table.name)?;
        check_columns(&stored.def, filter)?;
        let before = stored.rows.len();
        stored.rows.retain(|row| !filter.matches(row));
        Ok(before - stored.rows.len())
    }

    fn max_integer(&self, table: &TableDef, column: &str) -> CoreResult<Option<i64>> {
        let stored = self.table(&table.name)?;
        Ok(stored
            .rows
            .iter()
            .filter_map(|row| revision_field(row, column))
            .max())
    }

    fn next_sequence(&mut self, name: &str) -> CoreResult<i64> {
        let next = self.current_sequence(name)? + 1;
        self.staged_sequences.insert(name.to_string(), next);
        Ok(next)
    }

    fn current_sequence(&self, name: &str) -> CoreResult<i64> {
        Ok(self
            .staged_sequences
            .get(name)
            .or_else(|| self.base.sequences.get(name))
            .copied()
            .unwrap_or(0))
    }
}

fn check_unique(
    def: &TableDef,
    rows: &[Record],
    skip: Option<usize>,
    candidate: &Record,
) -> CoreResult<()> {
    if def.unique_scope == UniqueScope::CurrentRows && !is_current(candidate) {
        return Ok(());
    }

    for key in &def.unique_keys {
        let values: Vec<_> = key.iter().map(|column| candidate.get(column)).collect();
        if values.iter().any(|value| value.map_or(true, |value| value.is_null())) {
            continue;
        }

        let conflict = rows.iter().enumerate().any(|(index, row)| {
            Some(index) != skip
                && (def.unique_scope == UniqueScope::AllRows || is_current(row))
                && key.iter().zip(&values).all(|(column, expected)| {
                    match (row.get(column), expected) {
                        (Some(actual), Some(expected)) => values_equal(actual, expected),
                        _ => false,
                    }
                })
        });
        if conflict {
            return Err(CoreError::AlreadyExists {
                payload: candidate.clone(),
            });
        }
    }
    Ok(())
}

fn check_columns(def: &TableDef, filter: &Filter) -> CoreResult<()> {
    for (path, _) in filter.conditions() {
        let head = path.split_once('.').map_or(path, |(head, _)| head);
        if def.column(head).is_none() {
            return Err(CoreError::Schema(format!(
                "unknown column `{path}` in table `{}`",
                def.name
            )));
        }
    }
    Ok(())
}

fn unknown_table(name: &str) -> CoreError {
    CoreError::Schema(format!("table `{name}` does not exist"))
}

#[cfg(test)]
mod tests {
    use super::DocumentBackend;
    use crate::error::CoreError;
    use crate::model::filter::{Filter, Query};
    use crate::model::record::{with_interval, Record, UNBOUNDED};
    use crate::model::schema::{CollectionSchema, FieldSpec};
    use crate::store::{Backend, RowOrder, TableDef};
    use serde_json::json;

    fn table() -> TableDef {
        let schema = CollectionSchema::new(
            "docs",
            vec![
                FieldSpec::text("key").primary_key(),
                FieldSpec::integer("value"),
            ],
        )
        .unwrap();
        TableDef::for_history(&schema)
    }

    fn row(key: &str, value: i64, since: i64, until: i64) -> Record {
        let base = json!({"key": key, "value": value}).as_object().cloned().unwrap();
        with_interval(&base, since, until)
    }

    #[test]
    fn failed_transaction_discards_staged_writes() {
        let backend = DocumentBackend::new();
        let table = table();
        backend.ensure_table(&table).unwrap();

        let result: Result<(), CoreError> = backend.transaction(|tx| {
            tx.insert(&table, &row("a", 1, 1, UNBOUNDED))?;
            tx.next_sequence("revision")?;
            Err(CoreError::InvalidData("stop".to_string()))
        });

        assert!(result.is_err());
        assert!(backend.read(&table, &Query::all(), RowOrder::Insertion).unwrap().is_empty());
        assert_eq!(backend.current_sequence("revision").unwrap(), 0);
    }

    #[test]
    fn closed_rows_do_not_conflict_with_current_ones() {
        let backend = DocumentBackend::new();
        let table = table();
        backend.ensure_table(&table).unwrap();

        backend
            .transaction(|tx| {
                tx.insert(&table, &row("a", 1, 1, 2))?;
                tx.insert(&table, &row("a", 2, 2, UNBOUNDED))
            })
            .unwrap();

        let duplicate = backend.transaction(|tx| tx.insert(&table, &row("a", 3, 3, UNBOUNDED)));
        assert!(matches!(duplicate, Err(CoreError::AlreadyExists { .. })));
    }

    #[test]
    fn newest_revision_first_is_stable() {
        let backend = DocumentBackend::new();
        let table = table();
        backend.ensure_table(&table).unwrap();
        backend
            .transaction(|tx| {
                tx.insert(&table, &row("a", 1, 1, 2))?;
                tx.insert(&table, &row("b", 1, 2, UNBOUNDED))?;
                tx.insert(&table, &row("a", 2, 2, UNBOUNDED))
            })
            .unwrap();

        let rows = backend
            .read(&table, &Query::filtered(Filter::all()), RowOrder::NewestRevisionFirst)
            .unwrap();
        let keys: Vec<_> = rows.iter().map(|row| row["key"].clone()).collect();
        assert_eq!(keys, vec![json!("b"), json!("a"), json!("a")]);
        assert_eq!(rows[1]["value"], json!(2));
    }

    #[test]
    fn named_stores_share_state() {
        let first = DocumentBackend::named("document-tests-shared");
        let second = DocumentBackend::named("document-tests-shared");
        first.transaction(|tx| tx.next_sequence("revision")).unwrap();
        assert_eq!(second.current_sequence("revision").unwrap(), 1);
    }
}
