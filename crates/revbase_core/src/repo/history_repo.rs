//! History store adapter for versioned collections.
//!
//! # Responsibility
//! - Store one row per validity interval of a logical entity.
//! - Answer current, full-history and point-in-time queries.
//! - Offer the row primitives (`insert`, `close`, lookups) the versioning
//!   engine composes inside one backend transaction.
//!
//! # Invariants
//! - At most one row per primary key has `valid_until_revision = -1`.
//! - Closing a row only ever sets its `valid_until_revision`; no other
//!   column of a stored interval is rewritten.
//! - History reads are newest interval first.

use crate::error::CoreResult;
use crate::model::filter::{Condition, Filter, Query};
use crate::model::record::{is_valid_at, with_interval, Record, Value, UNBOUNDED, VALID_UNTIL};
use crate::model::schema::CollectionSchema;
use crate::revision::Revision;
use crate::store::{Backend, RowOrder, StoreTx, TableDef};
use std::sync::Arc;

/// Interval-tagged storage of one versioned collection.
pub struct HistoryStore<B: Backend> {
    backend: Arc<B>,
    table: TableDef,
}

impl<B: Backend> HistoryStore<B> {
    /// Creates the history table (and its current-row unique indexes) if
    /// missing.
    pub fn open(backend: Arc<B>, schema: &CollectionSchema) -> CoreResult<Self> {
        let table = TableDef::for_history(schema);
        backend.ensure_table(&table)?;
        Ok(Self { backend, table })
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    /// Currently valid rows matching `query`, in insertion order.
    pub fn query_current(&self, query: &Query) -> CoreResult<Vec<Record>> {
        let query = Query {
            filter: current_only(&query.filter),
            ..query.clone()
        };
        self.backend.read(&self.table, &query, RowOrder::Insertion)
    }

    /// Every stored interval matching `query`, newest interval first.
    pub fn query_history(&self, query: &Query) -> CoreResult<Vec<Record>> {
        self.backend
            .read(&self.table, query, RowOrder::NewestRevisionFirst)
    }

    /// Rows that were valid at `revision`, in insertion order.
    ///
    /// Revision 0 (and anything below) precedes every mutation and yields no
    /// rows.
    pub fn query_as_of(&self, revision: Revision, query: &Query) -> CoreResult<Vec<Record>> {
        if revision < 1 {
            return Ok(Vec::new());
        }
        let candidates = self.backend.read(
            &self.table,
            &Query::filtered(query.filter.clone()),
            RowOrder::Insertion,
        )?;
        let valid = candidates
            .into_iter()
            .filter(|row| is_valid_at(row, revision))
            .collect();
        Ok(query.paginate(valid))
    }

    /// Stores `record` as the current interval starting at `since`.
    pub fn insert(
        &self,
        tx: &mut dyn StoreTx,
        record: &Record,
        since: Revision,
    ) -> CoreResult<Record> {
        let row = with_interval(record, since, UNBOUNDED);
        tx.insert(&self.table, &row)?;
        Ok(row)
    }

    /// Closes the current interval of `key` at revision `at`.
    ///
    /// Returns the number of closed rows (0 when the key has no current row).
    pub fn close(&self, tx: &mut dyn StoreTx, key: &Record, at: Revision) -> CoreResult<usize> {
        let mut changes = Record::new();
        changes.insert(VALID_UNTIL.to_string(), Value::from(at));
        tx.update(&self.table, &current_only(&Filter::from_record(key)), &changes)
    }

    pub fn find_current(&self, tx: &dyn StoreTx, key: &Record) -> CoreResult<Option<Record>> {
        let rows = self.select_current(tx, &Filter::from_record(key))?;
        Ok(rows.into_iter().next())
    }

    pub fn select_current(&self, tx: &dyn StoreTx, filter: &Filter) -> CoreResult<Vec<Record>> {
        tx.select(&self.table, &current_only(filter))
    }

    /// Every stored interval matching `filter`, in insertion order.
    pub fn select_history(&self, tx: &dyn StoreTx, filter: &Filter) -> CoreResult<Vec<Record>> {
        tx.select(&self.table, filter)
    }

    /// All intervals of one logical entity, in insertion order.
    pub fn entity_rows(&self, tx: &dyn StoreTx, key: &Record) -> CoreResult<Vec<Record>> {
        tx.select(&self.table, &Filter::from_record(key))
    }
}

fn current_only(filter: &Filter) -> Filter {
    filter.with(VALID_UNTIL, Condition::Eq(Value::from(UNBOUNDED)))
}
