//! Plain (unversioned) collection service.
//!
//! # Responsibility
//! - Provide the same CRUD surface as versioned collections over a table
//!   holding one row per entity.
//! - Append audit entries with record snapshots when audit is enabled.
//!
//! # Invariants
//! - Updates and deletes rewrite rows in place; no history is kept.
//! - Audit entries are numbered by the collection's own audit sequence.

use crate::error::{CoreError, CoreResult};
use crate::model::audit::{ActorSource, AuditAction, AuditEntry};
use crate::model::filter::{Filter, Query};
use crate::model::record::Record;
use crate::model::schema::CollectionSchema;
use crate::repo::audit_repo::AuditTrail;
use crate::service::support::{
    assign_generated_keys, attribute_conflict, checked_query, run_batch, single,
};
use crate::store::{Backend, CatalogEntry, RowOrder, StoreTx, TableDef};
use crate::validation::{check_filter, merge_update, prepare_insert, prepare_update};
use log::{info, warn};
use std::sync::Arc;

/// Collection storing only the latest state of each record.
pub struct Collection<B: Backend> {
    schema: CollectionSchema,
    backend: Arc<B>,
    table: TableDef,
    audit: Option<AuditTrail<B>>,
}

impl<B: Backend> Collection<B> {
    /// Registers the collection and creates its tables if missing.
    ///
    /// Passing an `actor` enables the audit trail.
    pub fn open(
        backend: Arc<B>,
        schema: CollectionSchema,
        actor: Option<Arc<dyn ActorSource>>,
    ) -> CoreResult<Self> {
        backend.register(&CatalogEntry {
            schema: schema.clone(),
            versioned: false,
            audited: actor.is_some(),
        })?;
        let table = TableDef::for_collection(&schema);
        backend.ensure_table(&table)?;
        let audit = actor
            .map(|actor| AuditTrail::open(Arc::clone(&backend), &schema, false, actor))
            .transpose()?;

        info!(
            "event=collection_open module=service status=ok collection={} backend={} versioned=false audited={}",
            schema.name(),
            backend.kind(),
            audit.is_some()
        );
        Ok(Self {
            schema,
            backend,
            table,
            audit,
        })
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// Inserts one record and returns it with generated fields filled.
    pub fn insert(&self, input: &Record) -> CoreResult<Record> {
        let prepared = prepare_insert(&self.schema, input)?;
        let record = self
            .backend
            .transaction(|tx| {
                let mut record = prepared.clone();
                assign_generated_keys(tx, &self.schema, &self.table, &mut record)?;
                tx.insert(&self.table, &record)?;
                self.audit(tx, AuditAction::Insert, &record)?;
                Ok(record)
            })
            .map_err(|err| self.failed("insert", attribute_conflict(err, input)))?;
        self.mutated("insert", 1);
        Ok(record)
    }

    pub fn insert_many(&self, inputs: &[Record]) -> CoreResult<Vec<Record>> {
        run_batch(self.name(), inputs, |input| self.insert(input))
    }

    /// Updates the record of the payload's key in place.
    ///
    /// Returns `(previous, new)`.
    ///
    /// # Errors
    /// - `NotFound` (carrying the payload) when no record has this key.
    pub fn update(&self, input: &Record) -> CoreResult<(Record, Record)> {
        let changes = prepare_update(&self.schema, input)?;
        let key = Filter::from_record(&self.schema.key_of(&changes));
        let pair = self
            .backend
            .transaction(|tx| {
                let previous = tx
                    .select(&self.table, &key)?
                    .into_iter()
                    .next()
                    .ok_or_else(|| CoreError::NotFound {
                        requested: input.clone(),
                    })?;
                let merged = merge_update(&self.schema, &previous, &changes);
                tx.update(&self.table, &key, &merged)?;
                self.audit(tx, AuditAction::Update, &merged)?;
                Ok((previous, merged))
            })
            .map_err(|err| self.failed("update", attribute_conflict(err, input)))?;
        self.mutated("update", 1);
        Ok(pair)
    }

    pub fn update_many(&self, inputs: &[Record]) -> CoreResult<Vec<(Record, Record)>> {
        run_batch(self.name(), inputs, |input| self.update(input))
    }

    /// Removes every record matching `filter`; returns how many were removed.
    pub fn delete(&self, filter: &Filter) -> CoreResult<usize> {
        let filter = check_filter(&self.schema, filter, &[])?;
        let removed = self.backend.transaction(|tx| {
            let rows = tx.select(&self.table, &filter)?;
            for row in &rows {
                self.audit(tx, AuditAction::Delete, row)?;
            }
            tx.delete(&self.table, &filter)
        })?;
        self.mutated("delete", removed);
        Ok(removed)
    }

    pub fn delete_many(&self, filters: &[Filter]) -> CoreResult<Vec<usize>> {
        run_batch(self.name(), filters, |filter| self.delete(filter))
    }

    /// Records matching `query`, in insertion order.
    pub fn get(&self, query: &Query) -> CoreResult<Vec<Record>> {
        let query = checked_query(&self.schema, query, &[])?;
        self.backend.read(&self.table, &query, RowOrder::Insertion)
    }

    /// The single record matching `filter`, if any.
    ///
    /// # Errors
    /// - `ValidationFailed` when more than one record matches.
    pub fn get_one(&self, filter: &Filter) -> CoreResult<Option<Record>> {
        let rows = self.get(&Query::filtered(filter.clone()))?;
        single(rows, &filter.to_record())
    }

    /// Audit entries matching `query`.
    ///
    /// # Errors
    /// - `Schema` when the collection was opened without audit.
    pub fn get_audit(&self, query: &Query) -> CoreResult<Vec<AuditEntry>> {
        match &self.audit {
            Some(audit) => audit.entries(query),
            None => Err(CoreError::Schema(format!(
                "collection `{}` is not audited",
                self.name()
            ))),
        }
    }

    fn audit(
        &self,
        tx: &mut dyn StoreTx,
        action: AuditAction,
        snapshot: &Record,
    ) -> CoreResult<()> {
        if let Some(audit) = &self.audit {
            audit.record(tx, action, None, snapshot)?;
        }
        Ok(())
    }

    fn mutated(&self, event: &str, rows: usize) {
        info!(
            "event={} module=service status=ok collection={} rows={}",
            event,
            self.name(),
            rows
        );
    }

    fn failed(&self, event: &str, err: CoreError) -> CoreError {
        warn!(
            "event={} module=service status=error collection={} error_code={}",
            event,
            self.name(),
            err.code()
        );
        err
    }
}
