//! Versioning engine.
//!
//! # Responsibility
//! - Turn inserts, updates and deletes into appended, revision-stamped
//!   intervals of the history store.
//! - Reconstruct the state of any past revision by appending corrective
//!   intervals (`rollback`).
//! - Hook the audit trail into every mutation.
//!
//! # Invariants
//! - Every logical entity mutation mints exactly one revision, inside the
//!   same backend transaction that closes and inserts its rows.
//! - Updates always append a new interval, even when no field changed.
//! - Delete and rollback never fail because nothing matched; they return 0.
//! - Batch entries commit one by one; a failed entry never undoes earlier
//!   ones.

use crate::error::{CoreError, CoreResult};
use crate::model::audit::{ActorSource, AuditAction, AuditEntry};
use crate::model::filter::{Filter, Query};
use crate::model::record::{without_interval, Record, Value, UNBOUNDED, VALID_SINCE, VALID_UNTIL};
use crate::model::schema::{CollectionSchema, FieldKind};
use crate::repo::audit_repo::AuditTrail;
use crate::repo::history_repo::HistoryStore;
use crate::revision::{last_revision, Revision, RevisionSequencer};
use crate::service::rollback::{plan_entity, EntityPlan, RollbackRequest};
use crate::service::support::{
    assign_generated_keys, attribute_conflict, checked_query, run_batch, single,
};
use crate::store::{Backend, CatalogEntry, StoreTx};
use crate::validation::{check_filter, merge_update, prepare_insert, prepare_update};
use log::{info, warn};
use std::sync::Arc;

/// Collection whose records keep their full revision history.
pub struct VersionedCollection<B: Backend> {
    schema: CollectionSchema,
    backend: Arc<B>,
    history: HistoryStore<B>,
    audit: Option<AuditTrail<B>>,
}

impl<B: Backend> VersionedCollection<B> {
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
            versioned: true,
            audited: actor.is_some(),
        })?;
        let history = HistoryStore::open(Arc::clone(&backend), &schema)?;
        let audit = actor
            .map(|actor| AuditTrail::open(Arc::clone(&backend), &schema, true, actor))
            .transpose()?;

        info!(
            "event=collection_open module=service status=ok collection={} backend={} versioned=true audited={}",
            schema.name(),
            backend.kind(),
            audit.is_some()
        );
        Ok(Self {
            schema,
            backend,
            history,
            audit,
        })
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn schema(&self) -> &CollectionSchema {
        &self.schema
    }

    /// Highest revision issued in this database (shared by all collections).
    pub fn current_revision(&self) -> CoreResult<Revision> {
        last_revision(self.backend.as_ref())
    }

    /// Inserts a new logical entity.
    ///
    /// # Errors
    /// - `ValidationFailed` when the payload does not fit the schema.
    /// - `AlreadyExists` when the key (or a unique field) is held by a
    ///   current record.
    pub fn insert(&self, input: &Record) -> CoreResult<Record> {
        let prepared = prepare_insert(&self.schema, input)?;
        let row = self
            .backend
            .transaction(|tx| self.insert_in(tx, &prepared))
            .map_err(|err| self.failed("versioned_insert", attribute_conflict(err, input)))?;
        self.mutated("versioned_insert", &row);
        Ok(row)
    }

    /// Inserts every entry with its own revision, in input order.
    pub fn insert_many(&self, inputs: &[Record]) -> CoreResult<Vec<Record>> {
        run_batch(self.name(), inputs, |input| self.insert(input))
    }

    /// Updates the current record of the payload's key.
    ///
    /// Returns `(previous, new)`. A new interval is appended even when the
    /// merged fields equal the previous ones.
    ///
    /// # Errors
    /// - `NotFound` when the key has no current record.
    pub fn update(&self, input: &Record) -> CoreResult<(Record, Record)> {
        let changes = prepare_update(&self.schema, input)?;
        let key = self.schema.key_of(&changes);
        let pair = self
            .backend
            .transaction(|tx| {
                let previous = self
                    .history
                    .find_current(tx, &key)?
                    .ok_or_else(|| CoreError::NotFound {
                        requested: requested_current(&key),
                    })?;
                let merged = merge_update(&self.schema, &without_interval(&previous), &changes);

                let revision = tx.next_revision()?;
                self.history.close(tx, &key, revision)?;
                let row = self.history.insert(tx, &merged, revision)?;
                self.audit(tx, AuditAction::Update, revision)?;
                Ok((previous, row))
            })
            .map_err(|err| self.failed("versioned_update", attribute_conflict(err, input)))?;
        self.mutated("versioned_update", &pair.1);
        Ok(pair)
    }

    /// Updates every entry with its own revision, in input order.
    pub fn update_many(&self, inputs: &[Record]) -> CoreResult<Vec<(Record, Record)>> {
        run_batch(self.name(), inputs, |input| self.update(input))
    }

    /// Closes the current record of every entity matching `filter`.
    ///
    /// Each closed entity gets its own revision. Returns the number of
    /// closed entities; 0 when nothing matched.
    pub fn delete(&self, filter: &Filter) -> CoreResult<usize> {
        let filter = check_filter(&self.schema, filter, &[])?;
        let closed = self.backend.transaction(|tx| {
            let current = self.history.select_current(tx, &filter)?;
            for row in &current {
                let revision = tx.next_revision()?;
                self.history.close(tx, &self.schema.key_of(row), revision)?;
                self.audit(tx, AuditAction::Delete, revision)?;
            }
            Ok(current.len())
        })?;
        info!(
            "event=versioned_delete module=service status=ok collection={} closed={}",
            self.name(),
            closed
        );
        Ok(closed)
    }

    /// Runs one delete per filter, each in its own transaction.
    pub fn delete_many(&self, filters: &[Filter]) -> CoreResult<Vec<usize>> {
        run_batch(self.name(), filters, |filter| self.delete(filter))
    }

    /// Current records matching `query`.
    pub fn get(&self, query: &Query) -> CoreResult<Vec<Record>> {
        let query = checked_query(&self.schema, query, &interval_columns())?;
        self.history.query_current(&query)
    }

    /// The single current record matching `filter`, if any.
    ///
    /// # Errors
    /// - `ValidationFailed` when more than one record matches.
    pub fn get_one(&self, filter: &Filter) -> CoreResult<Option<Record>> {
        let rows = self.get(&Query::filtered(filter.clone()))?;
        single(rows, &filter.to_record())
    }

    /// Every interval matching `query`, newest first.
    pub fn get_history(&self, query: &Query) -> CoreResult<Vec<Record>> {
        let query = checked_query(&self.schema, query, &interval_columns())?;
        self.history.query_history(&query)
    }

    /// Records as they were at `revision`.
    pub fn get_as_of(&self, revision: Revision, query: &Query) -> CoreResult<Vec<Record>> {
        let query = checked_query(&self.schema, query, &interval_columns())?;
        self.history.query_as_of(revision, &query)
    }

    /// Parses `{"revision": <int>, ...criteria}` and rolls back.
    pub fn rollback_to(&self, payload: &Record) -> CoreResult<usize> {
        let request = RollbackRequest::from_record(&self.schema, payload)?;
        self.rollback(&request)
    }

    /// Restores the state as of `request.revision` for every entity with an
    /// interval matching `request.filter`.
    ///
    /// Each changed entity gets a fresh revision: its current row is closed
    /// and, when it existed at the target, the fields valid then are
    /// appended as a new current row. Restored rows are inserted after all
    /// closes. Returns the number of changed entities.
    pub fn rollback(&self, request: &RollbackRequest) -> CoreResult<usize> {
        if request.revision < 0 {
            return Ok(0);
        }
        let filter = check_filter(&self.schema, &request.filter, &[])?;

        let changed = self
            .backend
            .transaction(|tx| {
                let mut keys: Vec<Record> = Vec::new();
                for row in self.history.select_history(tx, &filter)? {
                    let key = self.schema.key_of(&row);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }

                // Every close precedes every restore: unique values may move
                // between entities across the rolled-back revisions.
                let mut restores = Vec::new();
                let mut changed = 0;
                for key in &keys {
                    let rows = self.history.entity_rows(tx, key)?;
                    let (close_current, fields) = match plan_entity(&rows, request.revision) {
                        EntityPlan::Unchanged => continue,
                        EntityPlan::Close => (true, None),
                        EntityPlan::Restore {
                            close_current,
                            fields,
                        } => (close_current, Some(fields)),
                    };

                    let revision = tx.next_revision()?;
                    if close_current {
                        self.history.close(tx, key, revision)?;
                    }
                    if let Some(fields) = fields {
                        restores.push((fields, revision));
                    }
                    self.audit(tx, AuditAction::Rollback, revision)?;
                    changed += 1;
                }
                for (fields, revision) in &restores {
                    self.history.insert(tx, fields, *revision)?;
                }
                Ok(changed)
            })
            .map_err(|err| self.failed("rollback", err))?;

        info!(
            "event=rollback module=service status=ok collection={} target={} changed={}",
            self.name(),
            request.revision,
            changed
        );
        Ok(changed)
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

    fn insert_in(&self, tx: &mut dyn StoreTx, prepared: &Record) -> CoreResult<Record> {
        let mut record = prepared.clone();
        assign_generated_keys(tx, &self.schema, self.history.table(), &mut record)?;

        let key = self.schema.key_of(&record);
        if self.history.find_current(tx, &key)?.is_some() {
            return Err(CoreError::AlreadyExists { payload: record });
        }

        let revision = tx.next_revision()?;
        let row = self.history.insert(tx, &record, revision)?;
        self.audit(tx, AuditAction::Insert, revision)?;
        Ok(row)
    }

    fn audit(
        &self,
        tx: &mut dyn StoreTx,
        action: AuditAction,
        revision: Revision,
    ) -> CoreResult<()> {
        if let Some(audit) = &self.audit {
            audit.record(tx, action, Some(revision), &Record::new())?;
        }
        Ok(())
    }

    fn mutated(&self, event: &str, row: &Record) {
        info!(
            "event={} module=service status=ok collection={} revision={}",
            event,
            self.name(),
            row.get(VALID_SINCE).and_then(Value::as_i64).unwrap_or_default()
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

fn interval_columns() -> [(&'static str, FieldKind); 2] {
    [
        (VALID_SINCE, FieldKind::Integer),
        (VALID_UNTIL, FieldKind::Integer),
    ]
}

/// Shape reported by `NotFound`: the key restricted to current rows.
fn requested_current(key: &Record) -> Record {
    let mut requested = key.clone();
    requested.insert(VALID_UNTIL.to_string(), Value::from(UNBOUNDED));
    requested
}
