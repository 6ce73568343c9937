//! Audit trail repository.
//!
//! # Responsibility
//! - Append one immutable entry per mutation of an audited collection.
//! - Serve filtered, read-only audit queries.
//!
//! # Invariants
//! - Entries are written in the same backend transaction as the mutation
//!   they describe.
//! - Versioned collections borrow the engine revision; plain collections
//!   draw from their own `audit_<collection>` sequence.

use crate::error::CoreResult;
use crate::model::audit::{
    ActorSource, AuditAction, AuditEntry, AUDIT_ACTION, AUDIT_DATE, AUDIT_REVISION, AUDIT_USER,
};
use crate::model::filter::{Filter, Query};
use crate::model::record::Record;
use crate::model::schema::{CollectionSchema, FieldKind};
use crate::revision::{audit_sequence, Revision};
use crate::store::{Backend, RowOrder, StoreTx, TableDef};
use crate::validation::check_filter;
use chrono::Utc;
use log::debug;
use std::sync::Arc;

/// Append-only audit log of one collection.
pub struct AuditTrail<B: Backend> {
    backend: Arc<B>,
    schema: CollectionSchema,
    table: TableDef,
    sequence: String,
    with_snapshot: bool,
    actor: Arc<dyn ActorSource>,
}

impl<B: Backend> AuditTrail<B> {
    /// Creates the `audit_<collection>` table if missing.
    ///
    /// `versioned` collections store no snapshot: their history rows already
    /// hold it.
    pub fn open(
        backend: Arc<B>,
        schema: &CollectionSchema,
        versioned: bool,
        actor: Arc<dyn ActorSource>,
    ) -> CoreResult<Self> {
        let with_snapshot = !versioned;
        let table = TableDef::for_audit(schema, with_snapshot);
        backend.ensure_table(&table)?;
        Ok(Self {
            backend,
            schema: schema.clone(),
            table,
            sequence: audit_sequence(schema.name()),
            with_snapshot,
            actor,
        })
    }

    pub fn table(&self) -> &TableDef {
        &self.table
    }

    /// Appends an entry inside the caller's transaction.
    ///
    /// `revision` is the engine revision of a versioned mutation; `None`
    /// draws the next value of the collection's audit sequence.
    pub fn record(
        &self,
        tx: &mut dyn StoreTx,
        action: AuditAction,
        revision: Option<Revision>,
        snapshot: &Record,
    ) -> CoreResult<AuditEntry> {
        let revision = match revision {
            Some(revision) => revision,
            None => tx.next_sequence(&self.sequence)?,
        };
        let snapshot = if self.with_snapshot {
            self.schema
                .fields()
                .iter()
                .map(|field| {
                    let value = snapshot.get(&field.name).cloned().unwrap_or_default();
                    (field.name.clone(), value)
                })
                .collect()
        } else {
            Record::new()
        };

        let entry = AuditEntry {
            revision,
            action,
            actor: self.actor.current_actor(),
            recorded_at: Utc::now(),
            snapshot,
        };
        tx.insert(&self.table, &entry.to_record())?;
        debug!(
            "event=audit_append module=repo status=ok table={} revision={} action={}",
            self.table.name,
            revision,
            action.as_str()
        );
        Ok(entry)
    }

    /// Entries matching `query`, oldest first.
    ///
    /// Filters may target audit columns and, for plain collections, the
    /// snapshot fields. Criteria on any other path are dropped.
    pub fn entries(&self, query: &Query) -> CoreResult<Vec<AuditEntry>> {
        let stored = query
            .filter
            .conditions()
            .filter(|(path, _)| {
                let head = path.split_once('.').map_or(*path, |(head, _)| head);
                self.table.column(head).is_some()
            })
            .fold(Filter::all(), |filter, (path, condition)| {
                filter.with(path, condition.clone())
            });

        let filter = check_filter(&self.schema, &stored, &audit_columns())?;
        let query = Query {
            filter,
            ..query.clone()
        };
        self.backend
            .read(&self.table, &query, RowOrder::Insertion)?
            .iter()
            .map(AuditEntry::from_record)
            .collect()
    }
}

fn audit_columns() -> [(&'static str, FieldKind); 4] {
    [
        (AUDIT_REVISION, FieldKind::Integer),
        (AUDIT_ACTION, FieldKind::Text),
        (AUDIT_USER, FieldKind::Text),
        (AUDIT_DATE, FieldKind::Text),
    ]
}
