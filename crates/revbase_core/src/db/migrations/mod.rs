//! Bookkeeping schema of the SQLite backend.
//!
//! # Responsibility
//! - Create the `_sequences` table (named counters, the revision sequence
//!   among them) and the `_collections` catalog.
//! - Upgrade an older database file step by step on open.
//!
//! Collection, history and audit tables are not listed here; the backend
//! creates them when a collection registers.
//!
//! # Invariants
//! - Step versions are strictly increasing and mirrored to
//!   `PRAGMA user_version`.
//! - A file written by a newer build is refused, never downgraded.

use crate::db::{DbError, DbResult};
use log::{debug, info};
use rusqlite::{Connection, TransactionBehavior};

#[derive(Debug, Clone, Copy)]
struct BookkeepingStep {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[BookkeepingStep] = &[
    BookkeepingStep {
        version: 1,
        name: "bookkeeping_tables",
        sql: include_str!("0001_bookkeeping_tables.sql"),
    },
    BookkeepingStep {
        version: 2,
        name: "revision_sequence",
        sql: include_str!("0002_revision_sequence.sql"),
    },
];

/// Bookkeeping version written by this build.
pub fn bookkeeping_version() -> u32 {
    STEPS.last().map_or(0, |step| step.version)
}

fn pending_steps(applied: u32) -> impl Iterator<Item = &'static BookkeepingStep> {
    STEPS.iter().filter(move |step| step.version > applied)
}

/// Brings the bookkeeping tables of `conn` up to [`bookkeeping_version`].
///
/// # Errors
/// - `DbError::UnsupportedSchemaVersion` when the file is newer than this
///   build.
pub fn upgrade_bookkeeping(conn: &mut Connection) -> DbResult<()> {
    let found = stored_version(conn)?;
    let latest = bookkeeping_version();
    if found > latest {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: found,
            latest_supported: latest,
        });
    }
    if found == latest {
        return Ok(());
    }

    // Two processes opening one fresh file serialize on the write lock.
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for step in pending_steps(stored_version(&tx)?) {
        tx.execute_batch(step.sql)?;
        tx.pragma_update(None, "user_version", step.version)?;
        debug!(
            "event=db_upgrade_step module=db status=ok step={} version={}",
            step.name, step.version
        );
    }
    tx.commit()?;

    info!("event=db_upgrade module=db status=ok from_version={found} to_version={latest}");
    Ok(())
}

fn stored_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::{bookkeeping_version, pending_steps, STEPS};

    #[test]
    fn step_versions_increase_and_names_are_distinct() {
        for pair in STEPS.windows(2) {
            assert!(pair[0].version < pair[1].version);
            assert_ne!(pair[0].name, pair[1].name);
        }
        assert_eq!(bookkeeping_version(), 2);
    }

    #[test]
    fn pending_steps_skip_applied_versions() {
        let names: Vec<_> = pending_steps(1).map(|step| step.name).collect();
        assert_eq!(names, vec!["revision_sequence"]);
        assert_eq!(pending_steps(bookkeeping_version()).count(), 0);
    }
}
