//! Revision sequencer.
//!
//! # Responsibility
//! - Issue the database-wide revision numbers that stamp versioned records.
//!
//! # Invariants
//! - Revisions live in the backend's `revision` sequence, never in process
//!   memory, so every collection and every process sharing the database
//!   draws from one strictly increasing sequence.
//! - `next_revision` only runs inside a backend transaction; a revision
//!   minted by a rolled-back transaction is never visible on a committed row.
//! - Revision 0 means no mutation has happened yet.

use crate::error::CoreResult;
use crate::model::audit::audit_name;
use crate::store::{Backend, StoreTx};

/// Global revision number; 1-based, 0 before any mutation.
pub type Revision = i64;

/// Backend sequence holding the last issued revision.
pub const REVISION_SEQUENCE: &str = "revision";

/// Atomic increment-and-read over the shared revision counter.
pub trait RevisionSequencer {
    /// Increments the counter and returns the new revision.
    fn next_revision(&mut self) -> CoreResult<Revision>;
    /// Highest revision issued so far (0 if none).
    fn current_revision(&self) -> CoreResult<Revision>;
}

impl RevisionSequencer for dyn StoreTx + '_ {
    fn next_revision(&mut self) -> CoreResult<Revision> {
        self.next_sequence(REVISION_SEQUENCE)
    }

    fn current_revision(&self) -> CoreResult<Revision> {
        self.current_sequence(REVISION_SEQUENCE)
    }
}

/// Reads the last issued revision outside of any write transaction.
pub fn last_revision<B: Backend>(backend: &B) -> CoreResult<Revision> {
    backend.current_sequence(REVISION_SEQUENCE)
}

/// Name of the independent audit sequence of a plain collection.
pub fn audit_sequence(collection: &str) -> String {
    audit_name(collection)
}

#[cfg(test)]
mod tests {
    use super::{audit_sequence, last_revision, RevisionSequencer};
    use crate::store::{Backend, DocumentBackend};

    #[test]
    fn revisions_start_at_zero_and_increase() {
        let backend = DocumentBackend::new();
        assert_eq!(last_revision(&backend).unwrap(), 0);

        let issued = backend
            .transaction(|tx| {
                let first = tx.next_revision()?;
                let second = tx.next_revision()?;
                Ok((first, second, tx.current_revision()?))
            })
            .unwrap();

        assert_eq!(issued, (1, 2, 2));
        assert_eq!(last_revision(&backend).unwrap(), 2);
    }

    #[test]
    fn audit_sequences_are_independent_from_revisions() {
        let backend = DocumentBackend::new();
        backend
            .transaction(|tx| tx.next_sequence(&audit_sequence("people")))
            .unwrap();
        assert_eq!(last_revision(&backend).unwrap(), 0);
    }
}
