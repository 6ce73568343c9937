//! Storage-facing adapters built on the backend transaction primitives.
//!
//! # Responsibility
//! - `history_repo`: interval-tagged rows of versioned collections.
//! - `audit_repo`: append-only audit entries.

pub mod audit_repo;
pub mod history_repo;
