//! Collection services.
//!
//! # Responsibility
//! - Orchestrate validation, revisions, history and audit into the
//!   collection-level CRUD and rollback APIs.
//! - Keep callers decoupled from the backend in use.

pub mod crud_service;
pub mod rollback;
pub(crate) mod support;
pub mod versioned_service;
