//! Temporal versioning over relational and document stores.
//!
//! Collections are declared with a `CollectionSchema` and opened through a
//! `Database`. Versioned collections keep every state of every record as a
//! revision-stamped interval and can be rolled back to any past revision;
//! plain collections keep only the latest state. Both can carry an audit
//! trail.

pub mod config;
pub mod database;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod repo;
pub mod revision;
pub mod service;
pub mod store;
pub mod validation;

pub use config::{DatabaseConfig, StoreUrl};
pub use database::{CollectionOptions, Database};
pub use error::{CoreError, CoreResult, FieldErrors};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::audit::{ActorSource, AuditAction, AuditEntry, StaticActor};
pub use model::filter::{Condition, Filter, Query};
pub use model::record::{Record, Value, UNBOUNDED, VALID_SINCE, VALID_UNTIL};
pub use model::schema::{CollectionSchema, FieldKind, FieldSpec};
pub use revision::{Revision, RevisionSequencer};
pub use service::crud_service::Collection;
pub use service::rollback::RollbackRequest;
pub use service::versioned_service::VersionedCollection;
pub use store::{AnyBackend, Backend, CatalogEntry, DocumentBackend, SqliteBackend};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
