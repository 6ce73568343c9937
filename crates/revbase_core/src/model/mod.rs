//! Record, schema and query model shared by every core component.
//!
//! # Responsibility
//! - Define the typed schema a collection is declared with.
//! - Define the record/filter shapes exchanged with callers.
//!
//! # Invariants
//! - Records crossing the core boundary are plain field-name maps; schema
//!   knowledge stays inside core.

pub mod audit;
pub mod filter;
pub mod record;
pub mod schema;
