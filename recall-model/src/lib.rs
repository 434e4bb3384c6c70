//! Entity model for Recall.
//!
//! Defines the kind-agnostic types the sync engine is parameterized by:
//! - [`Entity`]: a record of some kind (id + JSON object of fields)
//! - [`EntitySchema`]: per-kind configuration: table name, field specs,
//!   version marker
//! - [`Filter`]: field predicates used by mirror subscriptions and reads
//! - [`KindHandler`]: optional per-kind validation and post-merge hooks
//!
//! A concrete entity kind (works, assets, boards, ...) is a schema plus an
//! optional handler, never a separate implementation of merge, dispatch or
//! cleanup. See [`builtin`] for the kinds the application ships with.

pub mod builtin;
mod entity;
mod error;
mod filter;
mod handler;
mod schema;

pub use entity::Entity;
pub use error::{ValidationError, ValidationResult};
pub use filter::{Filter, FilterClause};
pub use handler::KindHandler;
pub use schema::{EntitySchema, FieldSpec, FieldType};
