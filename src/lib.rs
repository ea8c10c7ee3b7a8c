//! Schema Reconciler
//!
//! Brings a PostgreSQL schema up to an expected definition before the
//! application serves traffic. Changes are strictly additive, each one runs in
//! its own transaction and is recorded in a ledger, and runs are serialized
//! with an advisory lock.

pub mod config;
pub mod db;
pub mod error;
pub mod expected;
pub mod introspection;
pub mod ledger;
pub mod reconciler;
pub mod schema;
pub mod target;

pub use config::Settings;
pub use error::{ReconcileError, ReconcileResult};
pub use expected::ExpectedSchema;
pub use reconciler::{ReconciliationReport, ReconciliationUnit, SchemaReconciler, ValidationOutcome};
pub use schema::SchemaDescription;
pub use target::{PostgresTarget, SchemaTarget};
