//! Error handling module
//!
//! Provides the error taxonomy shared by the inspector, the ledger and the
//! reconciler, plus the classification of driver errors into it.

use serde::Serialize;
use thiserror::Error;
use tokio_postgres::error::SqlState;
use tracing::error;

use crate::expected::ExpectedSchemaError;

/// Reconciliation-wide error type
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Permission error: {0}")]
    Permission(String),

    #[error("Unit {identifier} failed: {message}\n  SQL: {sql}")]
    UnitApplication {
        identifier: String,
        sql: String,
        message: String,
    },

    #[error("Validation failed: {} violation(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),

    #[error("Advisory lock {key} unavailable after {attempts} attempt(s)")]
    LockUnavailable { key: i64, attempts: u32 },

    #[error("Expected schema error: {0}")]
    ExpectedSchema(#[from] ExpectedSchemaError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),
}

/// Machine-readable error summary, used for `--json` output
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    pub success: bool,
    pub code: &'static str,
    pub message: String,
}

impl ReconcileError {
    /// Stable error code for logs and JSON output
    pub fn code(&self) -> &'static str {
        match self {
            ReconcileError::Connectivity(_) => "CONNECTIVITY_ERROR",
            ReconcileError::Permission(_) => "PERMISSION_ERROR",
            ReconcileError::UnitApplication { .. } => "UNIT_APPLICATION_ERROR",
            ReconcileError::Validation(_) => "VALIDATION_ERROR",
            ReconcileError::LockUnavailable { .. } => "LOCK_UNAVAILABLE",
            ReconcileError::ExpectedSchema(_) => "EXPECTED_SCHEMA_ERROR",
            ReconcileError::Config(_) => "CONFIG_ERROR",
            ReconcileError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// Process exit status for the CLI.
    ///
    /// `1` means the schema is in a known but unsafe state (a unit failed or
    /// validation found missing elements). `2` means the run could not be
    /// carried out at all.
    pub fn exit_code(&self) -> i32 {
        match self {
            ReconcileError::UnitApplication { .. } | ReconcileError::Validation(_) => 1,
            _ => 2,
        }
    }

    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            success: false,
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for ReconcileError {
    fn from(e: tokio_postgres::Error) -> Self {
        classify_db_error(&e)
    }
}

impl From<deadpool_postgres::PoolError> for ReconcileError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        use deadpool_postgres::PoolError;

        match e {
            PoolError::Backend(inner) => classify_db_error(&inner),
            PoolError::Timeout(kind) => {
                ReconcileError::Connectivity(format!("timed out waiting for a connection ({kind:?})"))
            }
            other => ReconcileError::Connectivity(other.to_string()),
        }
    }
}

/// Map a driver error onto the taxonomy.
///
/// Transport errors without a SQLSTATE never reached the server (I/O, TLS,
/// closed socket) and count as connectivity failures.
pub fn classify_db_error(e: &tokio_postgres::Error) -> ReconcileError {
    let message = db_error_message(e);

    match e.code() {
        _ if e.is_closed() => ReconcileError::Connectivity(message),
        None if is_transport_error(e) => ReconcileError::Connectivity(message),
        None => ReconcileError::Database(message),
        Some(code) => classify_sqlstate(code, message),
    }
}

/// Map a server-reported SQLSTATE onto the taxonomy.
///
/// A cancelled statement is what `statement_timeout` produces; outside a
/// unit it means the server did not answer in time.
pub fn classify_sqlstate(code: &SqlState, message: String) -> ReconcileError {
    if *code == SqlState::INSUFFICIENT_PRIVILEGE {
        error!(sqlstate = code.code(), "Permission denied: {}", message);
        return ReconcileError::Permission(message);
    }
    if *code == SqlState::QUERY_CANCELED
        || *code == SqlState::TOO_MANY_CONNECTIONS
        || *code == SqlState::INVALID_PASSWORD
        || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
        || is_session_fatal_sqlstate(code)
    {
        return ReconcileError::Connectivity(message);
    }
    ReconcileError::Database(message)
}

/// SQLSTATEs after which the session cannot be used any more
fn is_session_fatal_sqlstate(code: &SqlState) -> bool {
    *code == SqlState::ADMIN_SHUTDOWN
        || *code == SqlState::CRASH_SHUTDOWN
        || *code == SqlState::CANNOT_CONNECT_NOW
        || code.code().starts_with("08")
}

/// Errors raised below the protocol level: connecting, TLS, socket I/O,
/// connect timeouts. All of them carry an `io::Error` somewhere in their
/// source chain. Row decoding errors also lack a SQLSTATE but are not
/// connectivity problems.
fn is_transport_error(e: &tokio_postgres::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(inner) = source {
        if inner.is::<std::io::Error>() {
            return true;
        }
        source = inner.source();
    }
    false
}

/// Whether a driver error means the session itself is gone.
///
/// Such errors abort the run. Every other statement error, a statement
/// timeout included, is a unit failure: the session answers the next query.
pub fn is_session_failure(e: &tokio_postgres::Error) -> bool {
    if e.is_closed() {
        return true;
    }
    match e.code() {
        Some(code) => is_session_fatal_sqlstate(code),
        None => is_transport_error(e),
    }
}

/// Render the most useful message a driver error carries.
///
/// `tokio_postgres::Error`'s `Display` only says "db error"; the server's
/// message and detail live on the inner `DbError`.
pub fn db_error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => match db.detail() {
            Some(detail) => format!("{} ({}): {}", db.message(), db.code().code(), detail),
            None => format!("{} ({})", db.message(), db.code().code()),
        },
        None => e.to_string(),
    }
}

/// Result type alias used across the crate
pub type ReconcileResult<T> = Result<T, ReconcileError>;
