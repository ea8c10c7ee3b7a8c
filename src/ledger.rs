//! Reconciliation ledger
//!
//! The durable record of every unit application, successful or not. Rows are
//! only ever appended; a changed unit gets a new row rather than an update so
//! the history of what ran against a database is preserved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::error::{ReconcileError, ReconcileResult};
use crate::schema::{qualified, quote_ident};

/// Outcome recorded for a unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Completed,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Completed => "completed",
            LedgerStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(LedgerStatus::Completed),
            "failed" => Some(LedgerStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub identifier: String,
    pub checksum: String,
    pub sql_text: String,
    pub status: LedgerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub applied_at: DateTime<Utc>,
    pub run_id: Uuid,
}

impl LedgerEntry {
    /// Decode a row selected with [`LedgerQueries::COLUMNS`]
    pub fn from_row(row: &Row) -> ReconcileResult<Self> {
        let raw_status: String = row.try_get("status")?;
        let status = LedgerStatus::parse(&raw_status).ok_or_else(|| {
            ReconcileError::Database(format!("ledger row has unknown status '{}'", raw_status))
        })?;

        Ok(Self {
            id: row.try_get("id")?,
            identifier: row.try_get("identifier")?,
            checksum: row.try_get("checksum")?,
            sql_text: row.try_get("sql_text")?,
            status,
            error_message: row.try_get("error_message")?,
            applied_at: row.try_get("applied_at")?,
            run_id: row.try_get("run_id")?,
        })
    }
}

/// What to do with a unit given its ledger history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerDecision {
    /// A completed entry with the same checksum exists
    Skip,
    /// Never applied before
    ApplyNew,
    /// Applied before with different SQL; apply again and append a new row
    ApplyChanged,
    /// The last attempt with this checksum failed; a human re-invoked the run
    RetryFailed,
}

impl LedgerDecision {
    /// Decide from every ledger row recorded for one identifier
    pub fn for_entries(entries: &[LedgerEntry], checksum: &str) -> Self {
        if entries
            .iter()
            .any(|e| e.status == LedgerStatus::Completed && e.checksum == checksum)
        {
            return LedgerDecision::Skip;
        }

        if entries.is_empty() {
            LedgerDecision::ApplyNew
        } else if entries.iter().any(|e| e.checksum == checksum) {
            LedgerDecision::RetryFailed
        } else {
            LedgerDecision::ApplyChanged
        }
    }
}

/// SQL for the ledger table, rendered for a configured schema and table name
#[derive(Debug, Clone)]
pub struct LedgerQueries {
    schema: String,
    table: String,
}

impl LedgerQueries {
    pub const COLUMNS: &'static str =
        "id, identifier, checksum, sql_text, status, error_message, applied_at, run_id";

    pub fn new(schema: &str, table: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn target(&self) -> String {
        qualified(&self.schema, &self.table)
    }

    /// DDL creating the ledger if absent. The partial unique index guarantees
    /// at most one successful application per (identifier, checksum).
    pub fn create_table(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {target} (
                id BIGSERIAL PRIMARY KEY,
                identifier TEXT NOT NULL,
                checksum TEXT NOT NULL,
                sql_text TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('completed', 'failed')),
                error_message TEXT,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                run_id UUID NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {by_identifier} ON {target} (identifier);
            CREATE UNIQUE INDEX IF NOT EXISTS {one_success} ON {target} (identifier, checksum)
                WHERE status = 'completed';
            "#,
            target = self.target(),
            by_identifier = quote_ident(&format!("{}_identifier_idx", self.table)),
            one_success = quote_ident(&format!("{}_completed_uq", self.table)),
        )
    }

    pub fn select_by_identifier(&self) -> String {
        format!(
            "SELECT {} FROM {} WHERE identifier = $1 ORDER BY applied_at, id",
            Self::COLUMNS,
            self.target()
        )
    }

    pub fn insert(&self) -> String {
        format!(
            "INSERT INTO {} (identifier, checksum, sql_text, status, error_message, run_id) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {}",
            self.target(),
            Self::COLUMNS
        )
    }

    pub fn select_recent(&self) -> String {
        format!(
            "SELECT {} FROM {} ORDER BY applied_at DESC, id DESC LIMIT $1",
            Self::COLUMNS,
            self.target()
        )
    }
}
