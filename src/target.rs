//! Reconciliation target
//!
//! The port between the reconciler and a database. [`PostgresTarget`] is the
//! production adapter; it owns one session for the whole run because advisory
//! locks belong to the session that took them.

use async_trait::async_trait;
use deadpool_postgres::Object;
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::queries;
use crate::error::{db_error_message, is_session_failure, ReconcileResult};
use crate::introspection::SchemaInspector;
use crate::ledger::{LedgerEntry, LedgerQueries, LedgerStatus};
use crate::reconciler::unit::ReconciliationUnit;
use crate::schema::SchemaDescription;

#[cfg(test)]
pub mod memory;

/// Result of executing one unit
#[derive(Debug, Clone)]
pub enum UnitOutcome {
    /// The statement committed and a `completed` ledger row was written with it
    Completed(LedgerEntry),
    /// The statement was rolled back and a `failed` ledger row was written
    Failed { entry: LedgerEntry, message: String },
}

/// Everything the reconciler needs from a database
#[async_trait]
pub trait SchemaTarget: Send + Sync {
    /// Schema (namespace) being reconciled
    fn schema(&self) -> &str;

    /// Snapshot the live schema
    async fn inspect(&self) -> ReconcileResult<SchemaDescription>;

    /// Try once to take the run lock; `false` means another holder has it
    async fn try_lock(&self, key: i64) -> ReconcileResult<bool>;

    async fn unlock(&self, key: i64) -> ReconcileResult<()>;

    /// Create the ledger table if it is missing
    async fn ensure_ledger(&self) -> ReconcileResult<()>;

    /// Every ledger row recorded for an identifier, oldest first
    async fn ledger_entries(&self, identifier: &str) -> ReconcileResult<Vec<LedgerEntry>>;

    /// Most recent ledger rows, newest first
    async fn recent_entries(&self, limit: i64) -> ReconcileResult<Vec<LedgerEntry>>;

    /// Execute a unit in its own transaction and record the outcome.
    ///
    /// Statement errors come back as [`UnitOutcome::Failed`]; only errors that
    /// make the session unusable are returned as `Err`.
    async fn apply_unit(&self, unit: &ReconciliationUnit, run_id: Uuid) -> ReconcileResult<UnitOutcome>;
}

/// PostgreSQL adapter
pub struct PostgresTarget {
    client: Mutex<Object>,
    schema: String,
    ledger: LedgerQueries,
}

impl PostgresTarget {
    pub fn new(client: Object, schema: &str, ledger_table: &str) -> Self {
        Self {
            client: Mutex::new(client),
            schema: schema.to_string(),
            ledger: LedgerQueries::new(schema, ledger_table),
        }
    }

    async fn append(
        &self,
        client: &tokio_postgres::Client,
        unit: &ReconciliationUnit,
        status: LedgerStatus,
        error_message: Option<&str>,
        run_id: Uuid,
    ) -> ReconcileResult<LedgerEntry> {
        let row = client
            .query_one(
                self.ledger.insert().as_str(),
                &[
                    &unit.identifier,
                    &unit.checksum,
                    &unit.sql,
                    &status.as_str(),
                    &error_message,
                    &run_id,
                ],
            )
            .await?;
        LedgerEntry::from_row(&row)
    }
}

#[async_trait]
impl SchemaTarget for PostgresTarget {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn inspect(&self) -> ReconcileResult<SchemaDescription> {
        let client = self.client.lock().await;
        SchemaInspector::inspect(&client, &self.schema).await
    }

    async fn try_lock(&self, key: i64) -> ReconcileResult<bool> {
        let client = self.client.lock().await;
        let row = client.query_one(queries::TRY_ADVISORY_LOCK, &[&key]).await?;
        Ok(row.try_get(0)?)
    }

    async fn unlock(&self, key: i64) -> ReconcileResult<()> {
        let client = self.client.lock().await;
        let row = client.query_one(queries::ADVISORY_UNLOCK, &[&key]).await?;
        let released: bool = row.try_get(0)?;
        if !released {
            warn!(key, "Advisory lock was not held at release time");
        }
        Ok(())
    }

    async fn ensure_ledger(&self) -> ReconcileResult<()> {
        let client = self.client.lock().await;
        client.batch_execute(&self.ledger.create_table()).await?;
        debug!(table = self.ledger.table(), "Ledger table ready");
        Ok(())
    }

    async fn ledger_entries(&self, identifier: &str) -> ReconcileResult<Vec<LedgerEntry>> {
        let client = self.client.lock().await;
        let rows = client.query(self.ledger.select_by_identifier().as_str(), &[&identifier]).await?;
        rows.iter().map(LedgerEntry::from_row).collect()
    }

    async fn recent_entries(&self, limit: i64) -> ReconcileResult<Vec<LedgerEntry>> {
        let client = self.client.lock().await;
        let rows = match client.query(self.ledger.select_recent().as_str(), &[&limit]).await {
            Ok(rows) => rows,
            // Never reconciled: no ledger yet, so no history either.
            Err(e) if e.code() == Some(&SqlState::UNDEFINED_TABLE) => {
                debug!(table = self.ledger.table(), "Ledger table does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        rows.iter().map(LedgerEntry::from_row).collect()
    }

    async fn apply_unit(&self, unit: &ReconciliationUnit, run_id: Uuid) -> ReconcileResult<UnitOutcome> {
        let mut client = self.client.lock().await;
        let transaction = client.transaction().await?;

        match transaction.batch_execute(&unit.sql).await {
            Ok(()) => {
                let row = transaction
                    .query_one(
                        self.ledger.insert().as_str(),
                        &[
                            &unit.identifier,
                            &unit.checksum,
                            &unit.sql,
                            &LedgerStatus::Completed.as_str(),
                            &None::<String>,
                            &run_id,
                        ],
                    )
                    .await?;
                let entry = LedgerEntry::from_row(&row)?;
                transaction.commit().await?;
                Ok(UnitOutcome::Completed(entry))
            }
            Err(e) if is_session_failure(&e) => Err(e.into()),
            Err(e) => {
                let message = db_error_message(&e);
                transaction.rollback().await?;
                let entry = self
                    .append(&client, unit, LedgerStatus::Failed, Some(&message), run_id)
                    .await?;
                Ok(UnitOutcome::Failed { entry, message })
            }
        }
    }
}
