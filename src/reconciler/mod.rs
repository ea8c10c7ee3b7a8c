//! Schema reconciliation
//!
//! Inspect, diff, apply under an advisory lock, then validate. Every unit is
//! additive and recorded in the ledger, so a run can be repeated safely.

pub mod diff;
pub mod report;
pub mod unit;
pub mod validate;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::expected::ExpectedSchema;
use crate::ledger::{LedgerDecision, LedgerEntry};
use crate::schema::SchemaDescription;
use crate::target::{SchemaTarget, UnitOutcome};

pub use diff::DiffEngine;
pub use report::{ReconciliationReport, UnitFailure, UnitReport, UnitState};
pub use unit::{ReconciliationUnit, UnitKind};
pub use validate::{DriftNote, ValidationOutcome, Violation};

/// Drives reconciliation against a [`SchemaTarget`]
pub struct SchemaReconciler<'a, T: SchemaTarget> {
    target: &'a T,
    lock: LockConfig,
}

impl<'a, T: SchemaTarget> SchemaReconciler<'a, T> {
    pub fn new(target: &'a T, lock: LockConfig) -> Self {
        Self { target, lock }
    }

    /// Snapshot the live schema
    pub async fn inspect(&self) -> ReconcileResult<SchemaDescription> {
        self.target.inspect().await
    }

    /// Ordered additive units needed to reach `expected` from `live`
    pub fn compute_diff(&self, expected: &ExpectedSchema, live: &SchemaDescription) -> Vec<ReconciliationUnit> {
        DiffEngine::diff(expected, live, self.target.schema())
    }

    /// Inspect and diff without changing anything
    pub async fn plan(&self, expected: &ExpectedSchema) -> ReconcileResult<Vec<ReconciliationUnit>> {
        let live = self.target.inspect().await?;
        Ok(self.compute_diff(expected, &live))
    }

    pub fn validate(&self, expected: &ExpectedSchema, live: &SchemaDescription) -> ValidationOutcome {
        validate::validate(expected, live)
    }

    /// Inspect and validate without changing anything
    pub async fn check(&self, expected: &ExpectedSchema) -> ReconcileResult<ValidationOutcome> {
        let live = self.target.inspect().await?;
        Ok(self.validate(expected, &live))
    }

    /// Latest ledger rows, newest first
    pub async fn history(&self, limit: i64) -> ReconcileResult<Vec<LedgerEntry>> {
        self.target.recent_entries(limit).await
    }

    /// Apply units in order under the advisory lock.
    ///
    /// Stops at the first failed unit; the failure is returned inside the
    /// report. Errors that leave the session unusable abort with `Err`.
    pub async fn apply(&self, units: &[ReconciliationUnit]) -> ReconcileResult<ReconciliationReport> {
        let run_id = Uuid::new_v4();
        self.acquire_lock().await?;

        let result = self.apply_locked(units, run_id).await;

        // Session-level locks also end with the session, so a failed release
        // cannot leave the lock held once the connection is gone.
        if let Err(e) = self.target.unlock(self.lock.key).await {
            warn!(key = self.lock.key, error = %e, "Failed to release advisory lock");
        } else {
            debug!(key = self.lock.key, "Advisory lock released");
        }

        let mut report = result?;
        report.finish();
        Ok(report)
    }

    /// Full pass: inspect, diff, apply, re-inspect, validate
    pub async fn run(&self, expected: &ExpectedSchema) -> ReconcileResult<ReconciliationReport> {
        let live = self.target.inspect().await?;
        info!(
            schema = self.target.schema(),
            tables = live.tables.len(),
            columns = live.column_count(),
            indexes = live.index_count(),
            constraints = live.constraint_count(),
            "Live schema inspected"
        );

        let units = self.compute_diff(expected, &live);
        let mut report = self.apply(&units).await?;
        report.expected_version = expected.version.clone();

        let live = self.target.inspect().await?;
        report.validation = Some(self.validate(expected, &live));
        report.finish();

        if report.safe_to_continue {
            info!(run_id = %report.run_id, "Schema reconciled");
        } else {
            error!(run_id = %report.run_id, "Schema is not safe to use");
        }
        Ok(report)
    }

    async fn acquire_lock(&self) -> ReconcileResult<()> {
        let attempts = self.lock.retry_attempts.max(1);
        for attempt in 1..=attempts {
            if self.target.try_lock(self.lock.key).await? {
                debug!(key = self.lock.key, attempt, "Advisory lock acquired");
                return Ok(());
            }
            if attempt < attempts {
                warn!(
                    key = self.lock.key,
                    attempt,
                    "Another reconciliation holds the lock, retrying in {:?}",
                    self.lock.retry_delay
                );
                tokio::time::sleep(self.lock.retry_delay).await;
            }
        }

        error!(key = self.lock.key, attempts, "Advisory lock unavailable");
        Err(ReconcileError::LockUnavailable {
            key: self.lock.key,
            attempts,
        })
    }

    async fn apply_locked(&self, units: &[ReconciliationUnit], run_id: Uuid) -> ReconcileResult<ReconciliationReport> {
        self.target.ensure_ledger().await?;

        let mut report = ReconciliationReport::new(run_id, self.target.schema());
        info!(%run_id, units = units.len(), "Applying reconciliation units");

        let mut pending = units.iter();
        while let Some(unit) = pending.next() {
            let entries = self.target.ledger_entries(&unit.identifier).await?;
            let decision = LedgerDecision::for_entries(&entries, &unit.checksum);

            match decision {
                LedgerDecision::Skip => {
                    debug!(identifier = %unit.identifier, "Already applied");
                    report.record(unit, UnitState::Skipped, Some(decision), None);
                    continue;
                }
                LedgerDecision::ApplyChanged => {
                    warn!(identifier = %unit.identifier, "Definition changed since last application")
                }
                LedgerDecision::RetryFailed => {
                    info!(identifier = %unit.identifier, "Retrying previously failed unit")
                }
                LedgerDecision::ApplyNew => {}
            }

            info!(identifier = %unit.identifier, "Applying: {}", unit);
            match self.target.apply_unit(unit, run_id).await? {
                UnitOutcome::Completed(entry) => {
                    report.record(unit, UnitState::Completed, Some(decision), Some(entry.id));
                }
                UnitOutcome::Failed { entry, message } => {
                    error!(
                        identifier = %unit.identifier,
                        sql = %unit.sql,
                        error = %message,
                        "Unit failed, stopping"
                    );
                    report.record_failure(unit, message, entry.id);
                    for skipped in pending.by_ref() {
                        report.record(skipped, UnitState::NotAttempted, None, None);
                    }
                    break;
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerStatus;
    use crate::schema::{ColumnDescriptor, TableSchema};
    use crate::target::memory::MemoryTarget;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio_test::assert_ok;

    fn lock() -> LockConfig {
        LockConfig {
            key: 42,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(1),
        }
    }

    fn bundled() -> ExpectedSchema {
        ExpectedSchema::from_json(include_str!("../../schema/expected.json")).expect("bundled schema is valid")
    }

    fn col(name: &str, data_type: &str) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            default: None,
        }
    }

    fn table(name: &str, columns: &[&str]) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: columns.iter().map(|c| col(c, "text")).collect(),
            indexes: vec![],
            constraints: vec![],
        }
    }

    fn states(report: &ReconciliationReport) -> Vec<(&str, UnitState)> {
        report.units.iter().map(|u| (u.identifier.as_str(), u.state)).collect()
    }

    #[tokio::test]
    async fn test_run_on_empty_database_reaches_expected_schema() {
        let target = MemoryTarget::new(SchemaDescription::new());
        let reconciler = SchemaReconciler::new(&target, lock());

        let report = assert_ok!(reconciler.run(&bundled()).await);

        assert!(report.safe_to_continue);
        assert_eq!(report.failure, None);
        assert_eq!(report.units[0].identifier, "create_table:users");
        assert_eq!(report.count(UnitState::Completed), report.units.len());
        assert_eq!(report.expected_version.as_deref(), Some("2024-06-01"));

        let state = target.state();
        assert!(state.ledger_ready);
        assert!(!state.lock_held);
        assert!(state.live.table("content").and_then(|t| t.column("script")).is_some());
    }

    #[tokio::test]
    async fn test_missing_script_column_is_added_once() {
        let mut live = SchemaDescription::new();
        live.insert(table("content", &["id", "title"]));
        let target = MemoryTarget::new(live);
        let reconciler = SchemaReconciler::new(&target, lock());
        let expected = ExpectedSchema {
            version: None,
            tables: vec![table("content", &["id", "title", "script"])],
        };

        let report = assert_ok!(reconciler.run(&expected).await);

        assert_eq!(states(&report), vec![("add_column:content.script", UnitState::Completed)]);
        assert_eq!(report.units[0].description, "add column script text nullable to content");
        let ledger = target.state().ledger;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].status, LedgerStatus::Completed);

        let again = assert_ok!(reconciler.run(&expected).await);
        assert!(again.units.is_empty());
        assert_eq!(target.state().ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let target = MemoryTarget::new(SchemaDescription::new());
        let reconciler = SchemaReconciler::new(&target, lock());
        let expected = bundled();

        assert_ok!(reconciler.run(&expected).await);
        let after_first = target.state();

        let report = assert_ok!(reconciler.run(&expected).await);
        let after_second = target.state();

        assert!(report.units.is_empty());
        assert!(report.safe_to_continue);
        assert_eq!(after_second.live, after_first.live);
        assert_eq!(after_second.ledger.len(), after_first.ledger.len());
        assert_eq!(after_second.executed, after_first.executed);
    }

    #[tokio::test]
    async fn test_reapplying_same_units_skips_them() {
        let target = MemoryTarget::new(SchemaDescription::new());
        let reconciler = SchemaReconciler::new(&target, lock());
        let units = reconciler.compute_diff(&bundled(), &SchemaDescription::new());

        assert_ok!(reconciler.apply(&units).await);
        let report = assert_ok!(reconciler.apply(&units).await);

        assert_eq!(report.count(UnitState::Skipped), units.len());
        assert_eq!(target.state().executed.len(), units.len());
    }

    #[tokio::test]
    async fn test_changed_definition_is_reapplied_with_new_ledger_row() {
        let mut live = SchemaDescription::new();
        live.insert(table("users", &["id"]));
        let target = MemoryTarget::new(live);
        let reconciler = SchemaReconciler::new(&target, lock());

        let narrow = ReconciliationUnit::new(
            "public",
            UnitKind::AddColumn {
                table: "users".to_string(),
                column: col("name", "varchar(100)"),
            },
        );
        let wide = ReconciliationUnit::new(
            "public",
            UnitKind::AddColumn {
                table: "users".to_string(),
                column: col("name", "varchar(255)"),
            },
        );

        assert_ok!(reconciler.apply(std::slice::from_ref(&narrow)).await);
        let report = assert_ok!(reconciler.apply(std::slice::from_ref(&wide)).await);

        assert_eq!(report.units[0].state, UnitState::Completed);
        assert!(report.units[0].changed);

        let ledger = target.state().ledger;
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger[0].checksum, narrow.checksum);
        assert_eq!(ledger[1].checksum, wide.checksum);
        assert!(ledger.iter().all(|e| e.identifier == "add_column:users.name"));
    }

    #[tokio::test]
    async fn test_stops_at_first_failed_unit() {
        let mut live = SchemaDescription::new();
        live.insert(table("content", &["id"]));
        let target = MemoryTarget::new(live);
        target.update(|state| {
            state.failing.insert("add_column:content.c3".to_string());
        });
        let reconciler = SchemaReconciler::new(&target, lock());
        let expected = ExpectedSchema {
            version: None,
            tables: vec![table("content", &["id", "c1", "c2", "c3", "c4", "c5"])],
        };

        let report = assert_ok!(reconciler.run(&expected).await);

        assert_eq!(
            states(&report),
            vec![
                ("add_column:content.c1", UnitState::Completed),
                ("add_column:content.c2", UnitState::Completed),
                ("add_column:content.c3", UnitState::Failed),
                ("add_column:content.c4", UnitState::NotAttempted),
                ("add_column:content.c5", UnitState::NotAttempted),
            ]
        );
        assert!(!report.safe_to_continue);
        assert_eq!(report.exit_code(), 1);

        let failure = report.failure.as_ref().expect("failure recorded");
        assert_eq!(failure.identifier, "add_column:content.c3");
        assert!(failure.sql.contains("\"c3\""));

        let state = target.state();
        assert_eq!(
            state.executed,
            vec!["add_column:content.c1", "add_column:content.c2", "add_column:content.c3"]
        );
        assert_eq!(state.ledger[2].status, LedgerStatus::Failed);
        assert!(state.live.table("content").and_then(|t| t.column("c3")).is_none());
        assert!(!state.lock_held);
    }

    #[tokio::test]
    async fn test_failed_unit_is_retried_on_next_run() {
        let mut live = SchemaDescription::new();
        live.insert(table("content", &["id"]));
        let target = MemoryTarget::new(live);
        target.update(|state| {
            state.failing.insert("add_column:content.script".to_string());
        });
        let reconciler = SchemaReconciler::new(&target, lock());
        let expected = ExpectedSchema {
            version: None,
            tables: vec![table("content", &["id", "script"])],
        };

        let first = assert_ok!(reconciler.run(&expected).await);
        assert!(!first.safe_to_continue);

        target.update(|state| state.failing.clear());
        let second = assert_ok!(reconciler.run(&expected).await);

        assert!(second.safe_to_continue);
        let statuses: Vec<LedgerStatus> = target.state().ledger.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![LedgerStatus::Failed, LedgerStatus::Completed]);
    }

    #[tokio::test]
    async fn test_validation_catches_manually_dropped_column() {
        let target = MemoryTarget::new(SchemaDescription::new());
        let reconciler = SchemaReconciler::new(&target, lock());
        let expected = bundled();
        assert_ok!(reconciler.run(&expected).await);

        target.update(|state| {
            if let Some(content) = state.live.tables.get_mut("content") {
                content.columns.retain(|c| c.name != "script");
            }
        });

        let outcome = assert_ok!(reconciler.check(&expected).await);
        assert!(!outcome.valid);
        assert_eq!(outcome.messages(), vec!["missing column content.script".to_string()]);
    }

    #[tokio::test]
    async fn test_ledger_skip_cannot_hide_a_dropped_column() {
        let mut live = SchemaDescription::new();
        live.insert(table("content", &["id"]));
        let target = MemoryTarget::new(live);
        let reconciler = SchemaReconciler::new(&target, lock());
        let expected = ExpectedSchema {
            version: None,
            tables: vec![table("content", &["id", "script"])],
        };
        assert_ok!(reconciler.run(&expected).await);

        target.update(|state| {
            if let Some(content) = state.live.tables.get_mut("content") {
                content.columns.retain(|c| c.name != "script");
            }
        });
        let report = assert_ok!(reconciler.run(&expected).await);

        assert_eq!(states(&report), vec![("add_column:content.script", UnitState::Skipped)]);
        assert!(!report.safe_to_continue);
        match report.to_error() {
            Some(ReconcileError::Validation(messages)) => {
                assert_eq!(messages, vec!["missing column content.script".to_string()])
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lock_unavailable_after_retries() {
        let target = MemoryTarget::new(SchemaDescription::new());
        target.update(|state| state.locked_elsewhere = true);
        let reconciler = SchemaReconciler::new(&target, lock());

        let err = reconciler.run(&bundled()).await.unwrap_err();

        assert!(matches!(err, ReconcileError::LockUnavailable { key: 42, attempts: 3 }));
        assert_eq!(err.exit_code(), 2);
        let state = target.state();
        assert_eq!(state.lock_attempts, 3);
        assert!(state.executed.is_empty());
        assert!(state.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_loss_aborts_and_releases_lock() {
        let target = MemoryTarget::new(SchemaDescription::new());
        target.update(|state| state.disconnect_at = Some("create_table:content".to_string()));
        let reconciler = SchemaReconciler::new(&target, lock());

        let err = reconciler.run(&bundled()).await.unwrap_err();

        assert!(matches!(err, ReconcileError::Connectivity(_)));
        let state = target.state();
        assert!(!state.lock_held);
        assert!(!state.executed.contains(&"create_table:content".to_string()));
    }

    #[tokio::test]
    async fn test_plan_does_not_touch_the_database() {
        let target = MemoryTarget::new(SchemaDescription::new());
        let reconciler = SchemaReconciler::new(&target, lock());

        let units = assert_ok!(reconciler.plan(&bundled()).await);

        assert!(!units.is_empty());
        assert!(units.iter().all(|u| !u.sql.to_uppercase().contains("DROP")));
        let state = target.state();
        assert!(state.executed.is_empty());
        assert_eq!(state.lock_attempts, 0);
        assert!(!state.ledger_ready);
    }

    #[tokio::test]
    async fn test_history_lists_newest_first() {
        let target = MemoryTarget::new(SchemaDescription::new());
        let reconciler = SchemaReconciler::new(&target, lock());
        assert_ok!(reconciler.run(&bundled()).await);

        let history = assert_ok!(reconciler.history(2).await);

        assert_eq!(history.len(), 2);
        assert!(history[0].id > history[1].id);
    }
}
