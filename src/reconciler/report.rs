//! Reconciliation report
//!
//! The record of one run: what each unit did, the first failure (if any) and
//! the validation outcome. Rendered as text for operators or JSON for tools.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::error::ReconcileError;
use crate::ledger::LedgerDecision;
use crate::reconciler::unit::ReconciliationUnit;
use crate::reconciler::validate::ValidationOutcome;

/// Final state of a unit within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Skipped,
    Completed,
    Failed,
    NotAttempted,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnitState::Skipped => "skipped",
            UnitState::Completed => "completed",
            UnitState::Failed => "FAILED",
            UnitState::NotAttempted => "not attempted",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitReport {
    pub identifier: String,
    pub description: String,
    pub checksum: String,
    pub state: UnitState,
    /// Set when the unit was re-applied because its SQL changed
    pub changed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_id: Option<i64>,
}

/// First unit failure of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitFailure {
    pub identifier: String,
    pub sql: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub schema: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub units: Vec<UnitReport>,
    pub failure: Option<UnitFailure>,
    pub validation: Option<ValidationOutcome>,
    pub safe_to_continue: bool,
}

impl ReconciliationReport {
    pub fn new(run_id: Uuid, schema: &str) -> Self {
        Self {
            run_id,
            schema: schema.to_string(),
            expected_version: None,
            started_at: Utc::now(),
            finished_at: None,
            units: Vec::new(),
            failure: None,
            validation: None,
            safe_to_continue: false,
        }
    }

    pub(crate) fn record(
        &mut self,
        unit: &ReconciliationUnit,
        state: UnitState,
        decision: Option<LedgerDecision>,
        ledger_id: Option<i64>,
    ) {
        self.units.push(UnitReport {
            identifier: unit.identifier.clone(),
            description: unit.to_string(),
            checksum: unit.checksum.clone(),
            state,
            changed: decision == Some(LedgerDecision::ApplyChanged),
            ledger_id,
        });
    }

    pub(crate) fn record_failure(&mut self, unit: &ReconciliationUnit, message: String, ledger_id: i64) {
        self.record(unit, UnitState::Failed, None, Some(ledger_id));
        self.failure = Some(UnitFailure {
            identifier: unit.identifier.clone(),
            sql: unit.sql.clone(),
            message,
        });
    }

    /// Close the report. Safe only when no unit failed and validation, if it
    /// ran, passed.
    pub(crate) fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
        self.safe_to_continue = self.failure.is_none()
            && self.validation.as_ref().map(|v| v.valid).unwrap_or(true);
    }

    pub fn count(&self, state: UnitState) -> usize {
        self.units.iter().filter(|u| u.state == state).count()
    }

    /// Convert an unsafe report into the error that explains it
    pub fn to_error(&self) -> Option<ReconcileError> {
        if let Some(ref failure) = self.failure {
            return Some(ReconcileError::UnitApplication {
                identifier: failure.identifier.clone(),
                sql: failure.sql.clone(),
                message: failure.message.clone(),
            });
        }
        match self.validation {
            Some(ref validation) if !validation.valid => Some(ReconcileError::Validation(validation.messages())),
            _ => None,
        }
    }

    /// CLI exit status for this report
    pub fn exit_code(&self) -> i32 {
        self.to_error().map(|e| e.exit_code()).unwrap_or(0)
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Reconciliation run {} on schema {}", self.run_id, self.schema)?;
        if let Some(ref version) = self.expected_version {
            writeln!(f, "Expected schema version: {}", version)?;
        }

        if self.units.is_empty() {
            writeln!(f, "No changes required")?;
        }
        for unit in &self.units {
            let note = if unit.changed { " (definition changed)" } else { "" };
            writeln!(f, "  [{}] {}{}", unit.state, unit.description, note)?;
        }

        writeln!(
            f,
            "Applied: {}, skipped: {}, failed: {}, not attempted: {}",
            self.count(UnitState::Completed),
            self.count(UnitState::Skipped),
            self.count(UnitState::Failed),
            self.count(UnitState::NotAttempted)
        )?;

        if let Some(ref failure) = self.failure {
            writeln!(f, "First failure: {}", failure.identifier)?;
            writeln!(f, "  SQL: {}", failure.sql)?;
            writeln!(f, "  Error: {}", failure.message)?;
        }

        if let Some(ref validation) = self.validation {
            if validation.valid {
                writeln!(f, "Validation: passed")?;
            } else {
                writeln!(f, "Validation: {} violation(s)", validation.violations.len())?;
                for violation in &validation.violations {
                    writeln!(f, "  - {}", violation)?;
                }
            }
            for note in &validation.drift {
                writeln!(f, "  drift: {}", note)?;
            }
        }

        write!(
            f,
            "Safe to continue: {}",
            if self.safe_to_continue { "yes" } else { "NO" }
        )
    }
}
