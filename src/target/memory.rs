//! In-memory target for exercising the reconciler without a server

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

use super::{SchemaTarget, UnitOutcome};
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::{LedgerEntry, LedgerStatus};
use crate::reconciler::unit::{ReconciliationUnit, UnitKind};
use crate::schema::{SchemaDescription, TableSchema};

#[derive(Debug, Default, Clone)]
pub struct MemoryState {
    pub live: SchemaDescription,
    pub ledger: Vec<LedgerEntry>,
    pub ledger_ready: bool,
    /// Identifiers whose statement raises an error
    pub failing: HashSet<String>,
    /// Identifier at which the connection drops
    pub disconnect_at: Option<String>,
    /// Another session holds the lock
    pub locked_elsewhere: bool,
    pub lock_held: bool,
    pub lock_attempts: u32,
    /// Identifiers in the order their SQL was executed
    pub executed: Vec<String>,
}

pub struct MemoryTarget {
    schema: String,
    state: Mutex<MemoryState>,
}

impl MemoryTarget {
    pub fn new(live: SchemaDescription) -> Self {
        Self {
            schema: "public".to_string(),
            state: Mutex::new(MemoryState {
                live,
                ..MemoryState::default()
            }),
        }
    }

    pub fn state(&self) -> MemoryState {
        self.state.lock().expect("memory state poisoned").clone()
    }

    pub fn update<F: FnOnce(&mut MemoryState)>(&self, f: F) {
        f(&mut self.state.lock().expect("memory state poisoned"));
    }
}

fn record(state: &mut MemoryState, unit: &ReconciliationUnit, status: LedgerStatus, error: Option<String>, run_id: Uuid) -> LedgerEntry {
    let entry = LedgerEntry {
        id: state.ledger.len() as i64 + 1,
        identifier: unit.identifier.clone(),
        checksum: unit.checksum.clone(),
        sql_text: unit.sql.clone(),
        status,
        error_message: error,
        applied_at: Utc::now(),
        run_id,
    };
    state.ledger.push(entry.clone());
    entry
}

fn apply_kind(live: &mut SchemaDescription, kind: &UnitKind) -> Result<(), String> {
    match kind {
        UnitKind::CreateTable { table, columns } => {
            if live.table(table).is_none() {
                live.insert(TableSchema {
                    name: table.clone(),
                    columns: columns.clone(),
                    indexes: vec![],
                    constraints: vec![],
                });
            }
            Ok(())
        }
        UnitKind::AddColumn { table, column } => {
            let t = live.tables.get_mut(table).ok_or_else(|| format!("relation \"{}\" does not exist", table))?;
            if t.column(&column.name).is_none() {
                t.columns.push(column.clone());
            }
            Ok(())
        }
        UnitKind::AddIndex { table, index } => {
            let t = live.tables.get_mut(table).ok_or_else(|| format!("relation \"{}\" does not exist", table))?;
            if t.index(&index.name).is_none() {
                t.indexes.push(index.clone());
            }
            Ok(())
        }
        UnitKind::AddConstraint { table, constraint } => {
            let t = live.tables.get_mut(table).ok_or_else(|| format!("relation \"{}\" does not exist", table))?;
            let mut added = constraint.clone();
            added.name = Some(constraint.resolved_name(table));
            t.constraints.push(added);
            Ok(())
        }
    }
}

#[async_trait]
impl SchemaTarget for MemoryTarget {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn inspect(&self) -> ReconcileResult<SchemaDescription> {
        Ok(self.state.lock().expect("memory state poisoned").live.clone())
    }

    async fn try_lock(&self, _key: i64) -> ReconcileResult<bool> {
        let mut state = self.state.lock().expect("memory state poisoned");
        state.lock_attempts += 1;
        if state.locked_elsewhere {
            return Ok(false);
        }
        state.lock_held = true;
        Ok(true)
    }

    async fn unlock(&self, _key: i64) -> ReconcileResult<()> {
        self.state.lock().expect("memory state poisoned").lock_held = false;
        Ok(())
    }

    async fn ensure_ledger(&self) -> ReconcileResult<()> {
        self.state.lock().expect("memory state poisoned").ledger_ready = true;
        Ok(())
    }

    async fn ledger_entries(&self, identifier: &str) -> ReconcileResult<Vec<LedgerEntry>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.ledger.iter().filter(|e| e.identifier == identifier).cloned().collect())
    }

    async fn recent_entries(&self, limit: i64) -> ReconcileResult<Vec<LedgerEntry>> {
        let state = self.state.lock().expect("memory state poisoned");
        Ok(state.ledger.iter().rev().take(limit.max(0) as usize).cloned().collect())
    }

    async fn apply_unit(&self, unit: &ReconciliationUnit, run_id: Uuid) -> ReconcileResult<UnitOutcome> {
        let mut state = self.state.lock().expect("memory state poisoned");

        if state.disconnect_at.as_deref() == Some(unit.identifier.as_str()) {
            return Err(ReconcileError::Connectivity("connection closed".to_string()));
        }
        state.executed.push(unit.identifier.clone());

        let result = if state.failing.contains(&unit.identifier) {
            Err(format!("simulated failure for {} (42P07)", unit.identifier))
        } else {
            // Work on a copy so a failed unit leaves no trace, like a rollback.
            let mut live = state.live.clone();
            apply_kind(&mut live, &unit.kind).map(|()| live)
        };

        match result {
            Ok(live) => {
                state.live = live;
                let entry = record(&mut state, unit, LedgerStatus::Completed, None, run_id);
                Ok(UnitOutcome::Completed(entry))
            }
            Err(message) => {
                let entry = record(&mut state, unit, LedgerStatus::Failed, Some(message.clone()), run_id);
                Ok(UnitOutcome::Failed { entry, message })
            }
        }
    }
}
