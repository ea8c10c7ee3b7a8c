//! Post-apply validation
//!
//! Confirms every element of the expected schema exists live. Differences the
//! reconciler may not fix on its own (type changes, nullability, referential
//! actions, undeclared columns) are reported as drift and never fail validation.

use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::expected::ExpectedSchema;
use crate::schema::{normalize_type, SchemaDescription, TableSchema};

/// A required element that is absent from the live schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum Violation {
    MissingTable { table: String },
    MissingColumn { table: String, column: String },
    MissingIndex { table: String, index: String },
    MissingConstraint { table: String, constraint: String },
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingTable { table } => write!(f, "missing table {}", table),
            Violation::MissingColumn { table, column } => write!(f, "missing column {}.{}", table, column),
            Violation::MissingIndex { table, index } => write!(f, "missing index {} on {}", index, table),
            Violation::MissingConstraint { table, constraint } => {
                write!(f, "missing constraint {} on {}", constraint, table)
            }
        }
    }
}

/// Informational difference between expected and live definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftNote {
    /// `table.column` or `table.constraint`
    pub object: String,
    pub detail: String,
}

impl fmt::Display for DriftNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.object, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub valid: bool,
    pub violations: Vec<Violation>,
    pub drift: Vec<DriftNote>,
}

impl ValidationOutcome {
    /// Violations rendered as messages
    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(ToString::to_string).collect()
    }
}

/// Check the live schema against the expected one
pub fn validate(expected: &ExpectedSchema, live: &SchemaDescription) -> ValidationOutcome {
    let mut violations = Vec::new();
    let mut drift = Vec::new();

    for table in &expected.tables {
        match live.table(&table.name) {
            // The table's own elements are implied by its absence.
            None => violations.push(Violation::MissingTable {
                table: table.name.clone(),
            }),
            Some(live_table) => check_table(table, live_table, &mut violations, &mut drift),
        }
    }

    for violation in &violations {
        warn!(%violation, "Validation violation");
    }
    for note in &drift {
        warn!(object = %note.object, detail = %note.detail, "Schema drift");
    }

    let outcome = ValidationOutcome {
        valid: violations.is_empty(),
        violations,
        drift,
    };
    info!(
        valid = outcome.valid,
        violations = outcome.violations.len(),
        drift = outcome.drift.len(),
        "Validation finished"
    );
    outcome
}

fn check_table(
    expected: &TableSchema,
    live: &TableSchema,
    violations: &mut Vec<Violation>,
    drift: &mut Vec<DriftNote>,
) {
    for column in &expected.columns {
        let Some(live_column) = live.column(&column.name) else {
            violations.push(Violation::MissingColumn {
                table: expected.name.clone(),
                column: column.name.clone(),
            });
            continue;
        };

        let object = format!("{}.{}", expected.name, column.name);
        let wanted = normalize_type(&column.data_type);
        let found = normalize_type(&live_column.data_type);
        if wanted != found {
            drift.push(DriftNote {
                object: object.clone(),
                detail: format!("type is {} live, {} expected", found, wanted),
            });
        }
        if column.nullable != live_column.nullable {
            drift.push(DriftNote {
                object,
                detail: format!(
                    "live column is {}, expected {}",
                    nullability(live_column.nullable),
                    nullability(column.nullable)
                ),
            });
        }
    }

    for live_column in &live.columns {
        if expected.column(&live_column.name).is_none() {
            drift.push(DriftNote {
                object: format!("{}.{}", expected.name, live_column.name),
                detail: "column exists live but is not declared".to_string(),
            });
        }
    }

    for index in &expected.indexes {
        if live.index(&index.name).is_none() {
            violations.push(Violation::MissingIndex {
                table: expected.name.clone(),
                index: index.name.clone(),
            });
        }
    }

    for constraint in &expected.constraints {
        let Some(live_constraint) = live.matching_constraint(constraint) else {
            violations.push(Violation::MissingConstraint {
                table: expected.name.clone(),
                constraint: constraint.describe(),
            });
            continue;
        };

        if let (Some(wanted), Some(found)) = (&constraint.references, &live_constraint.references) {
            let (wanted, found) = (wanted.on_delete_action(), found.on_delete_action());
            if wanted != found {
                drift.push(DriftNote {
                    object: format!("{}.{}", expected.name, live_constraint.resolved_name(&expected.name)),
                    detail: format!("ON DELETE is {} live, {} expected", found, wanted),
                });
            }
        }
    }
}

fn nullability(nullable: bool) -> &'static str {
    if nullable {
        "nullable"
    } else {
        "not null"
    }
}
