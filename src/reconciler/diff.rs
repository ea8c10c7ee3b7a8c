//! Diff engine
//!
//! Compares the expected schema with a live description and produces the
//! ordered list of additive units that closes the gap. Anything present live
//! but absent from the expected schema is left alone.

use std::collections::HashSet;
use tracing::debug;

use crate::expected::ExpectedSchema;
use crate::reconciler::unit::{ReconciliationUnit, UnitKind};
use crate::schema::{ConstraintKind, SchemaDescription, TableSchema};

/// Constraint phases. Keys must exist before foreign keys can reference them.
const CONSTRAINT_ORDER: [ConstraintKind; 3] = [
    ConstraintKind::PrimaryKey,
    ConstraintKind::Unique,
    ConstraintKind::ForeignKey,
];

pub struct DiffEngine;

impl DiffEngine {
    /// Compute the ordered additive units for `schema`.
    ///
    /// Order: table creations (referenced tables first), then added columns,
    /// then indexes, then constraints (primary keys, unique, foreign keys).
    pub fn diff(expected: &ExpectedSchema, live: &SchemaDescription, schema: &str) -> Vec<ReconciliationUnit> {
        let ordered = dependency_order(expected);
        let mut units = Vec::new();

        // Missing tables
        for table in &ordered {
            if live.table(&table.name).is_none() {
                units.push(ReconciliationUnit::new(
                    schema,
                    UnitKind::CreateTable {
                        table: table.name.clone(),
                        columns: table.columns.clone(),
                    },
                ));
            }
        }

        // Missing columns on existing tables
        for table in &ordered {
            let Some(live_table) = live.table(&table.name) else {
                continue;
            };
            for column in &table.columns {
                if live_table.column(&column.name).is_none() {
                    units.push(ReconciliationUnit::new(
                        schema,
                        UnitKind::AddColumn {
                            table: table.name.clone(),
                            column: column.clone(),
                        },
                    ));
                }
            }
        }

        // Missing indexes
        for table in &ordered {
            let live_table = live.table(&table.name);
            for index in &table.indexes {
                if live_table.and_then(|t| t.index(&index.name)).is_none() {
                    units.push(ReconciliationUnit::new(
                        schema,
                        UnitKind::AddIndex {
                            table: table.name.clone(),
                            index: index.clone(),
                        },
                    ));
                }
            }
        }

        // Missing constraints
        for kind in CONSTRAINT_ORDER {
            for table in &ordered {
                let live_table = live.table(&table.name);
                for constraint in table.constraints.iter().filter(|c| c.kind == kind) {
                    let present = live_table.map(|t| t.has_constraint(constraint)).unwrap_or(false);
                    if !present {
                        units.push(ReconciliationUnit::new(
                            schema,
                            UnitKind::AddConstraint {
                                table: table.name.clone(),
                                constraint: constraint.clone(),
                            },
                        ));
                    }
                }
            }
        }

        debug!(
            units = units.len(),
            expected_tables = expected.tables.len(),
            live_tables = live.tables.len(),
            "Computed schema diff"
        );

        units
    }
}

/// Order expected tables so every table comes after the tables it references.
///
/// Ties keep definition order. A reference cycle cannot be satisfied by
/// ordering; the earliest remaining table is taken and the foreign keys,
/// which are applied after every table exists, close the cycle.
pub fn dependency_order(expected: &ExpectedSchema) -> Vec<&TableSchema> {
    let declared: HashSet<&str> = expected.tables.iter().map(|t| t.name.as_str()).collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&TableSchema> = expected.tables.iter().collect();
    let mut ordered = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|table| {
            table
                .referenced_tables()
                .filter(|r| declared.contains(r))
                .all(|r| placed.contains(r))
        });
        let next = remaining.remove(ready.unwrap_or(0));
        placed.insert(next.name.as_str());
        ordered.push(next);
    }

    ordered
}
