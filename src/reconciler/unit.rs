//! Reconciliation units
//!
//! A unit is one additive DDL statement plus the identity the ledger tracks
//! it by. Only the four additive kinds exist; there is no way to express a
//! drop, rename or type change.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::schema::{
    qualified, quote_ident, ColumnDescriptor, ConstraintDescriptor, ConstraintKind, IndexDescriptor,
};

/// The additive change a unit performs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnitKind {
    CreateTable {
        table: String,
        columns: Vec<ColumnDescriptor>,
    },
    AddColumn {
        table: String,
        column: ColumnDescriptor,
    },
    AddIndex {
        table: String,
        index: IndexDescriptor,
    },
    AddConstraint {
        table: String,
        constraint: ConstraintDescriptor,
    },
}

impl UnitKind {
    pub fn table(&self) -> &str {
        match self {
            UnitKind::CreateTable { table, .. }
            | UnitKind::AddColumn { table, .. }
            | UnitKind::AddIndex { table, .. }
            | UnitKind::AddConstraint { table, .. } => table,
        }
    }

    /// Short label used in identifiers and reports
    pub fn label(&self) -> &'static str {
        match self {
            UnitKind::CreateTable { .. } => "create_table",
            UnitKind::AddColumn { .. } => "add_column",
            UnitKind::AddIndex { .. } => "add_index",
            UnitKind::AddConstraint { .. } => "add_constraint",
        }
    }

    /// Stable identifier of the target object.
    ///
    /// It names *what* is being created, not *how*, so editing the definition
    /// (say, widening a type) keeps the identifier and changes the checksum.
    pub fn identifier(&self) -> String {
        match self {
            UnitKind::CreateTable { table, .. } => format!("create_table:{}", table),
            UnitKind::AddColumn { table, column } => format!("add_column:{}.{}", table, column.name),
            UnitKind::AddIndex { index, .. } => format!("add_index:{}", index.name),
            UnitKind::AddConstraint { table, constraint } => {
                format!("add_constraint:{}.{}", table, constraint.resolved_name(table))
            }
        }
    }

    /// Render the DDL statement for this change
    pub fn to_sql(&self, schema: &str) -> String {
        match self {
            UnitKind::CreateTable { table, columns } => create_table_sql(schema, table, columns),
            UnitKind::AddColumn { table, column } => add_column_sql(schema, table, column),
            UnitKind::AddIndex { table, index } => add_index_sql(schema, table, index),
            UnitKind::AddConstraint { table, constraint } => add_constraint_sql(schema, table, constraint),
        }
    }
}

/// One atomic additive schema change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationUnit {
    pub identifier: String,
    pub checksum: String,
    pub sql: String,
    #[serde(flatten)]
    pub kind: UnitKind,
}

impl ReconciliationUnit {
    pub fn new(schema: &str, kind: UnitKind) -> Self {
        let sql = kind.to_sql(schema);
        Self {
            identifier: kind.identifier(),
            checksum: checksum(&sql),
            sql,
            kind,
        }
    }
}

impl fmt::Display for ReconciliationUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            UnitKind::CreateTable { table, columns } => {
                write!(f, "create table {} with {} column(s)", table, columns.len())
            }
            UnitKind::AddColumn { table, column } => write!(
                f,
                "add column {} {} {} to {}",
                column.name,
                column.data_type,
                if column.nullable { "nullable" } else { "not null" },
                table
            ),
            UnitKind::AddIndex { table, index } => write!(
                f,
                "add {}index {} on {} ({})",
                if index.unique { "unique " } else { "" },
                index.name,
                table,
                index.columns.join(", ")
            ),
            UnitKind::AddConstraint { table, constraint } => {
                write!(f, "add constraint {} on {}", constraint.describe(), table)
            }
        }
    }
}

/// SHA-256 of the exact statement text, hex encoded
pub fn checksum(sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sql.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn create_table_sql(schema: &str, table: &str, columns: &[ColumnDescriptor]) -> String {
    let columns: Vec<String> = columns.iter().map(|col| format!("    {}", col.definition())).collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);",
        qualified(schema, table),
        columns.join(",\n")
    )
}

fn add_column_sql(schema: &str, table: &str, column: &ColumnDescriptor) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {};",
        qualified(schema, table),
        column.definition()
    )
}

fn add_index_sql(schema: &str, table: &str, index: &IndexDescriptor) -> String {
    let cols: Vec<String> = index.columns.iter().map(|c| quote_ident(c)).collect();
    format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name),
        qualified(schema, table),
        cols.join(", ")
    )
}

fn add_constraint_sql(schema: &str, table: &str, constraint: &ConstraintDescriptor) -> String {
    let cols: Vec<String> = constraint.columns.iter().map(|c| quote_ident(c)).collect();
    let mut sql = format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {} ({})",
        qualified(schema, table),
        quote_ident(&constraint.resolved_name(table)),
        constraint.kind,
        cols.join(", ")
    );

    if constraint.kind == ConstraintKind::ForeignKey {
        if let Some(ref target) = constraint.references {
            let target_cols: Vec<String> = target.columns.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(&format!(
                " REFERENCES {} ({})",
                qualified(schema, &target.table),
                target_cols.join(", ")
            ));
            if let Some(ref on_delete) = target.on_delete {
                sql.push_str(&format!(" ON DELETE {}", on_delete.to_uppercase()));
            }
        }
    }

    sql.push(';');
    sql
}
