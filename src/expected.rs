//! Expected schema definition
//!
//! The version-controlled description of what the application needs, loaded
//! from JSON and validated before any database work starts. Type and default
//! expressions are spliced into DDL verbatim, so they are restricted here.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::schema::{ConstraintKind, SchemaDescription, TableSchema};

/// PostgreSQL identifiers must start with a letter or underscore and contain
/// only letters, digits, underscores, and dollar signs
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_$]{0,62}$").expect("static regex"));

/// Type names with optional modifiers and array suffix,
/// e.g. `varchar(255)`, `numeric(10, 2)`, `timestamp with time zone`, `text[]`
static TYPE_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_ ]*(\(\s*\d+\s*(,\s*\d+\s*)?\))?(\[\])?$").expect("static regex")
});

const REFERENTIAL_ACTIONS: [&str; 5] = ["CASCADE", "SET NULL", "SET DEFAULT", "RESTRICT", "NO ACTION"];

#[derive(Error, Debug)]
pub enum ExpectedSchemaError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse expected schema: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid expected schema: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Whether `name` is a plain, unquoted-safe PostgreSQL identifier
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Validate PostgreSQL identifier
pub fn validate_identifier(name: &str) -> Result<(), ValidationError> {
    if !is_valid_identifier(name) {
        let mut err = ValidationError::new("invalid_identifier");
        err.message = Some(
            format!(
                "Invalid identifier '{}'. Must start with a letter or underscore, contain only letters, digits, underscores, and be at most 63 characters.",
                name
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// The schema the application requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedSchema {
    /// Free-form label for the definition, e.g. a date or release tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[validate(nested)]
    pub tables: Vec<TableSchema>,
}

impl ExpectedSchema {
    /// Load and validate an expected schema from a JSON file
    pub fn load(path: &Path) -> Result<Self, ExpectedSchemaError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ExpectedSchemaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate an expected schema from JSON text
    pub fn from_json(raw: &str) -> Result<Self, ExpectedSchemaError> {
        let schema: ExpectedSchema = serde_json::from_str(raw)?;
        schema.check()?;
        Ok(schema)
    }

    /// Run field validation plus the cross-reference checks the derive
    /// cannot express
    pub fn check(&self) -> Result<(), ExpectedSchemaError> {
        let mut problems = Vec::new();

        if let Err(errors) = self.validate() {
            problems.push(errors.to_string());
        }

        let mut seen_tables = HashSet::new();
        let mut seen_indexes = HashSet::new();
        let mut seen_constraints = HashSet::new();

        for table in &self.tables {
            if !seen_tables.insert(table.name.as_str()) {
                problems.push(format!("table {} is declared more than once", table.name));
            }
            check_table(self, table, &mut seen_indexes, &mut seen_constraints, &mut problems);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ExpectedSchemaError::Invalid(problems))
        }
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// View the expected schema with the same shape as a live description
    pub fn to_description(&self) -> SchemaDescription {
        let mut description = SchemaDescription::new();
        for table in &self.tables {
            description.insert(table.clone());
        }
        description
    }
}

fn check_table(
    schema: &ExpectedSchema,
    table: &TableSchema,
    seen_indexes: &mut HashSet<String>,
    seen_constraints: &mut HashSet<String>,
    problems: &mut Vec<String>,
) {
    let mut columns = HashSet::new();
    for column in &table.columns {
        if !columns.insert(column.name.as_str()) {
            problems.push(format!("column {}.{} is declared more than once", table.name, column.name));
        }
        if !TYPE_EXPR.is_match(column.data_type.trim()) {
            problems.push(format!(
                "column {}.{} has an unsupported type expression '{}'",
                table.name, column.name, column.data_type
            ));
        }
        if let Some(ref default) = column.default {
            if default.trim().is_empty() || default.contains(';') || default.contains("--") {
                problems.push(format!(
                    "column {}.{} has an unsafe default expression '{}'",
                    table.name, column.name, default
                ));
            }
        }
    }

    let check_columns = |what: &str, names: &[String], problems: &mut Vec<String>| {
        if names.is_empty() {
            problems.push(format!("{} on {} has no columns", what, table.name));
        }
        for name in names {
            if !columns.contains(name.as_str()) {
                problems.push(format!("{} on {} references unknown column {}", what, table.name, name));
            }
        }
    };

    for index in &table.indexes {
        if !is_valid_identifier(&index.name) {
            problems.push(format!("index name '{}' is not a valid identifier", index.name));
        }
        if !seen_indexes.insert(index.name.clone()) {
            problems.push(format!("index {} is declared more than once", index.name));
        }
        check_columns(&format!("index {}", index.name), &index.columns, problems);
    }

    let primary_keys = table
        .constraints
        .iter()
        .filter(|c| c.kind == ConstraintKind::PrimaryKey)
        .count();
    if primary_keys > 1 {
        problems.push(format!("table {} declares {} primary keys", table.name, primary_keys));
    }

    for constraint in &table.constraints {
        let name = constraint.resolved_name(&table.name);
        if !is_valid_identifier(&name) {
            problems.push(format!("constraint name '{}' is not a valid identifier", name));
        }
        if !seen_constraints.insert(name.clone()) {
            problems.push(format!("constraint {} is declared more than once", name));
        }
        check_columns(&format!("constraint {}", name), &constraint.columns, problems);

        match (constraint.kind, &constraint.references) {
            (ConstraintKind::ForeignKey, None) => {
                problems.push(format!("foreign key {} has no referenced table", name));
            }
            (ConstraintKind::ForeignKey, Some(target)) => {
                if !is_valid_identifier(&target.table) {
                    problems.push(format!("foreign key {} references invalid table '{}'", name, target.table));
                }
                if target.columns.len() != constraint.columns.len() {
                    problems.push(format!(
                        "foreign key {} has {} column(s) but references {}",
                        name,
                        constraint.columns.len(),
                        target.columns.len()
                    ));
                }
                if let Some(referenced) = schema.table(&target.table) {
                    for col in &target.columns {
                        if referenced.column(col).is_none() {
                            problems.push(format!(
                                "foreign key {} references unknown column {}.{}",
                                name, target.table, col
                            ));
                        }
                    }
                }
                if let Some(ref action) = target.on_delete {
                    if !REFERENTIAL_ACTIONS.contains(&action.to_uppercase().as_str()) {
                        problems.push(format!("foreign key {} has unknown ON DELETE action '{}'", name, action));
                    }
                }
            }
            (_, Some(_)) => {
                problems.push(format!("{} constraint {} cannot reference another table", constraint.kind, name));
            }
            (_, None) => {}
        }
    }
}
