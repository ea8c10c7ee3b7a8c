//! Schema Introspection Module
//!
//! Reads the live schema into a [`SchemaDescription`]. Three typed metadata
//! queries (tables with columns, indexes, constraints) are decoded and
//! cross-checked immediately; nothing is written.

use std::collections::BTreeMap;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Client, Row};
use tracing::debug;

use crate::db::queries;
use crate::error::{ReconcileError, ReconcileResult};
use crate::schema::{
    ColumnDescriptor, ConstraintDescriptor, ConstraintKind, ForeignKeyTarget, IndexDescriptor, SchemaDescription,
    TableSchema,
};

/// Schema inspector for PostgreSQL
pub struct SchemaInspector;

impl SchemaInspector {
    /// Introspect the complete schema of one namespace
    pub async fn inspect(client: &Client, schema: &str) -> ReconcileResult<SchemaDescription> {
        let column_rows = client.query(queries::TABLES_AND_COLUMNS, &[&schema]).await?;
        let index_rows = client.query(queries::INDEXES, &[&schema]).await?;
        let constraint_rows = client.query(queries::CONSTRAINTS, &[&schema]).await?;

        let mut tables = Self::decode_tables(&column_rows)?;
        Self::attach_indexes(&mut tables, &index_rows)?;
        Self::attach_constraints(&mut tables, &constraint_rows)?;

        let description = SchemaDescription { tables };

        debug!(
            schema,
            tables = description.tables.len(),
            columns = description.column_count(),
            indexes = description.index_count(),
            constraints = description.constraint_count(),
            "Introspected live schema"
        );

        Ok(description)
    }

    fn decode_tables(rows: &[Row]) -> ReconcileResult<BTreeMap<String, TableSchema>> {
        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();

        for row in rows {
            let table_name: String = get(row, "table_name")?;
            let table = tables.entry(table_name.clone()).or_insert_with(|| TableSchema {
                name: table_name,
                columns: Vec::new(),
                indexes: Vec::new(),
                constraints: Vec::new(),
            });

            let Some(column_name) = get::<Option<String>>(row, "column_name")? else {
                continue;
            };
            let data_type: Option<String> = get(row, "data_type")?;
            let is_nullable: Option<bool> = get(row, "is_nullable")?;

            table.columns.push(ColumnDescriptor {
                name: column_name,
                data_type: data_type.ok_or_else(|| malformed("column without data type"))?,
                nullable: is_nullable.ok_or_else(|| malformed("column without nullability"))?,
                default: get(row, "column_default")?,
            });
        }

        Ok(tables)
    }

    fn attach_indexes(tables: &mut BTreeMap<String, TableSchema>, rows: &[Row]) -> ReconcileResult<()> {
        for row in rows {
            let table_name: String = get(row, "table_name")?;
            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| malformed(&format!("index on unknown table {}", table_name)))?;

            table.indexes.push(IndexDescriptor {
                name: get(row, "index_name")?,
                columns: get(row, "columns")?,
                unique: get(row, "is_unique")?,
            });
        }
        Ok(())
    }

    fn attach_constraints(tables: &mut BTreeMap<String, TableSchema>, rows: &[Row]) -> ReconcileResult<()> {
        for row in rows {
            let table_name: String = get(row, "table_name")?;
            let constraint_type: String = get(row, "constraint_type")?;
            let kind = ConstraintKind::from_pg_code(&constraint_type)
                .ok_or_else(|| malformed(&format!("unexpected constraint type '{}'", constraint_type)))?;

            let references = match kind {
                ConstraintKind::ForeignKey => {
                    let referenced_table: Option<String> = get(row, "referenced_table")?;
                    Some(ForeignKeyTarget {
                        table: referenced_table.ok_or_else(|| malformed("foreign key without referenced table"))?,
                        columns: get(row, "referenced_columns")?,
                        on_delete: get(row, "on_delete")?,
                    })
                }
                _ => None,
            };

            let table = tables
                .get_mut(&table_name)
                .ok_or_else(|| malformed(&format!("constraint on unknown table {}", table_name)))?;

            table.constraints.push(ConstraintDescriptor {
                name: Some(get(row, "constraint_name")?),
                kind,
                columns: get(row, "columns")?,
                references,
            });
        }
        Ok(())
    }
}

/// Typed column read that reports decoding problems as metadata errors
fn get<'a, T: FromSql<'a>>(row: &'a Row, column: &str) -> ReconcileResult<T> {
    row.try_get(column)
        .map_err(|e| ReconcileError::Database(format!("failed to decode metadata column {}: {}", column, e)))
}

fn malformed(what: &str) -> ReconcileError {
    ReconcileError::Database(format!("inconsistent catalog metadata: {}", what))
}
