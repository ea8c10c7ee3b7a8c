//! Schema description model
//!
//! The shape shared by the live snapshot produced by the inspector and the
//! expected schema authored by developers: tables with ordered columns,
//! indexes and table-level constraints.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use validator::Validate;

use crate::expected::validate_identifier;

/// Column descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[serde(rename = "type")]
    #[validate(length(min = 1, message = "Column type is required"))]
    pub data_type: String,

    #[serde(default = "default_nullable")]
    pub nullable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

fn default_nullable() -> bool {
    true
}

impl ColumnDescriptor {
    /// Render the column as it appears in DDL
    pub fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.data_type);
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if let Some(ref default) = self.default {
            def.push_str(&format!(" DEFAULT {}", default));
        }
        def
    }
}

/// Index descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// Table-level constraint type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    Unique,
    ForeignKey,
}

impl ConstraintKind {
    /// Decode `pg_constraint.contype`
    pub fn from_pg_code(code: &str) -> Option<Self> {
        match code {
            "p" => Some(ConstraintKind::PrimaryKey),
            "u" => Some(ConstraintKind::Unique),
            "f" => Some(ConstraintKind::ForeignKey),
            _ => None,
        }
    }

    fn name_suffix(&self) -> &'static str {
        match self {
            ConstraintKind::PrimaryKey => "pkey",
            ConstraintKind::Unique => "key",
            ConstraintKind::ForeignKey => "fkey",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::PrimaryKey => write!(f, "PRIMARY KEY"),
            ConstraintKind::Unique => write!(f, "UNIQUE"),
            ConstraintKind::ForeignKey => write!(f, "FOREIGN KEY"),
        }
    }
}

/// Referenced side of a foreign key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyTarget {
    pub table: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<String>,
}

impl ForeignKeyTarget {
    /// ON DELETE action as PostgreSQL spells it; unset means `NO ACTION`
    pub fn on_delete_action(&self) -> String {
        self.on_delete
            .as_deref()
            .map(|action| action.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase())
            .unwrap_or_else(|| "NO ACTION".to_string())
    }
}

/// Constraint descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstraintDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ConstraintKind,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKeyTarget>,
}

impl ConstraintDescriptor {
    /// Constraint name, falling back to PostgreSQL's own naming convention
    pub fn resolved_name(&self, table: &str) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        match self.kind {
            ConstraintKind::PrimaryKey => format!("{}_pkey", table),
            _ => format!("{}_{}_{}", table, self.columns.join("_"), self.kind.name_suffix()),
        }
    }

    /// Structural match: same kind on the same columns (and, for foreign keys,
    /// the same referenced table and columns). Names are ignored because live
    /// constraints are often auto-named.
    pub fn matches(&self, other: &ConstraintDescriptor) -> bool {
        if self.kind != other.kind || self.columns != other.columns {
            return false;
        }
        match (&self.references, &other.references) {
            (Some(a), Some(b)) => a.table == b.table && a.columns == b.columns,
            (None, None) => true,
            _ => false,
        }
    }

    /// Human-readable form, e.g. `FOREIGN KEY (user_id) -> users(id)`
    pub fn describe(&self) -> String {
        match self.references {
            Some(ref target) => format!(
                "{} ({}) -> {}({})",
                self.kind,
                self.columns.join(", "),
                target.table,
                target.columns.join(", ")
            ),
            None => format!("{} ({})", self.kind, self.columns.join(", ")),
        }
    }
}

/// Table representation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[validate(length(min = 1, message = "At least one column is required"))]
    #[validate(nested)]
    pub columns: Vec<ColumnDescriptor>,

    #[serde(default)]
    pub indexes: Vec<IndexDescriptor>,

    #[serde(default)]
    pub constraints: Vec<ConstraintDescriptor>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn has_constraint(&self, wanted: &ConstraintDescriptor) -> bool {
        self.matching_constraint(wanted).is_some()
    }

    pub fn matching_constraint(&self, wanted: &ConstraintDescriptor) -> Option<&ConstraintDescriptor> {
        self.constraints.iter().find(|c| c.matches(wanted))
    }

    /// Tables this table references through foreign keys (excluding itself)
    pub fn referenced_tables(&self) -> impl Iterator<Item = &str> {
        self.constraints
            .iter()
            .filter_map(|c| c.references.as_ref())
            .map(|target| target.table.as_str())
            .filter(move |t| *t != self.name)
    }
}

/// Point-in-time description of the live schema.
///
/// Produced fresh by every inspection and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDescription {
    pub tables: BTreeMap<String, TableSchema>,
}

impl SchemaDescription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables.insert(table.name.clone(), table);
    }

    pub fn column_count(&self) -> usize {
        self.tables.values().map(|t| t.columns.len()).sum()
    }

    pub fn index_count(&self) -> usize {
        self.tables.values().map(|t| t.indexes.len()).sum()
    }

    pub fn constraint_count(&self) -> usize {
        self.tables.values().map(|t| t.constraints.len()).sum()
    }
}

/// Quote an identifier (table/column name) safely
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a schema-qualified name
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Normalize a type expression to the spelling `format_type` reports, so
/// expected and live types can be compared. Modifiers and array dimensions are
/// kept: `varchar(255)` becomes `character varying(255)`, `int[]` becomes
/// `integer[]`.
pub fn normalize_type(data_type: &str) -> String {
    let mut rest = data_type.trim().to_lowercase();

    let mut dimensions = 0;
    while let Some(stripped) = rest.strip_suffix("[]") {
        rest = stripped.trim_end().to_string();
        dimensions += 1;
    }

    let (base, modifier) = match (rest.find('('), rest.rfind(')')) {
        (Some(open), Some(close)) if open < close => {
            let modifier: String = rest[open + 1..close].chars().filter(|c| !c.is_whitespace()).collect();
            let base = format!("{} {}", &rest[..open], &rest[close + 1..]);
            (base, Some(modifier))
        }
        _ => (rest, None),
    };
    let base = base.split_whitespace().collect::<Vec<_>>().join(" ");

    let canonical = match base.as_str() {
        "serial" | "serial4" | "int" | "int4" => "integer",
        "bigserial" | "serial8" | "int8" => "bigint",
        "smallserial" | "serial2" | "int2" => "smallint",
        "varchar" => "character varying",
        "char" | "bpchar" => "character",
        "varbit" => "bit varying",
        "bool" => "boolean",
        "float8" => "double precision",
        "float4" => "real",
        "decimal" => "numeric",
        "timestamptz" | "timestamp with time zone" => "timestamp with time zone",
        "timestamp" | "timestamp without time zone" => "timestamp without time zone",
        "timetz" | "time with time zone" => "time with time zone",
        "time" | "time without time zone" => "time without time zone",
        other => other,
    };

    let mut normalized = match modifier {
        // format_type places precision right after the keyword: timestamp(3) with time zone
        Some(m) if canonical.starts_with("timestamp ") || canonical.starts_with("time ") => {
            let (keyword, zone) = canonical.split_once(' ').unwrap_or((canonical, ""));
            format!("{}({}) {}", keyword, m, zone)
        }
        Some(m) => format!("{}({})", canonical, m),
        None => canonical.to_string(),
    };
    for _ in 0..dimensions {
        normalized.push_str("[]");
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk(columns: &[&str], table: &str, target: &[&str]) -> ConstraintDescriptor {
        ConstraintDescriptor {
            name: None,
            kind: ConstraintKind::ForeignKey,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            references: Some(ForeignKeyTarget {
                table: table.to_string(),
                columns: target.iter().map(|c| c.to_string()).collect(),
                on_delete: None,
            }),
        }
    }

    #[test]
    fn test_column_definition() {
        let col = ColumnDescriptor {
            name: "created_at".to_string(),
            data_type: "timestamptz".to_string(),
            nullable: false,
            default: Some("now()".to_string()),
        };
        assert_eq!(col.definition(), "\"created_at\" timestamptz NOT NULL DEFAULT now()");
    }

    #[test]
    fn test_constraint_default_names() {
        let pk = ConstraintDescriptor {
            name: None,
            kind: ConstraintKind::PrimaryKey,
            columns: vec!["id".to_string()],
            references: None,
        };
        assert_eq!(pk.resolved_name("users"), "users_pkey");
        assert_eq!(fk(&["user_id"], "users", &["id"]).resolved_name("content"), "content_user_id_fkey");
    }

    #[test]
    fn test_constraint_matching_ignores_names() {
        let mut named = fk(&["user_id"], "users", &["id"]);
        named.name = Some("content_owner_fk".to_string());
        assert!(named.matches(&fk(&["user_id"], "users", &["id"])));
        assert!(!named.matches(&fk(&["user_id"], "accounts", &["id"])));
        assert!(!named.matches(&fk(&["author_id"], "users", &["id"])));
    }

    #[test]
    fn test_on_delete_action_defaults_to_no_action() {
        let mut constraint = fk(&["user_id"], "users", &["id"]);
        let target = constraint.references.as_mut().expect("foreign key target");
        assert_eq!(target.on_delete_action(), "NO ACTION");
        target.on_delete = Some("set  null".to_string());
        assert_eq!(target.on_delete_action(), "SET NULL");
    }

    #[test]
    fn test_referenced_tables_skip_self_references() {
        let table = TableSchema {
            name: "comments".to_string(),
            columns: vec![],
            indexes: vec![],
            constraints: vec![fk(&["parent_id"], "comments", &["id"]), fk(&["user_id"], "users", &["id"])],
        };
        let refs: Vec<&str> = table.referenced_tables().collect();
        assert_eq!(refs, vec!["users"]);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(qualified("public", "users"), "\"public\".\"users\"");
    }

    #[test]
    fn test_normalize_type_aliases() {
        assert_eq!(normalize_type("SERIAL"), "integer");
        assert_eq!(normalize_type("timestamptz"), "timestamp with time zone");
        assert_eq!(normalize_type("jsonb"), "jsonb");
        assert_eq!(normalize_type("double  precision"), "double precision");
    }

    #[test]
    fn test_normalize_type_keeps_modifiers_and_arrays() {
        assert_eq!(normalize_type("varchar(255)"), "character varying(255)");
        assert_eq!(normalize_type("numeric(10, 2)"), "numeric(10,2)");
        assert_eq!(normalize_type("numeric(10,2)"), normalize_type("decimal(10, 2)"));
        assert_eq!(normalize_type("timestamptz(3)"), "timestamp(3) with time zone");
        assert_eq!(normalize_type("timestamp(3) with time zone"), "timestamp(3) with time zone");
        assert_eq!(normalize_type("text[]"), "text[]");
        assert_eq!(normalize_type("int4[][]"), "integer[][]");
        assert_eq!(normalize_type("varchar(20)[]"), "character varying(20)[]");

        assert_ne!(normalize_type("varchar(255)"), normalize_type("varchar(100)"));
        assert_ne!(normalize_type("text[]"), normalize_type("integer[]"));
        assert_ne!(normalize_type("numeric(10,2)"), normalize_type("numeric(12,2)"));
    }
}
