//! SQL query constants
//!
//! Metadata queries used by the inspector and the session-level statements
//! used by the reconciler. Every `pg_catalog` value is cast to a plain
//! type so rows decode without domain-type surprises.

/// All ordinary and partitioned tables of a schema with their columns, one
/// row per column. Tables without columns yield a single row with NULL column
/// fields. Reads `pg_class` like the index and constraint queries, so every
/// table they report is listed here regardless of column privileges.
pub const TABLES_AND_COLUMNS: &str = r#"
    SELECT
        c.relname::text AS table_name,
        a.attname::text AS column_name,
        format_type(a.atttypid, a.atttypmod)::text AS data_type,
        NOT a.attnotnull AS is_nullable,
        pg_get_expr(d.adbin, d.adrelid)::text AS column_default,
        a.attnum::int4 AS ordinal_position
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    LEFT JOIN pg_attribute a
        ON a.attrelid = c.oid
        AND a.attnum > 0
        AND NOT a.attisdropped
    LEFT JOIN pg_attrdef d
        ON d.adrelid = c.oid
        AND d.adnum = a.attnum
    WHERE n.nspname::text = $1
        AND c.relkind IN ('r', 'p')
    ORDER BY c.relname, a.attnum
"#;

/// All indexes on base tables of a schema, columns in key order.
/// Expression indexes report only their plain columns.
pub const INDEXES: &str = r#"
    SELECT
        i.relname::text AS index_name,
        t.relname::text AS table_name,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        ix.indisunique AS is_unique
    FROM pg_index ix
    JOIN pg_class t ON t.oid = ix.indrelid
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    WHERE n.nspname::text = $1
        AND t.relkind IN ('r', 'p')
    ORDER BY t.relname, i.relname
"#;

/// Primary key, unique and foreign key constraints of a schema
pub const CONSTRAINTS: &str = r#"
    SELECT
        con.conname::text AS constraint_name,
        rel.relname::text AS table_name,
        con.contype::text AS constraint_type,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS columns,
        ref.relname::text AS referenced_table,
        ARRAY(
            SELECT a.attname::text
            FROM unnest(con.confkey) WITH ORDINALITY AS k(attnum, ord)
            JOIN pg_attribute a ON a.attrelid = con.confrelid AND a.attnum = k.attnum
            ORDER BY k.ord
        ) AS referenced_columns,
        CASE con.confdeltype
            WHEN 'c' THEN 'CASCADE'
            WHEN 'n' THEN 'SET NULL'
            WHEN 'd' THEN 'SET DEFAULT'
            WHEN 'r' THEN 'RESTRICT'
            WHEN 'a' THEN 'NO ACTION'
        END AS on_delete
    FROM pg_constraint con
    JOIN pg_class rel ON rel.oid = con.conrelid
    JOIN pg_namespace n ON n.oid = rel.relnamespace
    LEFT JOIN pg_class ref ON ref.oid = con.confrelid
    WHERE n.nspname::text = $1
        AND rel.relkind IN ('r', 'p')
        AND con.contype IN ('p', 'u', 'f')
    ORDER BY rel.relname, con.conname
"#;

/// Liveness check
pub const PING: &str = "SELECT 1";

/// Non-blocking session-level advisory lock attempt
pub const TRY_ADVISORY_LOCK: &str = "SELECT pg_try_advisory_lock($1)";

/// Release a session-level advisory lock
pub const ADVISORY_UNLOCK: &str = "SELECT pg_advisory_unlock($1)";
