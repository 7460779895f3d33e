/// Schema Module
///
/// This module describes the shape of a result: an ordered list of columns
/// whose host types drive output type conversion. It also carries the SQLite
/// introspection helpers the bundled driver uses to describe tables.

use crate::core::{RdbiError, Result, Row};
use rusqlite::{Connection, Row as SqliteRow};
use serde::{Deserialize, Serialize};

/// Normalized host-side type of a column.
///
/// Database-native spellings (`VARCHAR(20)`, `timestamp with time zone`, ...)
/// collapse onto these tags; the output type map is keyed by them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostType {
    Integer,
    Float,
    Decimal,
    DateTime,
    Timestamp,
    Boolean,
    String,
    Blob,
    /// Anything without a dedicated conversion; the default filters apply
    Other(String),
}

impl Default for HostType {
    fn default() -> Self {
        HostType::Other(String::new())
    }
}

impl HostType {
    /// Maps a declared column type onto a host type.
    ///
    /// Follows SQLite's affinity rules for the common cases and recognizes
    /// the date, boolean and decimal spellings other engines use.
    pub fn from_declared_type(declared: &str) -> Self {
        let upper = declared.trim().to_uppercase();

        if upper.is_empty() {
            HostType::default()
        } else if upper.contains("BOOL") {
            HostType::Boolean
        } else if upper.contains("INT") {
            HostType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            HostType::String
        } else if upper.contains("BLOB") {
            HostType::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            HostType::Float
        } else if upper.contains("DECIMAL") || upper.contains("NUMERIC") {
            HostType::Decimal
        } else if upper.contains("TIMESTAMP") {
            HostType::Timestamp
        } else if upper.contains("DATE") || upper.contains("TIME") {
            HostType::DateTime
        } else {
            HostType::Other(declared.trim().to_lowercase())
        }
    }

    /// Canonical lowercase name of the tag
    pub fn as_str(&self) -> &str {
        match self {
            HostType::Integer => "integer",
            HostType::Float => "float",
            HostType::Decimal => "decimal",
            HostType::DateTime => "datetime",
            HostType::Timestamp => "timestamp",
            HostType::Boolean => "boolean",
            HostType::String => "string",
            HostType::Blob => "blob",
            HostType::Other(name) => name,
        }
    }
}

/// Metadata for one column of a result or table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name (field name for record-style formatters)
    pub name: String,
    /// Database-native type as declared (e.g. "VARCHAR(20)")
    pub db_type: String,
    /// Normalized host type; keys output conversion
    pub host_type: HostType,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    /// Whether the column allows NULL values
    pub nullable: bool,
    /// Free-form driver metadata
    pub metadata: Option<String>,
    /// Default value expression (if any)
    pub default: Option<String>,
    /// Owning table, when the driver knows it
    pub table: Option<String>,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
}

impl Column {
    /// Creates a nullable column whose declared type mirrors its host type.
    pub fn new(name: impl Into<String>, host_type: HostType) -> Self {
        Column {
            name: name.into(),
            db_type: host_type.as_str().to_string(),
            host_type,
            nullable: true,
            ..Column::default()
        }
    }

    pub fn with_db_type(mut self, db_type: impl Into<String>) -> Self {
        self.db_type = db_type.into();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn with_precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Creates a Column from a PRAGMA table_info result row
    fn from_pragma_row(row: &SqliteRow, table: &str) -> rusqlite::Result<Self> {
        let db_type: String = row.get(2)?;
        let notnull: bool = row.get(3)?;
        let pk: i64 = row.get(5)?;

        Ok(Column {
            name: row.get(1)?,
            host_type: HostType::from_declared_type(&db_type),
            db_type,
            precision: None,
            scale: None,
            nullable: !notnull && pk == 0,
            metadata: None,
            default: row.get(4)?,
            table: Some(table.to_string()),
            primary_key: pk > 0,
        })
    }
}

/// Ordered column metadata describing a result's row shape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Columns in row field order
    pub columns: Vec<Column>,
    /// Tables the result was drawn from, if known
    pub tables: Vec<String>,
    /// Optional hint describing the relation ("table", "view", ...)
    pub kind: Option<String>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Self {
        Schema {
            columns,
            tables: Vec::new(),
            kind: None,
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Position of the named column, if present
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Tables named in the schema, falling back to the columns' owning tables
    pub fn table_names(&self) -> Vec<String> {
        if !self.tables.is_empty() {
            return self.tables.clone();
        }

        let mut names: Vec<String> = Vec::new();
        for table in self.columns.iter().filter_map(|c| c.table.as_ref()) {
            if !names.contains(table) {
                names.push(table.clone());
            }
        }
        names
    }

    /// Verifies that a row has one field per column.
    pub fn check_arity(&self, row: &Row) -> Result<()> {
        if row.len() != self.columns.len() {
            return Err(RdbiError::Schema(format!(
                "row has {} fields but the schema describes {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        Ok(())
    }
}

/// Describes a single SQLite table via PRAGMA table_info.
///
/// Returns `None` when the table does not exist.
pub fn table_schema(conn: &Connection, table_name: &str) -> Result<Option<Schema>> {
    let mut stmt = conn.prepare(&format!(
        "PRAGMA table_info('{}')",
        table_name.replace('\'', "''")
    ))?;
    let column_iter = stmt.query_map([], |row| Column::from_pragma_row(row, table_name))?;

    let mut columns = Vec::new();
    for column_result in column_iter {
        columns.push(column_result?);
    }

    if columns.is_empty() {
        return Ok(None);
    }

    Ok(Some(
        Schema::new(columns)
            .with_tables(vec![table_name.to_string()])
            .with_kind("table"),
    ))
}

/// Describes every user-defined table of a SQLite database, ordered by name.
pub fn database_schema(conn: &Connection) -> Result<Vec<Schema>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type='table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut schemas = Vec::new();
    for name in names {
        if let Some(schema) = table_schema(conn, &name)? {
            schemas.push(schema);
        }
    }

    Ok(schemas)
}
