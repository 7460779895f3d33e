/// Result Formatter Module
///
/// A formatter shapes rows fetched from a result. Every formatter exposes a
/// single-row path (used by `First`, `Last` and iteration) and a multi-row path
/// (used by counted and bulk fetches). Both paths run each field through the
/// result's output type map before shaping it.
///
/// Bundled formatters:
/// - **array**: rows as value lists
/// - **struct**: rows as records with named fields
/// - **csv**: delimited text, one line per row
/// - **yaml**: YAML mappings keyed by column name
/// - **json**: JSON objects keyed by column name

mod row;
mod text;

pub use row::{ArrayFormatter, StructFormatter};
pub use text::{CsvFormatter, JsonFormatter, YamlFormatter};

use crate::core::db::schema::Schema;
use crate::core::{RdbiError, Result, Row, Value};
use crate::types::{convert_out, OutputTypeMap};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::str::FromStr;
use std::sync::Arc;

/// Shapes fetched rows
pub trait ResultFormatter: Send {
    /// Short lowercase name of the formatter
    fn name(&self) -> &'static str;

    /// Shapes one row
    fn format_single_row(&self, row: Row, context: &FormatContext<'_>) -> Result<Formatted>;

    /// Shapes a batch of rows; an empty batch yields empty or neutral output
    fn format_multiple_rows(&self, rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Formatted>;
}

/// Schema and output conversions available while formatting
#[derive(Debug, Clone, Copy)]
pub struct FormatContext<'a> {
    schema: &'a Schema,
    type_map: &'a OutputTypeMap,
}

impl<'a> FormatContext<'a> {
    pub fn new(schema: &'a Schema, type_map: &'a OutputTypeMap) -> Self {
        FormatContext { schema, type_map }
    }

    pub fn schema(&self) -> &Schema {
        self.schema
    }

    pub fn type_map(&self) -> &OutputTypeMap {
        self.type_map
    }

    /// Converts each field using its column's host type.
    ///
    /// Fields beyond the schema go through the map's default list.
    pub fn convert_row(&self, row: Row) -> Row {
        row.into_iter()
            .enumerate()
            .map(|(index, value)| match self.schema.column(index) {
                Some(column) => convert_out(value, column, self.type_map),
                None => self.type_map.default_list().execute(value),
            })
            .collect()
    }

    /// Column names shared by every record built in this context
    pub fn column_names(&self) -> Arc<[String]> {
        self.schema.column_names().into()
    }

    /// Converts `row` and pairs it with `names`.
    ///
    /// # Errors
    ///
    /// `RdbiError::Schema` when the row's arity differs from the schema's.
    pub fn record(&self, names: &Arc<[String]>, row: Row) -> Result<Record> {
        self.schema.check_arity(&row)?;
        Record::new(Arc::clone(names), self.convert_row(row))
    }
}

/// A row whose fields are addressable by column name
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    columns: Arc<[String]>,
    values: Row,
}

impl Record {
    pub fn new(columns: Arc<[String]>, values: Row) -> Result<Self> {
        if columns.len() != values.len() {
            return Err(RdbiError::Schema(format!(
                "record has {} values for {} columns",
                values.len(),
                columns.len()
            )));
        }
        Ok(Record { columns, values })
    }

    /// Value of the named field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Row {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// (name, value) pairs in column order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Output of a formatter
#[derive(Debug, Clone, PartialEq)]
pub enum Formatted {
    Row(Row),
    Rows(Vec<Row>),
    Record(Record),
    Records(Vec<Record>),
    Text(String),
}

impl Formatted {
    pub fn into_row(self) -> Option<Row> {
        match self {
            Formatted::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Formatted::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Formatted::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            Formatted::Records(records) => Some(records),
            _ => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Formatted::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Formatted::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Selector for the bundled formatters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatterKind {
    Array,
    Struct,
    Csv { delimiter: char, headers: bool },
    Yaml,
    Json { pretty: bool },
}

impl FormatterKind {
    /// Comma-separated, no header line
    pub fn csv() -> Self {
        FormatterKind::Csv {
            delimiter: ',',
            headers: false,
        }
    }

    /// Compact JSON
    pub fn json() -> Self {
        FormatterKind::Json { pretty: false }
    }

    pub fn build(&self) -> Box<dyn ResultFormatter> {
        match *self {
            FormatterKind::Array => Box::new(ArrayFormatter),
            FormatterKind::Struct => Box::new(StructFormatter),
            FormatterKind::Csv { delimiter, headers } => Box::new(CsvFormatter::new(delimiter, headers)),
            FormatterKind::Yaml => Box::new(YamlFormatter),
            FormatterKind::Json { pretty } => Box::new(JsonFormatter::new(pretty)),
        }
    }
}

impl FromStr for FormatterKind {
    type Err = RdbiError;

    /// Parses a formatter name; csv and json get their default options.
    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_lowercase().as_str() {
            "array" => Ok(FormatterKind::Array),
            "struct" => Ok(FormatterKind::Struct),
            "csv" => Ok(FormatterKind::csv()),
            "yaml" => Ok(FormatterKind::Yaml),
            "json" => Ok(FormatterKind::json()),
            other => Err(RdbiError::Config(format!("unknown formatter '{}'", other))),
        }
    }
}
