/// Text Formatters
///
/// Formatters that render rows as CSV, JSON or YAML text.

use super::{FormatContext, Formatted, Record, ResultFormatter};
use crate::core::{Result, Row, Value};

/// Delimited text; one line per row, each terminated by `\n`
#[derive(Debug, Clone, Copy)]
pub struct CsvFormatter {
    delimiter: char,
    headers: bool,
}

impl Default for CsvFormatter {
    fn default() -> Self {
        CsvFormatter::new(',', false)
    }
}

impl CsvFormatter {
    /// `headers` prefixes non-empty output with a line of column names
    pub fn new(delimiter: char, headers: bool) -> Self {
        CsvFormatter { delimiter, headers }
    }

    fn escape(&self, field: &str) -> String {
        let needs_quotes = field.contains(self.delimiter)
            || field.contains('"')
            || field.contains('\n')
            || field.contains('\r');

        if needs_quotes {
            format!("\"{}\"", field.replace('"', "\"\""))
        } else {
            field.to_string()
        }
    }

    fn push_line<'a, I>(&self, output: &mut String, fields: I)
    where
        I: IntoIterator<Item = &'a str>,
    {
        let line: Vec<String> = fields.into_iter().map(|f| self.escape(f)).collect();
        output.push_str(&line.join(&self.delimiter.to_string()));
        output.push('\n');
    }

    fn push_row(&self, output: &mut String, row: &[Value]) {
        let fields: Vec<String> = row.iter().map(Value::to_string).collect();
        self.push_line(output, fields.iter().map(String::as_str));
    }

    fn push_header(&self, output: &mut String, context: &FormatContext<'_>) {
        if self.headers {
            let names = context.schema().column_names();
            self.push_line(output, names.iter().map(String::as_str));
        }
    }
}

impl ResultFormatter for CsvFormatter {
    fn name(&self) -> &'static str {
        "csv"
    }

    fn format_single_row(&self, row: Row, context: &FormatContext<'_>) -> Result<Formatted> {
        let mut output = String::new();
        self.push_header(&mut output, context);
        self.push_row(&mut output, &context.convert_row(row));
        Ok(Formatted::Text(output))
    }

    fn format_multiple_rows(&self, rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Formatted> {
        let mut output = String::new();
        if rows.is_empty() {
            return Ok(Formatted::Text(output));
        }

        self.push_header(&mut output, context);
        for row in rows {
            self.push_row(&mut output, &context.convert_row(row));
        }
        Ok(Formatted::Text(output))
    }
}

fn records(rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Vec<Record>> {
    let names = context.column_names();
    rows.into_iter().map(|row| context.record(&names, row)).collect()
}

/// YAML documents keyed by column name
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlFormatter;

impl ResultFormatter for YamlFormatter {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn format_single_row(&self, row: Row, context: &FormatContext<'_>) -> Result<Formatted> {
        let record = context.record(&context.column_names(), row)?;
        Ok(Formatted::Text(serde_yaml::to_string(&record)?))
    }

    fn format_multiple_rows(&self, rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Formatted> {
        Ok(Formatted::Text(serde_yaml::to_string(&records(rows, context)?)?))
    }
}

/// JSON: an object per row, an array for several rows
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter {
    pretty: bool,
}

impl JsonFormatter {
    pub fn new(pretty: bool) -> Self {
        JsonFormatter { pretty }
    }

    fn render<T: serde::Serialize>(&self, value: &T) -> Result<String> {
        let text = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(text)
    }
}

impl ResultFormatter for JsonFormatter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn format_single_row(&self, row: Row, context: &FormatContext<'_>) -> Result<Formatted> {
        let record = context.record(&context.column_names(), row)?;
        Ok(Formatted::Text(self.render(&record)?))
    }

    fn format_multiple_rows(&self, rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Formatted> {
        Ok(Formatted::Text(self.render(&records(rows, context)?)?))
    }
}
