/// Row Formatters
///
/// Formatters that keep rows as host values.

use super::{FormatContext, Formatted, ResultFormatter};
use crate::core::{Result, Row};

/// Rows as plain value lists
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayFormatter;

impl ResultFormatter for ArrayFormatter {
    fn name(&self) -> &'static str {
        "array"
    }

    fn format_single_row(&self, row: Row, context: &FormatContext<'_>) -> Result<Formatted> {
        Ok(Formatted::Row(context.convert_row(row)))
    }

    fn format_multiple_rows(&self, rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Formatted> {
        Ok(Formatted::Rows(
            rows.into_iter().map(|row| context.convert_row(row)).collect(),
        ))
    }
}

/// Rows as records whose fields are named after the schema's columns
#[derive(Debug, Clone, Copy, Default)]
pub struct StructFormatter;

impl ResultFormatter for StructFormatter {
    fn name(&self) -> &'static str {
        "struct"
    }

    fn format_single_row(&self, row: Row, context: &FormatContext<'_>) -> Result<Formatted> {
        let names = context.column_names();
        Ok(Formatted::Record(context.record(&names, row)?))
    }

    fn format_multiple_rows(&self, rows: Vec<Row>, context: &FormatContext<'_>) -> Result<Formatted> {
        let names = context.column_names();
        let records = rows
            .into_iter()
            .map(|row| context.record(&names, row))
            .collect::<Result<Vec<_>>>()?;
        Ok(Formatted::Records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::schema::{Column, HostType, Schema};
    use crate::core::{RdbiError, Value};
    use crate::types::OutputTypeMap;

    fn schema() -> Schema {
        Schema::new(vec![
            Column::new("id", HostType::Integer),
            Column::new("name", HostType::String),
        ])
    }

    #[test]
    fn test_array_converts_fields() {
        let schema = schema();
        let type_map = OutputTypeMap::output_defaults();
        let context = FormatContext::new(&schema, &type_map);

        let formatted = ArrayFormatter
            .format_single_row(vec![Value::from("1"), Value::from("one")], &context)
            .unwrap();
        assert_eq!(formatted, Formatted::Row(vec![Value::Integer(1), Value::from("one")]));

        let empty = ArrayFormatter.format_multiple_rows(vec![], &context).unwrap();
        assert_eq!(empty, Formatted::Rows(vec![]));
    }

    #[test]
    fn test_struct_records_share_names() {
        let schema = schema();
        let type_map = OutputTypeMap::output_defaults();
        let context = FormatContext::new(&schema, &type_map);

        let records = StructFormatter
            .format_multiple_rows(
                vec![
                    vec![Value::Integer(1), Value::from("one")],
                    vec![Value::Integer(2), Value::from("two")],
                ],
                &context,
            )
            .unwrap()
            .into_records()
            .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("name"), Some(&Value::from("two")));
        assert_eq!(records[0].columns(), records[1].columns());
    }

    #[test]
    fn test_struct_rejects_arity_mismatch() {
        let schema = schema();
        let type_map = OutputTypeMap::output_defaults();
        let context = FormatContext::new(&schema, &type_map);

        let result = StructFormatter.format_single_row(vec![Value::Integer(1)], &context);
        assert!(matches!(result, Err(RdbiError::Schema(_))));
    }
}
