/// Query Result Module
///
/// This module provides the result of executing a statement: the schema, the
/// converted binds it ran with, and a cursor, exposed through a pluggable
/// formatter that shapes fetched rows.
///
/// Sequential fetches (`Fetch::Count`, `Fetch::Rest`, iteration) advance the
/// cursor's streaming index; positional fetches (`First`, `Last`, `All`) do
/// not.

use crate::core::db::cursor::Cursor;
use crate::core::db::schema::Schema;
use crate::core::db::statement::Statement;
use crate::core::{RdbiError, Result, Row, Value};
use crate::driver::Execution;
use crate::formatter::{FormatContext, Formatted, FormatterKind, ResultFormatter};
use crate::types::OutputTypeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Cursor shared between a result and the statement that produced it
pub type SharedCursor = Arc<Mutex<Box<dyn Cursor>>>;

/// How many rows a fetch should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fetch {
    /// Up to `n` rows from the streaming index
    Count(usize),
    /// The first row, regardless of the index
    First,
    /// The last row, regardless of the index
    Last,
    /// Every row, regardless of the index
    All,
    /// Every row from the index to the end
    Rest,
}

impl Default for Fetch {
    fn default() -> Self {
        Fetch::Count(1)
    }
}

impl From<usize> for Fetch {
    fn from(count: usize) -> Self {
        Fetch::Count(count)
    }
}

fn finished_error() -> RdbiError {
    RdbiError::InvalidState("result has been finished".to_string())
}

/// The outcome of executing a statement
pub struct QueryResult {
    statement: Option<Arc<Statement>>,
    binds: Vec<Value>,
    cursor: Option<SharedCursor>,
    schema: Option<Schema>,
    type_map: OutputTypeMap,
    formatter: Option<Box<dyn ResultFormatter>>,
    rewindable_result: bool,
}

impl QueryResult {
    /// Builds a result around a driver execution.
    ///
    /// A rewindable result buffers the cursor immediately so it can be
    /// rewound later.
    pub(crate) fn new(
        statement: Arc<Statement>,
        binds: Vec<Value>,
        execution: Execution,
        rewindable_result: bool,
    ) -> Result<Self> {
        let Execution {
            mut cursor,
            schema,
            type_map,
        } = execution;

        cursor.set_rewindable_result(rewindable_result);
        if rewindable_result {
            cursor.coerce_to_array()?;
        }

        Ok(QueryResult {
            statement: Some(statement),
            binds,
            cursor: Some(Arc::new(Mutex::new(cursor))),
            schema: Some(schema),
            type_map,
            formatter: Some(FormatterKind::Array.build()),
            rewindable_result,
        })
    }

    pub(crate) fn cursor_handle(&self) -> Option<SharedCursor> {
        self.cursor.clone()
    }

    fn cursor(&self) -> Result<MutexGuard<'_, Box<dyn Cursor>>> {
        self.cursor
            .as_ref()
            .ok_or_else(finished_error)?
            .lock()
            .map_err(|_| RdbiError::poisoned("cursor"))
    }

    /// Column metadata; `None` once finished
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Binds as the driver saw them, after input conversion
    pub fn binds(&self) -> &[Value] {
        &self.binds
    }

    /// The statement that produced this result; `None` once finished
    pub fn statement(&self) -> Option<&Arc<Statement>> {
        self.statement.as_ref()
    }

    pub fn type_map(&self) -> &OutputTypeMap {
        &self.type_map
    }

    pub fn rewindable_result(&self) -> bool {
        self.rewindable_result
    }

    pub fn is_finished(&self) -> bool {
        self.cursor.is_none()
    }

    /// Name of the active formatter
    pub fn formatter_name(&self) -> Option<&'static str> {
        self.formatter.as_ref().map(|f| f.name())
    }

    /// Switches to one of the bundled formatters. See [`QueryResult::as_formatter`].
    pub fn as_format(&mut self, kind: FormatterKind) -> Result<&mut Self> {
        self.as_formatter(kind.build())
    }

    /// Installs `formatter` and rewinds the cursor.
    ///
    /// The rewind is forced even when the result is not rewindable, which only
    /// succeeds if no rows have been discarded yet; the rewindable flag is
    /// restored afterwards.
    pub fn as_formatter(&mut self, formatter: Box<dyn ResultFormatter>) -> Result<&mut Self> {
        {
            let mut cursor = self.cursor()?;
            let rewindable = cursor.rewindable_result();
            cursor.set_rewindable_result(true);
            let rewound = cursor.rewind();
            cursor.set_rewindable_result(rewindable);
            rewound?;
        }

        debug!(formatter = formatter.name(), "switched result formatter");
        self.formatter = Some(formatter);
        Ok(self)
    }

    /// Fetches rows and shapes them with the active formatter.
    ///
    /// `First` and `Last` use the single-row path and yield `None` for an
    /// empty result; every other mode uses the multi-row path and always
    /// yields a value.
    pub fn fetch(&mut self, count: Fetch) -> Result<Option<Formatted>> {
        let rows = self.raw_fetch(count)?;
        let formatter = self.formatter.as_ref().ok_or_else(finished_error)?;
        let schema = self.schema.as_ref().ok_or_else(finished_error)?;
        let context = FormatContext::new(schema, &self.type_map);

        match count {
            Fetch::First | Fetch::Last => rows
                .into_iter()
                .next()
                .map(|row| formatter.format_single_row(row, &context))
                .transpose(),
            _ => formatter.format_multiple_rows(rows, &context).map(Some),
        }
    }

    /// Switches to `kind` and fetches in one step
    pub fn fetch_as(&mut self, count: Fetch, kind: FormatterKind) -> Result<Option<Formatted>> {
        self.as_format(kind)?;
        self.fetch(count)
    }

    /// Fetches unconverted rows straight from the cursor
    pub fn raw_fetch(&mut self, count: Fetch) -> Result<Vec<Row>> {
        let mut cursor = self.cursor()?;
        match count {
            Fetch::Count(n) => cursor.fetch(n),
            Fetch::First => Ok(cursor.first()?.into_iter().collect()),
            Fetch::Last => Ok(cursor.last()?.into_iter().collect()),
            Fetch::All => cursor.all(),
            Fetch::Rest => cursor.rest(),
        }
    }

    fn format_row(&self, row: Row) -> Result<Formatted> {
        let formatter = self.formatter.as_ref().ok_or_else(finished_error)?;
        let schema = self.schema.as_ref().ok_or_else(finished_error)?;
        formatter.format_single_row(row, &FormatContext::new(schema, &self.type_map))
    }

    /// Iterates the remaining rows one at a time, each shaped by the single-row
    /// formatter path.
    pub fn iter(&mut self) -> Rows<'_> {
        Rows {
            result: self,
            done: false,
        }
    }

    /// Resets the streaming index to 0
    ///
    /// # Errors
    ///
    /// `RdbiError::InvalidState` unless the result is rewindable.
    pub fn rewind(&mut self) -> Result<()> {
        self.cursor()?.rewind()
    }

    /// Buffers every remaining row so the result becomes rewindable
    pub fn coerce_to_array(&mut self) -> Result<()> {
        self.cursor()?.coerce_to_array()?;
        self.rewindable_result = true;
        Ok(())
    }

    pub fn result_count(&self) -> Result<usize> {
        self.cursor()?.result_count()
    }

    pub fn affected_count(&self) -> Result<u64> {
        Ok(self.cursor()?.affected_count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.cursor()?.is_empty()
    }

    pub fn has_data(&self) -> Result<bool> {
        Ok(!self.is_empty()?)
    }

    /// True once the streaming index has passed the last row
    pub fn is_eof(&self) -> Result<bool> {
        self.cursor()?.is_last_row()
    }

    pub fn has_more(&self) -> Result<bool> {
        Ok(!self.is_eof()?)
    }

    /// Current streaming index
    pub fn index(&self) -> Result<usize> {
        Ok(self.cursor()?.index())
    }

    /// Re-executes the statement with the stored binds and replaces the
    /// cursor, schema and type map; the active formatter is kept.
    pub fn reload(&mut self) -> Result<()> {
        let statement = self.statement.clone().ok_or_else(finished_error)?;
        {
            let mut cursor = self.cursor()?;
            if !cursor.is_finished() {
                cursor.finish()?;
            }
        }

        let mut fresh = statement.execute(&self.binds)?;
        self.cursor = fresh.cursor.take();
        self.schema = fresh.schema.take();
        self.type_map = std::mem::take(&mut fresh.type_map);
        self.rewindable_result = fresh.rewindable_result;
        debug!(statement = %statement.id(), "reloaded result");
        Ok(())
    }

    /// Finishes the statement and the cursor, then releases every field.
    ///
    /// Idempotent; any other operation on a finished result fails with
    /// `RdbiError::InvalidState`.
    pub fn finish(&mut self) -> Result<()> {
        let statement_result = match self.statement.take() {
            Some(statement) => statement.finish(),
            None => Ok(()),
        };

        let cursor_result = match self.cursor.take() {
            Some(cursor) => match cursor.lock() {
                Ok(mut cursor) if !cursor.is_finished() => cursor.finish(),
                Ok(_) => Ok(()),
                Err(_) => Err(RdbiError::poisoned("cursor")),
            },
            None => Ok(()),
        };

        self.binds.clear();
        self.schema = None;
        self.formatter = None;
        self.type_map = OutputTypeMap::empty();

        statement_result.and(cursor_result)
    }
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("statement", &self.statement.as_ref().map(|s| s.id()))
            .field("binds", &self.binds)
            .field("schema", &self.schema)
            .field("formatter", &self.formatter_name())
            .field("rewindable_result", &self.rewindable_result)
            .finish()
    }
}

/// Row-at-a-time iterator over a result; see [`QueryResult::iter`]
pub struct Rows<'a> {
    result: &'a mut QueryResult,
    done: bool,
}

impl Iterator for Rows<'_> {
    type Item = Result<Formatted>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let row = match self.result.raw_fetch(Fetch::Count(1)) {
            Ok(rows) => rows.into_iter().next(),
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        match row {
            Some(row) => Some(self.result.format_row(row)),
            None => {
                self.done = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formatter::Record;
    use crate::test_utils::{generate_data, mock_connection};

    fn int_row(a: i64, b: i64) -> Row {
        vec![Value::Integer(a), Value::Integer(b)]
    }

    #[test]
    fn test_fetch_advances_index() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        assert_eq!(res.index().unwrap(), 0);

        let rows = res.fetch(Fetch::Count(1)).unwrap().unwrap().into_rows().unwrap();
        assert_eq!(rows, vec![int_row(-5, 0)]);
        assert_eq!(res.index().unwrap(), 1);

        let rows = res.fetch(Fetch::Count(2)).unwrap().unwrap().into_rows().unwrap();
        assert_eq!(rows, vec![int_row(-4, 1), int_row(-3, 2)]);
        assert_eq!(res.index().unwrap(), 3);
    }

    #[test]
    fn test_positional_fetches_keep_index() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        res.fetch(Fetch::Count(2)).unwrap();

        let first = res.fetch(Fetch::First).unwrap().unwrap().into_row().unwrap();
        let last = res.fetch(Fetch::Last).unwrap().unwrap().into_row().unwrap();
        let all = res.fetch(Fetch::All).unwrap().unwrap().into_rows().unwrap();

        assert_eq!(first, int_row(-5, 0));
        assert_eq!(last, int_row(4, 9));
        assert_eq!(all.len(), 10);
        assert_eq!(res.index().unwrap(), 2);

        let rest = res.fetch(Fetch::Rest).unwrap().unwrap().into_rows().unwrap();
        assert_eq!(rest.len(), 8);
        assert!(res.is_eof().unwrap());
        assert!(!res.has_more().unwrap());
    }

    #[test]
    fn test_empty_result_first_is_none() {
        let (_driver, dbh) = mock_connection();

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        assert!(res.is_empty().unwrap());
        assert!(!res.has_data().unwrap());
        assert!(res.fetch(Fetch::First).unwrap().is_none());
        assert!(res.fetch(Fetch::Last).unwrap().is_none());
        assert_eq!(res.fetch(Fetch::All).unwrap(), Some(Formatted::Rows(vec![])));
    }

    #[test]
    fn test_rewind_requires_rewindable_result() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        res.fetch(Fetch::Count(1)).unwrap();
        assert!(matches!(res.rewind(), Err(RdbiError::InvalidState(_))));

        dbh.set_rewindable_result(true).unwrap();
        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        assert!(res.rewindable_result());
        res.fetch(Fetch::Count(3)).unwrap();
        res.rewind().unwrap();
        assert_eq!(res.index().unwrap(), 0);
    }

    #[test]
    fn test_as_format_rewinds_and_switches_formatter() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        res.fetch(Fetch::Count(1)).unwrap();
        assert_eq!(res.formatter_name(), Some("array"));

        res.as_format(FormatterKind::Struct).unwrap();
        assert_eq!(res.index().unwrap(), 0);
        assert_eq!(res.formatter_name(), Some("struct"));
        assert!(!res.rewindable_result());

        let record: Record = res.fetch(Fetch::First).unwrap().unwrap().into_record().unwrap();
        assert_eq!(record.get("column_1"), Some(&Value::Integer(-5)));
    }

    #[test]
    fn test_fetch_as_on_discarded_stream_fails() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());
        driver.set_streaming(true);

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        res.fetch(Fetch::Count(2)).unwrap();

        assert!(matches!(
            res.fetch_as(Fetch::Count(1), FormatterKind::Struct),
            Err(RdbiError::InvalidState(_))
        ));
        assert_eq!(res.formatter_name(), Some("array"));
    }

    #[test]
    fn test_iteration_yields_remaining_rows() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo", &[]).unwrap();
        res.fetch(Fetch::Count(7)).unwrap();

        let rows: Vec<Formatted> = res.iter().collect::<Result<_>>().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], Formatted::Row(int_row(2, 7)));
        assert_eq!(res.iter().count(), 0);
    }

    #[test]
    fn test_reload_re_executes_with_same_binds() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo where bar = ?", &[Value::Integer(1)]).unwrap();
        res.fetch(Fetch::Rest).unwrap();
        assert!(res.is_eof().unwrap());

        res.reload().unwrap();
        assert_eq!(res.index().unwrap(), 0);
        assert!(res.has_more().unwrap());

        let log = driver.log();
        assert_eq!(log.executions.len(), 2);
        assert_eq!(log.executions[0].1, log.executions[1].1);
    }

    #[test]
    fn test_finish_releases_everything() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let mut res = dbh.execute("select * from foo", &[Value::Integer(1)]).unwrap();
        let sth = res.statement().cloned().unwrap();

        res.finish().unwrap();
        assert!(res.is_finished());
        assert!(sth.is_finished());
        assert!(res.schema().is_none());
        assert!(res.binds().is_empty());
        assert!(res.statement().is_none());
        assert!(matches!(res.fetch(Fetch::Count(1)), Err(RdbiError::InvalidState(_))));
        assert!(matches!(res.result_count(), Err(RdbiError::InvalidState(_))));

        // finishing twice is harmless
        res.finish().unwrap();
    }

    #[test]
    fn test_affected_count_is_independent_of_rows() {
        let (driver, dbh) = mock_connection();
        driver.set_affected_count(4);

        let res = dbh.execute("delete from foo", &[]).unwrap();
        assert_eq!(res.affected_count().unwrap(), 4);
        assert_eq!(res.result_count().unwrap(), 0);
    }
}
