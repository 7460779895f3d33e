/// Cursor Module
///
/// A cursor is the row source a driver hands back from an execution. It keeps
/// a streaming index that sequential fetches advance, while positional reads
/// (`first`, `last`, `all`, `get`) leave it alone.
///
/// Two implementations are provided:
/// - [`ArrayCursor`] for drivers that materialize the whole result up front.
/// - [`StreamCursor`] for drivers that produce rows lazily. Unless it is made
///   rewindable, it forgets rows once they have been consumed.
///
/// Rows are cloned on the way out so callers never alias cursor buffers.

use crate::core::{RdbiError, Result, Row};

/// Abstract row source
pub trait Cursor: Send {
    /// Returns the next row, advancing the index by one
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Returns up to `count` rows from the index and advances past them
    fn fetch(&mut self, count: usize) -> Result<Vec<Row>>;

    /// First row of the result, regardless of the index
    fn first(&mut self) -> Result<Option<Row>>;

    /// Last row of the result, regardless of the index
    fn last(&mut self) -> Result<Option<Row>>;

    /// Rows from the index to the end; the index moves to the end
    fn rest(&mut self) -> Result<Vec<Row>>;

    /// Every row, regardless of the index
    fn all(&mut self) -> Result<Vec<Row>>;

    /// Row at an absolute position
    fn get(&mut self, index: usize) -> Result<Option<Row>>;

    /// Resets the index to 0; fails unless the cursor is rewindable
    fn rewind(&mut self) -> Result<()>;

    fn is_empty(&mut self) -> Result<bool>;

    /// Number of rows in the result
    fn result_count(&mut self) -> Result<usize>;

    /// Rows touched by a DML statement, independent of `result_count`
    fn affected_count(&self) -> u64;

    /// True once the index has passed the last row
    fn is_last_row(&mut self) -> Result<bool>;

    /// Current streaming index
    fn index(&self) -> usize;

    fn rewindable_result(&self) -> bool;

    fn set_rewindable_result(&mut self, rewindable: bool);

    /// Buffers the remaining rows and marks the cursor rewindable
    fn coerce_to_array(&mut self) -> Result<()>;

    /// Releases driver resources; later calls fail with `InvalidState`
    fn finish(&mut self) -> Result<()>;

    fn is_finished(&self) -> bool;
}

fn finished_error() -> RdbiError {
    RdbiError::InvalidState("cursor has been finished".to_string())
}

fn not_rewindable_error() -> RdbiError {
    RdbiError::InvalidState("result is not rewindable".to_string())
}

/// Cursor over a fully materialized result
#[derive(Debug, Clone)]
pub struct ArrayCursor {
    rows: Vec<Row>,
    index: usize,
    affected_count: u64,
    rewindable: bool,
    finished: bool,
}

impl ArrayCursor {
    pub fn new(rows: Vec<Row>) -> Self {
        ArrayCursor {
            rows,
            index: 0,
            affected_count: 0,
            rewindable: false,
            finished: false,
        }
    }

    pub fn with_affected_count(mut self, affected_count: u64) -> Self {
        self.affected_count = affected_count;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(finished_error());
        }
        Ok(())
    }
}

impl Cursor for ArrayCursor {
    fn next_row(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        let row = self.rows.get(self.index).cloned();
        if row.is_some() {
            self.index += 1;
        }
        Ok(row)
    }

    fn fetch(&mut self, count: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let start = self.index.min(self.rows.len());
        let end = self.index.saturating_add(count).min(self.rows.len());
        self.index = end.max(self.index);
        Ok(self.rows[start..end].to_vec())
    }

    fn first(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        Ok(self.rows.first().cloned())
    }

    fn last(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        Ok(self.rows.last().cloned())
    }

    fn rest(&mut self) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let start = self.index.min(self.rows.len());
        self.index = self.rows.len();
        Ok(self.rows[start..].to_vec())
    }

    fn all(&mut self) -> Result<Vec<Row>> {
        self.ensure_open()?;
        Ok(self.rows.clone())
    }

    fn get(&mut self, index: usize) -> Result<Option<Row>> {
        self.ensure_open()?;
        Ok(self.rows.get(index).cloned())
    }

    fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.rewindable {
            return Err(not_rewindable_error());
        }
        self.index = 0;
        Ok(())
    }

    fn is_empty(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.rows.is_empty())
    }

    fn result_count(&mut self) -> Result<usize> {
        self.ensure_open()?;
        Ok(self.rows.len())
    }

    fn affected_count(&self) -> u64 {
        self.affected_count
    }

    fn is_last_row(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.index >= self.rows.len())
    }

    fn index(&self) -> usize {
        self.index
    }

    fn rewindable_result(&self) -> bool {
        self.rewindable
    }

    fn set_rewindable_result(&mut self, rewindable: bool) {
        self.rewindable = rewindable;
    }

    fn coerce_to_array(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.rewindable = true;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.rows = Vec::new();
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Fallible row iterator a streaming driver supplies
pub type RowSource = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Cursor that pulls rows from its source on demand.
///
/// `buffer[0]` holds the row at absolute position `offset`. A rewindable
/// stream never discards rows, so `offset` stays 0. Otherwise rows behind the
/// index are dropped and `offset` follows the index.
///
/// `last`, `all`, `result_count` and `is_empty`-style questions may force the
/// unread remainder into memory.
pub struct StreamCursor {
    source: Option<RowSource>,
    buffer: Vec<Row>,
    offset: usize,
    index: usize,
    first_row: Option<Row>,
    last_seen: Option<Row>,
    affected_count: u64,
    rewindable: bool,
    finished: bool,
}

impl StreamCursor {
    pub fn new(source: RowSource) -> Self {
        StreamCursor {
            source: Some(source),
            buffer: Vec::new(),
            offset: 0,
            index: 0,
            first_row: None,
            last_seen: None,
            affected_count: 0,
            rewindable: false,
            finished: false,
        }
    }

    /// Builds a stream from an infallible iterator
    pub fn from_rows<I>(rows: I) -> Self
    where
        I: IntoIterator<Item = Row>,
        I::IntoIter: Send + 'static,
    {
        StreamCursor::new(Box::new(rows.into_iter().map(Ok)))
    }

    pub fn with_affected_count(mut self, affected_count: u64) -> Self {
        self.affected_count = affected_count;
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.finished {
            return Err(finished_error());
        }
        Ok(())
    }

    /// Absolute position one past the last row pulled so far
    fn pulled(&self) -> usize {
        self.offset + self.buffer.len()
    }

    fn pull_one(&mut self) -> Result<bool> {
        let next = match self.source.as_mut() {
            Some(source) => source.next(),
            None => None,
        };

        match next {
            Some(row) => {
                let row = row?;
                if self.pulled() == 0 {
                    self.first_row = Some(row.clone());
                }
                self.last_seen = Some(row.clone());
                self.buffer.push(row);
                Ok(true)
            }
            None => {
                self.source = None;
                Ok(false)
            }
        }
    }

    /// Pulls until `position` rows exist or the source runs dry
    fn pull_until(&mut self, position: usize) -> Result<()> {
        while self.pulled() < position {
            if !self.pull_one()? {
                break;
            }
        }
        Ok(())
    }

    fn pull_all(&mut self) -> Result<()> {
        while self.pull_one()? {}
        Ok(())
    }

    /// Drops rows behind the index when replay is not required
    fn discard_consumed(&mut self) {
        if !self.rewindable && self.index > self.offset {
            let consumed = (self.index - self.offset).min(self.buffer.len());
            self.buffer.drain(..consumed);
            self.offset += consumed;
        }
    }

    fn take_from_index(&mut self, end: usize) -> Vec<Row> {
        let start = self.index.saturating_sub(self.offset).min(self.buffer.len());
        let stop = end.saturating_sub(self.offset).min(self.buffer.len()).max(start);
        let rows = self.buffer[start..stop].to_vec();
        self.index += rows.len();
        self.discard_consumed();
        rows
    }
}

impl Cursor for StreamCursor {
    fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.fetch(1)?.into_iter().next())
    }

    fn fetch(&mut self, count: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let end = self.index.saturating_add(count);
        self.pull_until(end)?;
        Ok(self.take_from_index(end))
    }

    fn first(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.pull_until(1)?;
        Ok(self.first_row.clone())
    }

    fn last(&mut self) -> Result<Option<Row>> {
        self.ensure_open()?;
        self.pull_all()?;
        Ok(self.buffer.last().cloned().or_else(|| self.last_seen.clone()))
    }

    fn rest(&mut self) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.pull_all()?;
        let end = self.pulled();
        Ok(self.take_from_index(end))
    }

    fn all(&mut self) -> Result<Vec<Row>> {
        self.ensure_open()?;
        if self.offset > 0 {
            return Err(RdbiError::InvalidState(
                "rows before the current index were discarded; result is not rewindable".to_string(),
            ));
        }
        self.pull_all()?;
        Ok(self.buffer.clone())
    }

    fn get(&mut self, index: usize) -> Result<Option<Row>> {
        self.ensure_open()?;
        if index < self.offset {
            return Err(RdbiError::InvalidState(format!(
                "row {} was discarded; result is not rewindable",
                index
            )));
        }
        self.pull_until(index + 1)?;
        Ok(self.buffer.get(index - self.offset).cloned())
    }

    fn rewind(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.rewindable || self.offset > 0 {
            return Err(not_rewindable_error());
        }
        self.index = 0;
        Ok(())
    }

    fn is_empty(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.pull_until(1)?;
        Ok(self.pulled() == 0)
    }

    fn result_count(&mut self) -> Result<usize> {
        self.ensure_open()?;
        self.pull_all()?;
        Ok(self.pulled())
    }

    fn affected_count(&self) -> u64 {
        self.affected_count
    }

    fn is_last_row(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.pull_until(self.index + 1)?;
        Ok(self.index >= self.pulled())
    }

    fn index(&self) -> usize {
        self.index
    }

    fn rewindable_result(&self) -> bool {
        self.rewindable
    }

    fn set_rewindable_result(&mut self, rewindable: bool) {
        self.rewindable = rewindable;
        if !rewindable {
            self.discard_consumed();
        }
    }

    fn coerce_to_array(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.pull_all()?;
        self.rewindable = true;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.source = None;
        self.buffer = Vec::new();
        self.first_row = None;
        self.last_seen = None;
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn generate_data() -> Vec<Row> {
        (0..10i64)
            .map(|x| vec![Value::Integer(x - 1), Value::Integer(x), Value::Integer(x + 1)])
            .collect()
    }

    #[test]
    fn test_array_fetch_advances_index() {
        let mut cursor = ArrayCursor::new(generate_data());

        assert_eq!(cursor.fetch(1).unwrap(), generate_data()[..1].to_vec());
        assert_eq!(cursor.index(), 1);
        assert_eq!(cursor.fetch(9).unwrap(), generate_data()[1..].to_vec());
        assert_eq!(cursor.index(), 10);
        assert!(cursor.fetch(1).unwrap().is_empty());
        assert!(cursor.is_last_row().unwrap());
    }

    #[test]
    fn test_array_positional_reads_keep_index() {
        let mut cursor = ArrayCursor::new(generate_data());
        cursor.fetch(1).unwrap();

        assert_eq!(cursor.first().unwrap(), Some(generate_data()[0].clone()));
        assert_eq!(cursor.last().unwrap(), Some(generate_data()[9].clone()));
        assert_eq!(cursor.all().unwrap(), generate_data());
        assert_eq!(cursor.index(), 1);

        assert_eq!(cursor.rest().unwrap(), generate_data()[1..].to_vec());
        assert_eq!(cursor.index(), 10);
    }

    #[test]
    fn test_array_rewind_requires_rewindable() {
        let mut cursor = ArrayCursor::new(generate_data());
        cursor.fetch(3).unwrap();
        assert!(matches!(cursor.rewind(), Err(RdbiError::InvalidState(_))));

        cursor.set_rewindable_result(true);
        cursor.rewind().unwrap();
        assert_eq!(cursor.index(), 0);
    }

    #[test]
    fn test_finished_cursor_rejects_reads() {
        let mut cursor = ArrayCursor::new(generate_data()).with_affected_count(4);
        cursor.finish().unwrap();
        assert!(cursor.is_finished());
        assert_eq!(cursor.affected_count(), 4);
        assert!(matches!(cursor.fetch(1), Err(RdbiError::InvalidState(_))));
        assert!(matches!(cursor.first(), Err(RdbiError::InvalidState(_))));
    }

    #[test]
    fn test_stream_discards_consumed_rows() {
        let mut cursor = StreamCursor::from_rows(generate_data());

        assert_eq!(cursor.first().unwrap(), Some(generate_data()[0].clone()));
        assert_eq!(cursor.fetch(2).unwrap(), generate_data()[..2].to_vec());
        assert_eq!(cursor.index(), 2);

        // Still answers `first` from its cache
        assert_eq!(cursor.first().unwrap(), Some(generate_data()[0].clone()));
        assert!(matches!(cursor.all(), Err(RdbiError::InvalidState(_))));
        assert!(matches!(cursor.get(0), Err(RdbiError::InvalidState(_))));
        assert!(matches!(cursor.rewind(), Err(RdbiError::InvalidState(_))));

        assert_eq!(cursor.last().unwrap(), Some(generate_data()[9].clone()));
        assert_eq!(cursor.index(), 2);
        assert_eq!(cursor.rest().unwrap(), generate_data()[2..].to_vec());
        assert!(cursor.is_last_row().unwrap());
        assert_eq!(cursor.last().unwrap(), Some(generate_data()[9].clone()));
        assert_eq!(cursor.result_count().unwrap(), 10);
    }

    #[test]
    fn test_stream_all_before_reading() {
        let mut cursor = StreamCursor::from_rows(generate_data());
        assert_eq!(cursor.all().unwrap(), generate_data());
        assert_eq!(cursor.index(), 0);
        assert_eq!(cursor.fetch(1).unwrap(), generate_data()[..1].to_vec());
    }

    #[test]
    fn test_stream_coerced_to_array_can_rewind() {
        let mut cursor = StreamCursor::from_rows(generate_data());
        cursor.coerce_to_array().unwrap();

        assert_eq!(cursor.fetch(4).unwrap().len(), 4);
        cursor.rewind().unwrap();
        assert_eq!(cursor.fetch(1).unwrap(), generate_data()[..1].to_vec());
        assert_eq!(cursor.all().unwrap(), generate_data());
    }

    #[test]
    fn test_stream_empty_source() {
        let mut cursor = StreamCursor::from_rows(Vec::<Row>::new());
        assert!(cursor.is_empty().unwrap());
        assert_eq!(cursor.first().unwrap(), None);
        assert_eq!(cursor.last().unwrap(), None);
        assert!(cursor.fetch(5).unwrap().is_empty());
        assert!(cursor.is_last_row().unwrap());
    }

    #[test]
    fn test_stream_source_error_propagates() {
        let source: RowSource = Box::new(
            vec![
                Ok(vec![Value::Integer(1)]),
                Err(RdbiError::InvalidState("source broke".to_string())),
            ]
            .into_iter(),
        );
        let mut cursor = StreamCursor::new(source);

        assert_eq!(cursor.fetch(1).unwrap().len(), 1);
        assert!(cursor.fetch(1).is_err());
    }
}
