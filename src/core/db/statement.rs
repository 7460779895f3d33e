/// Statement Module
///
/// A prepared query bound to the connection that created it. Statements go
/// from open to finished exactly once; a finished statement refuses to
/// execute and releases the cursor of its most recent result.

use crate::core::db::connection::Connection;
use crate::core::db::cursor::Cursor;
use crate::core::db::query::{QueryResult, SharedCursor};
use crate::core::{RdbiError, Result, Value};
use crate::driver::DriverStatement;
use crate::types::{convert_in, InputTypeMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, warn};
use uuid::Uuid;

/// Identity of a statement within its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatementId(Uuid);

impl StatementId {
    fn new() -> Self {
        StatementId(Uuid::new_v4())
    }
}

impl fmt::Display for StatementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct StatementState {
    handle: Box<dyn DriverStatement>,
    finished: bool,
    last_result: Option<Weak<Mutex<Box<dyn Cursor>>>>,
    executions: u64,
}

/// A prepared query
pub struct Statement {
    id: StatementId,
    connection: Arc<Connection>,
    query: String,
    input_type_map: InputTypeMap,
    state: Mutex<StatementState>,
}

impl Statement {
    pub(crate) fn new(
        connection: Arc<Connection>,
        query: &str,
        handle: Box<dyn DriverStatement>,
    ) -> Arc<Self> {
        let input_type_map = handle.input_type_map();
        Arc::new(Statement {
            id: StatementId::new(),
            connection,
            query: query.to_string(),
            input_type_map,
            state: Mutex::new(StatementState {
                handle,
                finished: false,
                last_result: None,
                executions: 0,
            }),
        })
    }

    fn state(&self) -> Result<MutexGuard<'_, StatementState>> {
        self.state.lock().map_err(|_| RdbiError::poisoned("statement"))
    }

    pub fn id(&self) -> StatementId {
        self.id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// The connection that prepared this statement
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn input_type_map(&self) -> &InputTypeMap {
        &self.input_type_map
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().map(|s| s.finished).unwrap_or(true)
    }

    /// Number of successful executions so far
    pub fn executions(&self) -> u64 {
        self.state.lock().map(|s| s.executions).unwrap_or(0)
    }

    /// Whether the most recent result is gone or finished.
    ///
    /// True before the first execution.
    pub fn last_result_finished(&self) -> bool {
        let cursor = match self.state.lock() {
            Ok(state) => state.last_result.as_ref().and_then(Weak::upgrade),
            Err(_) => return true,
        };
        match cursor {
            Some(cursor) => cursor.lock().map(|c| c.is_finished()).unwrap_or(true),
            None => true,
        }
    }

    /// Executes the statement.
    ///
    /// Binds are converted through the statement's input type map before the
    /// driver sees them. The returned result inherits the connection's
    /// rewindable-result setting.
    ///
    /// # Errors
    ///
    /// `RdbiError::InvalidState` if the statement has been finished; driver
    /// errors are passed through unchanged.
    pub fn execute(self: &Arc<Self>, binds: &[Value]) -> Result<QueryResult> {
        let rewindable = self.connection.rewindable_result();

        let mut state = self.state()?;
        if state.finished {
            return Err(RdbiError::InvalidState(
                "you may not execute a finished statement".to_string(),
            ));
        }

        let converted: Vec<Value> = binds
            .iter()
            .cloned()
            .map(|bind| convert_in(bind, &self.input_type_map))
            .collect();

        let execution = state.handle.new_execution(&converted)?;
        let result = QueryResult::new(Arc::clone(self), converted, execution, rewindable)?;

        state.last_result = result.cursor_handle().map(|cursor| Arc::downgrade(&cursor));
        state.executions += 1;
        debug!(statement = %self.id, query = %self.query, "executed statement");

        Ok(result)
    }

    /// Executes a DML statement and returns the affected row count.
    ///
    /// The intermediate result is dropped; the statement stays open.
    pub fn execute_modification(self: &Arc<Self>, binds: &[Value]) -> Result<u64> {
        let result = self.execute(binds)?;
        result.affected_count()
    }

    /// Finishes the statement.
    ///
    /// Idempotent. Releases the driver statement, finishes the cursor of the
    /// most recent result, and removes the statement from its connection's
    /// open-statement set.
    pub fn finish(&self) -> Result<()> {
        let (last_result, driver_result) = {
            let mut state = self.state()?;
            if state.finished {
                return Ok(());
            }
            state.finished = true;
            let driver_result = state.handle.finish();
            (state.last_result.take(), driver_result)
        };

        if let Some(cursor) = last_result.as_ref().and_then(Weak::upgrade) {
            finish_cursor(&cursor);
        }

        self.connection.forget_statement(self.id);
        debug!(statement = %self.id, "finished statement");

        driver_result
    }
}

fn finish_cursor(cursor: &SharedCursor) {
    match cursor.lock() {
        Ok(mut cursor) => {
            if !cursor.is_finished() {
                if let Err(e) = cursor.finish() {
                    warn!(error = %e, "failed to finish result cursor");
                }
            }
        }
        Err(_) => warn!("result cursor lock poisoned; leaving it unfinished"),
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("finished", &self.is_finished())
            .finish()
    }
}
