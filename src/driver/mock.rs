/// Mock Driver Module
///
/// An in-memory driver with scriptable behavior.
///
/// Every session, statement and execution opened through one [`MockDriver`]
/// shares its behavior and activity log, so tests can script results and
/// failures up front and inspect what the core asked of the driver afterwards.

use super::{ConnectArgs, Connector, Driver, DriverConnection, DriverStatement, Execution};
use crate::core::db::cursor::{ArrayCursor, Cursor, StreamCursor};
use crate::core::db::schema::{Column, HostType, Schema};
use crate::core::{RdbiError, Result, Row, Value};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Failure raised on request by the mock driver
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MockError(pub String);

fn fail(message: &Option<String>) -> Result<()> {
    match message {
        Some(message) => Err(RdbiError::driver(MockError(message.clone()))),
        None => Ok(()),
    }
}

/// What executions return and which operations fail
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub rows: Vec<Row>,
    /// Schema for every execution; synthesized from the row width when unset
    pub schema: Option<Schema>,
    pub affected_count: u64,
    /// Hand back streaming cursors instead of array cursors
    pub streaming: bool,
    pub ping: Option<u64>,
    pub fail_connect: Option<String>,
    pub fail_execute: Option<String>,
    pub fail_commit: Option<String>,
    pub fail_disconnect: Option<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        MockBehavior {
            rows: Vec::new(),
            schema: None,
            affected_count: 0,
            streaming: false,
            ping: Some(10),
            fail_connect: None,
            fail_execute: None,
            fail_commit: None,
            fail_disconnect: None,
        }
    }
}

/// Everything the core asked of the driver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockLog {
    pub connects: usize,
    pub disconnects: usize,
    pub prepared: Vec<String>,
    /// (query, binds as received) per execution
    pub executions: Vec<(String, Vec<Value>)>,
    pub statement_finishes: usize,
    pub begins: Vec<usize>,
    pub commits: Vec<usize>,
    pub rollbacks: Vec<usize>,
}

#[derive(Debug, Default)]
struct MockShared {
    behavior: MockBehavior,
    log: MockLog,
}

/// Driver whose sessions never touch a real database
#[derive(Debug, Clone, Default)]
pub struct MockDriver {
    shared: Arc<Mutex<MockShared>>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver::default()
    }

    fn shared(&self) -> MutexGuard<'_, MockShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A connector bound to this driver instance
    pub fn connector(&self) -> Connector {
        Connector::new(Arc::new(self.clone()), ConnectArgs::new())
    }

    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        self.set_rows(rows);
        self
    }

    pub fn set_rows(&self, rows: Vec<Row>) {
        self.shared().behavior.rows = rows;
    }

    pub fn set_schema(&self, schema: Schema) {
        self.shared().behavior.schema = Some(schema);
    }

    pub fn set_affected_count(&self, affected_count: u64) {
        self.shared().behavior.affected_count = affected_count;
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.shared().behavior.streaming = streaming;
    }

    pub fn set_ping(&self, ping: Option<u64>) {
        self.shared().behavior.ping = ping;
    }

    pub fn fail_connect(&self, message: Option<&str>) {
        self.shared().behavior.fail_connect = message.map(str::to_string);
    }

    pub fn fail_execute(&self, message: Option<&str>) {
        self.shared().behavior.fail_execute = message.map(str::to_string);
    }

    pub fn fail_commit(&self, message: Option<&str>) {
        self.shared().behavior.fail_commit = message.map(str::to_string);
    }

    pub fn fail_disconnect(&self, message: Option<&str>) {
        self.shared().behavior.fail_disconnect = message.map(str::to_string);
    }

    pub fn behavior(&self) -> MockBehavior {
        self.shared().behavior.clone()
    }

    /// Snapshot of the activity log
    pub fn log(&self) -> MockLog {
        self.shared().log.clone()
    }
}

impl Driver for MockDriver {
    fn name(&self) -> &str {
        "Mock"
    }

    fn connect(&self, args: &ConnectArgs) -> Result<Box<dyn DriverConnection>> {
        let mut shared = self.shared();
        fail(&shared.behavior.fail_connect)?;
        shared.log.connects += 1;

        Ok(Box::new(MockConnection {
            shared: Arc::clone(&self.shared),
            database: args.get("database").map(str::to_string),
        }))
    }
}

struct MockConnection {
    shared: Arc<Mutex<MockShared>>,
    database: Option<String>,
}

impl MockConnection {
    fn shared(&self) -> MutexGuard<'_, MockShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DriverConnection for MockConnection {
    fn new_statement(&mut self, query: &str) -> Result<Box<dyn DriverStatement>> {
        self.shared().log.prepared.push(query.to_string());
        Ok(Box::new(MockStatement {
            shared: Arc::clone(&self.shared),
            query: query.to_string(),
        }))
    }

    fn ping(&mut self) -> Result<Option<u64>> {
        Ok(self.shared().behavior.ping)
    }

    fn begin(&mut self, depth: usize) -> Result<()> {
        self.shared().log.begins.push(depth);
        Ok(())
    }

    fn commit(&mut self, depth: usize) -> Result<()> {
        let mut shared = self.shared();
        fail(&shared.behavior.fail_commit)?;
        shared.log.commits.push(depth);
        Ok(())
    }

    fn rollback(&mut self, depth: usize) -> Result<()> {
        self.shared().log.rollbacks.push(depth);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        let mut shared = self.shared();
        shared.log.disconnects += 1;
        fail(&shared.behavior.fail_disconnect)
    }

    fn table_schema(&mut self, table_name: &str) -> Result<Option<Schema>> {
        let shared = self.shared();
        Ok(shared
            .behavior
            .schema
            .clone()
            .filter(|schema| schema.table_names().iter().any(|t| t == table_name)))
    }

    fn schema(&mut self) -> Result<Vec<Schema>> {
        Ok(self.shared().behavior.schema.clone().into_iter().collect())
    }

    fn database_name(&self) -> Option<String> {
        self.database.clone()
    }
}

struct MockStatement {
    shared: Arc<Mutex<MockShared>>,
    query: String,
}

impl MockStatement {
    fn shared(&self) -> MutexGuard<'_, MockShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Columns named `column_1..n`, untyped
fn synthesized_schema(rows: &[Row]) -> Schema {
    let width = rows.first().map_or(0, Vec::len);
    Schema::new(
        (1..=width)
            .map(|i| Column::new(format!("column_{}", i), HostType::default()))
            .collect(),
    )
}

impl DriverStatement for MockStatement {
    fn new_execution(&mut self, binds: &[Value]) -> Result<Execution> {
        let mut shared = self.shared();
        fail(&shared.behavior.fail_execute)?;
        shared.log.executions.push((self.query.clone(), binds.to_vec()));

        let behavior = &shared.behavior;
        let schema = behavior
            .schema
            .clone()
            .unwrap_or_else(|| synthesized_schema(&behavior.rows));

        let cursor: Box<dyn Cursor> = if behavior.streaming {
            Box::new(StreamCursor::from_rows(behavior.rows.clone()).with_affected_count(behavior.affected_count))
        } else {
            Box::new(ArrayCursor::new(behavior.rows.clone()).with_affected_count(behavior.affected_count))
        };

        Ok(Execution::new(cursor, schema))
    }

    fn finish(&mut self) -> Result<()> {
        self.shared().log.statement_finishes += 1;
        Ok(())
    }
}
