/// SQLite Driver Module
///
/// The bundled SQLite driver, backed by rusqlite.
///
/// Connect arguments:
/// - `database`: file path, default `:memory:`
/// - `foreign_keys`: `off` to skip `PRAGMA foreign_keys = ON`
/// - `busy_timeout_ms`: how long to wait on a locked database
///
/// Nested transactions map onto savepoints: depth 1 is a real `BEGIN`, every
/// deeper level a `SAVEPOINT rdbi_<depth>`.

use super::{ConnectArgs, Driver, DriverConnection, DriverStatement, Execution};
use crate::core::db::cursor::ArrayCursor;
use crate::core::db::schema::{self, Column, HostType, Schema};
use crate::core::{RdbiError, Result, Row, Value, ValueKind};
use crate::types::{Filter, FilterList, InputTypeMap};
use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

const MEMORY_DATABASE: &str = ":memory:";

/// The bundled SQLite driver
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "SQLite"
    }

    fn connect(&self, args: &ConnectArgs) -> Result<Box<dyn DriverConnection>> {
        let path = args.get("database").unwrap_or(MEMORY_DATABASE).to_string();
        let conn = Connection::open(&path)?;

        if args.get("foreign_keys") != Some("off") {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        if let Some(timeout) = args.get("busy_timeout_ms") {
            let millis: u64 = timeout.parse().map_err(|_| {
                RdbiError::Config(format!("busy_timeout_ms must be an integer, got '{}'", timeout))
            })?;
            conn.busy_timeout(Duration::from_millis(millis))?;
        }

        debug!(database = %path, "opened SQLite database");
        Ok(Box::new(SqliteConnection {
            conn: Arc::new(Mutex::new(conn)),
            path,
        }))
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|_| RdbiError::poisoned("sqlite connection"))
}

struct SqliteConnection {
    conn: Arc<Mutex<Connection>>,
    path: String,
}

impl SqliteConnection {
    fn run(&self, sql: &str) -> Result<()> {
        lock(&self.conn)?.execute_batch(sql)?;
        Ok(())
    }
}

impl DriverConnection for SqliteConnection {
    fn new_statement(&mut self, query: &str) -> Result<Box<dyn DriverStatement>> {
        // Compile once up front so syntax errors surface at prepare time.
        lock(&self.conn)?.prepare_cached(query)?;
        Ok(Box::new(SqliteStatement {
            conn: Arc::clone(&self.conn),
            query: query.to_string(),
        }))
    }

    fn ping(&mut self) -> Result<Option<u64>> {
        let conn = lock(&self.conn)?;
        let start = Instant::now();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(Some(start.elapsed().as_micros().max(1) as u64))
    }

    fn begin(&mut self, depth: usize) -> Result<()> {
        match depth {
            0 => Ok(()),
            1 => self.run("BEGIN"),
            n => self.run(&format!("SAVEPOINT rdbi_{}", n)),
        }
    }

    fn commit(&mut self, depth: usize) -> Result<()> {
        match depth {
            0 => Ok(()),
            1 => self.run("COMMIT"),
            n => self.run(&format!("RELEASE SAVEPOINT rdbi_{}", n)),
        }
    }

    fn rollback(&mut self, depth: usize) -> Result<()> {
        match depth {
            0 => Ok(()),
            1 => self.run("ROLLBACK"),
            n => self.run(&format!(
                "ROLLBACK TO SAVEPOINT rdbi_{n}; RELEASE SAVEPOINT rdbi_{n}",
                n = n
            )),
        }
    }

    /// Rolls back whatever transaction is still open so its locks do not
    /// outlive the session.
    fn disconnect(&mut self) -> Result<()> {
        let conn = lock(&self.conn)?;
        conn.flush_prepared_statement_cache();
        if !conn.is_autocommit() {
            debug!(database = %self.path, "rolling back open transaction on disconnect");
            conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn table_schema(&mut self, table_name: &str) -> Result<Option<Schema>> {
        let conn = lock(&self.conn)?;
        schema::table_schema(&conn, table_name)
    }

    fn schema(&mut self) -> Result<Vec<Schema>> {
        let conn = lock(&self.conn)?;
        schema::database_schema(&conn)
    }

    fn database_name(&self) -> Option<String> {
        Some(self.path.clone())
    }
}

struct SqliteStatement {
    conn: Arc<Mutex<Connection>>,
    query: String,
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Integer(i) => SqliteValue::Integer(*i),
        Value::Float(x) => SqliteValue::Real(*x),
        Value::Boolean(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Blob(bytes) => SqliteValue::Blob(bytes.clone()),
        Value::Decimal(_) | Value::DateTime(_) | Value::Text(_) => SqliteValue::Text(value.to_string()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(x) => Value::Float(x),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

impl DriverStatement for SqliteStatement {
    fn new_execution(&mut self, binds: &[Value]) -> Result<Execution> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare_cached(&self.query)?;
        let params = binds.iter().map(to_sqlite).collect::<Vec<_>>();

        let columns: Vec<Column> = stmt
            .columns()
            .iter()
            .map(|column| {
                let declared = column.decl_type().unwrap_or("");
                Column::new(column.name(), HostType::from_declared_type(declared)).with_db_type(declared)
            })
            .collect();

        if columns.is_empty() {
            let affected = stmt.execute(params_from_iter(params.iter()))?;
            let cursor = ArrayCursor::new(Vec::new()).with_affected_count(affected as u64);
            return Ok(Execution::new(Box::new(cursor), Schema::new(columns)));
        }

        let width = columns.len();
        let mut rows: Vec<Row> = Vec::new();
        let mut result = stmt.query(params_from_iter(params.iter()))?;
        while let Some(row) = result.next()? {
            let values = (0..width)
                .map(|i| row.get_ref(i).map(from_sqlite))
                .collect::<rusqlite::Result<Row>>()?;
            rows.push(values);
        }
        drop(result);

        let mut cursor = ArrayCursor::new(rows);
        if !stmt.readonly() {
            // DML with RETURNING
            cursor = cursor.with_affected_count(conn.changes() as u64);
        }
        Ok(Execution::new(Box::new(cursor), Schema::new(columns)))
    }

    /// Integers, floats, text and blobs bind natively; booleans become 0/1
    /// and the remaining kinds go over as text.
    fn input_type_map(&self) -> InputTypeMap {
        let mut map = InputTypeMap::empty();
        map.insert(ValueKind::Decimal, FilterList::with(vec![Filter::from_decimal()]));
        map.insert(ValueKind::DateTime, FilterList::with(vec![Filter::from_datetime()]));
        map.insert(
            ValueKind::Boolean,
            FilterList::with(vec![Filter::new(
                |v| v.as_bool().is_some(),
                |v| match v.as_bool() {
                    Some(b) => Value::Integer(i64::from(b)),
                    None => v,
                },
            )]),
        );
        map
    }
}
