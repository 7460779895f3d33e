/// Connection Management Module
///
/// This module provides a single database session: statement preparation and
/// tracking, nested transaction management, and the connect/disconnect
/// lifecycle. Every connection is shared as an `Arc<Connection>` so that its
/// statements can hold a back-reference to it.

use crate::core::db::query::QueryResult;
use crate::core::db::schema::Schema;
use crate::core::db::statement::{Statement, StatementId};
use crate::core::{RdbiError, Result, Value};
use crate::driver::{ConnectArgs, Connector, DriverConnection};
use crate::preprocess::{self, Binds};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Represents database transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No active transaction (autocommit mode)
    #[default]
    Autocommit,
    /// Transaction in progress at the given nesting depth
    Transaction(usize),
}

/// Internal connection state, guarded by the connection mutex
struct ConnectionState {
    /// Driver session
    handle: Box<dyn DriverConnection>,
    connected: bool,
    /// Nesting depth of open transactions (0 = none)
    transaction_depth: usize,
    /// Query text of the most recent prepare or preprocess
    last_query: Option<String>,
    last_statement: Option<Weak<Statement>>,
    /// Statements prepared here and not yet finished
    open_statements: HashMap<StatementId, Weak<Statement>>,
    /// Default rewindable-result flag for new results
    rewindable_result: bool,
    database_name: Option<String>,
}

/// One database session
pub struct Connection {
    id: Uuid,
    connector: Connector,
    state: Mutex<ConnectionState>,
}

/// Rolls an aborted transaction back when its body panics.
struct TransactionGuard<'a> {
    connection: &'a Connection,
    entry_depth: usize,
    armed: bool,
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.connection.rollback_to(self.entry_depth);
        }
    }
}

/// Finishes a scoped statement unless the scope completed successfully.
struct FinishGuard<'a> {
    statement: &'a Statement,
    armed: bool,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.statement.finish() {
                warn!(statement = %self.statement.id(), error = %e, "failed to finish scoped statement");
            }
        }
    }
}

impl Connection {
    /// Opens a new session through `connector`.
    ///
    /// # Returns
    ///
    /// A connected handle, or the driver's error if the session could not be
    /// opened.
    pub fn open(connector: Connector) -> Result<Arc<Self>> {
        let handle = connector.open()?;
        let database_name = handle
            .database_name()
            .or_else(|| connector.args().get("database").map(str::to_string));

        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            state: Mutex::new(ConnectionState {
                handle,
                connected: true,
                transaction_depth: 0,
                last_query: None,
                last_statement: None,
                open_statements: HashMap::new(),
                rewindable_result: connector.rewindable_result(),
                database_name,
            }),
            connector,
        });

        debug!(connection = %connection.id, driver = connection.driver_name(), "connected");
        Ok(connection)
    }

    fn state(&self) -> Result<MutexGuard<'_, ConnectionState>> {
        self.state.lock().map_err(|_| RdbiError::poisoned("connection"))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn driver_name(&self) -> &str {
        self.connector.driver_name()
    }

    /// The connector this session was opened with
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn connect_args(&self) -> &ConnectArgs {
        self.connector.args()
    }

    pub fn database_name(&self) -> Option<String> {
        self.state.lock().ok()?.database_name.clone()
    }

    /// Checks if the session is live
    ///
    /// A poisoned connection reports itself as disconnected.
    pub fn is_connected(&self) -> bool {
        self.state.lock().map(|s| s.connected).unwrap_or(false)
    }

    pub fn rewindable_result(&self) -> bool {
        self.state.lock().map(|s| s.rewindable_result).unwrap_or(false)
    }

    /// Sets the rewindable flag for results created from now on
    pub fn set_rewindable_result(&self, rewindable: bool) -> Result<()> {
        self.state()?.rewindable_result = rewindable;
        Ok(())
    }

    pub fn transaction_depth(&self) -> usize {
        self.state.lock().map(|s| s.transaction_depth).unwrap_or(0)
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_depth() > 0
    }

    /// Gets the current transaction state
    pub fn transaction_state(&self) -> TransactionState {
        match self.transaction_depth() {
            0 => TransactionState::Autocommit,
            depth => TransactionState::Transaction(depth),
        }
    }

    pub fn last_query(&self) -> Option<String> {
        self.state.lock().ok()?.last_query.clone()
    }

    /// Most recently prepared statement, if it is still alive
    pub fn last_statement(&self) -> Option<Arc<Statement>> {
        self.state.lock().ok()?.last_statement.as_ref()?.upgrade()
    }

    /// Number of statements prepared here and not yet finished.
    ///
    /// Statements dropped without being finished are counted until the next
    /// disconnect.
    pub fn open_statement_count(&self) -> usize {
        self.state.lock().map(|s| s.open_statements.len()).unwrap_or(0)
    }

    /// Live statements prepared here and not yet finished
    pub fn open_statements(&self) -> Vec<Arc<Statement>> {
        self.state
            .lock()
            .map(|s| s.open_statements.values().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Prepares a statement.
    ///
    /// The statement is registered as open until it is finished.
    ///
    /// # Errors
    ///
    /// `RdbiError::InvalidState` when disconnected; driver errors unchanged.
    pub fn prepare(self: &Arc<Self>, query: &str) -> Result<Arc<Statement>> {
        let mut state = self.state()?;
        if !state.connected {
            return Err(RdbiError::InvalidState(
                "cannot prepare on a disconnected connection".to_string(),
            ));
        }

        state.last_query = Some(query.to_string());
        let handle = state.handle.new_statement(query)?;
        let statement = Statement::new(Arc::clone(self), query, handle);

        state
            .open_statements
            .insert(statement.id(), Arc::downgrade(&statement));
        state.last_statement = Some(Arc::downgrade(&statement));
        debug!(connection = %self.id, statement = %statement.id(), "prepared statement");

        Ok(statement)
    }

    /// Prepares a statement, hands it to `body`, and finishes it afterwards.
    ///
    /// The statement is finished whether `body` returns, fails or panics.
    pub fn prepare_with<T, F>(self: &Arc<Self>, query: &str, body: F) -> Result<T>
    where
        F: FnOnce(&Arc<Statement>) -> Result<T>,
    {
        let statement = self.prepare(query)?;
        let mut guard = FinishGuard {
            statement: &statement,
            armed: true,
        };

        let outcome = body(&statement);
        guard.armed = false;
        let finished = statement.finish();

        let value = outcome?;
        finished?;
        Ok(value)
    }

    /// Prepares and executes `query` in one step.
    ///
    /// The statement stays open until the returned result is finished.
    pub fn execute(self: &Arc<Self>, query: &str, binds: &[Value]) -> Result<QueryResult> {
        let statement = self.prepare(query)?;
        match statement.execute(binds) {
            Ok(result) => Ok(result),
            Err(e) => {
                if let Err(finish_err) = statement.finish() {
                    warn!(error = %finish_err, "failed to finish statement after execute error");
                }
                Err(e)
            }
        }
    }

    /// Executes `query`, hands the result to `body`, then finishes the result
    /// and its statement. On an error or panic inside `body` the statement is
    /// still finished.
    pub fn execute_with<T, F>(self: &Arc<Self>, query: &str, binds: &[Value], body: F) -> Result<T>
    where
        F: FnOnce(&mut QueryResult) -> Result<T>,
    {
        let mut result = self.execute(query, binds)?;
        let statement = result.statement().cloned();

        let outcome = match statement.as_deref() {
            Some(statement) => {
                let mut guard = FinishGuard {
                    statement,
                    armed: true,
                };
                let outcome = body(&mut result);
                guard.armed = false;
                outcome
            }
            None => body(&mut result),
        };

        let finished = result.finish();
        let value = outcome?;
        finished?;
        Ok(value)
    }

    /// Executes a DML query and returns the affected row count.
    ///
    /// The statement is finished before returning.
    pub fn execute_modification(self: &Arc<Self>, query: &str, binds: &[Value]) -> Result<u64> {
        self.prepare_with(query, |statement| statement.execute_modification(binds))
    }

    /// Runs `body` inside a (possibly nested) transaction.
    ///
    /// Successful bodies are committed, unless `body` already committed or
    /// rolled back its own level. Errors and panics roll the level back; a
    /// failed commit is rolled back too and its error returned.
    pub fn transaction<T, F>(self: &Arc<Self>, body: F) -> Result<T>
    where
        F: FnOnce(&Arc<Connection>) -> Result<T>,
    {
        let entry_depth = self.begin()?;
        let mut guard = TransactionGuard {
            connection: self.as_ref(),
            entry_depth,
            armed: true,
        };

        let outcome = body(self);
        guard.armed = false;

        match outcome {
            Ok(value) => {
                if self.transaction_depth() > entry_depth {
                    if let Err(e) = self.commit() {
                        self.rollback_to(entry_depth);
                        return Err(e);
                    }
                }
                Ok(value)
            }
            Err(e) => {
                self.rollback_to(entry_depth);
                Err(e)
            }
        }
    }

    /// Opens one more transaction level; returns the depth before it.
    fn begin(&self) -> Result<usize> {
        let mut state = self.state()?;
        if !state.connected {
            return Err(RdbiError::InvalidState(format!(
                "cannot begin a transaction on disconnected connection {}",
                self.id
            )));
        }
        let entry_depth = state.transaction_depth;
        state.handle.begin(entry_depth + 1)?;
        state.transaction_depth = entry_depth + 1;
        debug!(connection = %self.id, depth = entry_depth + 1, "began transaction");
        Ok(entry_depth)
    }

    /// Commits the innermost transaction level
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state()?;
        let depth = state.transaction_depth;
        state.handle.commit(depth)?;
        state.transaction_depth = depth.saturating_sub(1);
        debug!(connection = %self.id, depth, "committed transaction");
        Ok(())
    }

    /// Rolls back the innermost transaction level
    pub fn rollback(&self) -> Result<()> {
        let mut state = self.state()?;
        let depth = state.transaction_depth;
        state.handle.rollback(depth)?;
        state.transaction_depth = depth.saturating_sub(1);
        debug!(connection = %self.id, depth, "rolled back transaction");
        Ok(())
    }

    /// Unwinds to `entry_depth`; a failed rollback still drops the level.
    fn rollback_to(&self, entry_depth: usize) {
        if self.transaction_depth() <= entry_depth {
            return;
        }
        if let Err(e) = self.rollback() {
            error!(connection = %self.id, error = %e, "rollback failed");
            if let Ok(mut state) = self.state() {
                state.transaction_depth = entry_depth;
            }
        }
    }

    /// Round-trip probe of the driver session
    pub fn ping(&self) -> Result<Option<u64>> {
        self.state()?.handle.ping()
    }

    /// Describes one table; `None` when it does not exist
    pub fn table_schema(&self, table_name: &str) -> Result<Option<Schema>> {
        self.state()?.handle.table_schema(table_name)
    }

    /// Describes every table of the database
    pub fn schema(&self) -> Result<Vec<Schema>> {
        self.state()?.handle.schema()
    }

    /// Renders a value as a query literal using the driver's quoting
    pub fn quote(&self, value: &Value) -> Result<String> {
        Ok(self.state()?.handle.quote(value))
    }

    /// Substitutes binds into `query` as quoted literals.
    ///
    /// Records the query as the connection's last query.
    pub fn preprocess_query(&self, query: &str, binds: &Binds) -> Result<String> {
        let mut state = self.state()?;
        state.last_query = Some(query.to_string());
        let handle = &state.handle;
        preprocess::preprocess(query, binds, |value| handle.quote(value))
    }

    /// Closes the session.
    ///
    /// Statements still open are reported and finished first. The
    /// connection is marked disconnected even when the driver fails, in which
    /// case its error is returned.
    pub fn disconnect(&self) -> Result<()> {
        let open: Vec<Weak<Statement>> = {
            let mut state = self.state()?;
            state.open_statements.drain().map(|(_, weak)| weak).collect()
        };

        if !open.is_empty() {
            warn!(
                connection = %self.id,
                count = open.len(),
                "disconnecting with open statements; finishing them"
            );
        }
        for statement in open.iter().filter_map(Weak::upgrade) {
            if let Err(e) = statement.finish() {
                warn!(statement = %statement.id(), error = %e, "failed to finish statement");
            }
        }

        let mut state = self.state()?;
        let result = state.handle.disconnect();
        state.connected = false;
        state.transaction_depth = 0;
        debug!(connection = %self.id, "disconnected");
        result
    }

    /// Disconnects a live session (ignoring failures) and opens a fresh
    /// driver session with the same arguments.
    pub fn reconnect(&self) -> Result<()> {
        if self.is_connected() {
            if let Err(e) = self.disconnect() {
                debug!(connection = %self.id, error = %e, "ignoring disconnect failure during reconnect");
            }
        }

        let handle = self.connector.open()?;
        let mut state = self.state()?;
        state.handle = handle;
        state.connected = true;
        debug!(connection = %self.id, "reconnected");
        Ok(())
    }

    /// Drops a finished statement from the open set
    pub(crate) fn forget_statement(&self, id: StatementId) {
        if let Ok(mut state) = self.state.lock() {
            state.open_statements.remove(&id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("driver", &self.driver_name())
            .field("connected", &self.is_connected())
            .field("transaction_depth", &self.transaction_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{generate_data, mock_connection};

    #[test]
    fn test_connection_lifecycle() {
        let (driver, dbh) = mock_connection();
        assert!(dbh.is_connected());
        assert_eq!(dbh.transaction_state(), TransactionState::Autocommit);

        dbh.disconnect().unwrap();
        assert!(!dbh.is_connected());

        dbh.reconnect().unwrap();
        assert!(dbh.is_connected());

        let log = driver.log();
        assert_eq!(log.connects, 2);
        assert_eq!(log.disconnects, 1);
    }

    #[test]
    fn test_statement_allocation() {
        let (_driver, dbh) = mock_connection();

        let sth = dbh.prepare("some statement").unwrap();
        assert_eq!(dbh.open_statement_count(), 1);
        assert_eq!(dbh.last_query().as_deref(), Some("some statement"));
        assert_eq!(dbh.last_statement().unwrap().id(), sth.id());

        dbh.disconnect().unwrap();
        assert_eq!(dbh.open_statement_count(), 0);
        assert!(sth.is_finished());
    }

    #[test]
    fn test_prepare_on_disconnected_connection_fails() {
        let (_driver, dbh) = mock_connection();
        dbh.disconnect().unwrap();
        assert!(matches!(dbh.prepare("select 1"), Err(RdbiError::InvalidState(_))));
    }

    #[test]
    fn test_transaction_on_disconnected_connection_fails() {
        let (driver, dbh) = mock_connection();
        dbh.disconnect().unwrap();

        let result: Result<()> = dbh.transaction(|_| Ok(()));

        assert!(matches!(result, Err(RdbiError::InvalidState(_))));
        assert_eq!(dbh.transaction_depth(), 0);
        assert!(driver.log().begins.is_empty());
    }

    #[test]
    fn test_reconnect_skips_disconnect_when_already_closed() {
        let (driver, dbh) = mock_connection();

        dbh.reconnect().unwrap();
        assert_eq!(driver.log().disconnects, 1);

        dbh.disconnect().unwrap();
        dbh.reconnect().unwrap();
        dbh.reconnect().unwrap();

        let log = driver.log();
        assert_eq!(log.disconnects, 3);
        assert_eq!(log.connects, 4);
    }

    #[test]
    fn test_transaction_commits_on_success() {
        let (driver, dbh) = mock_connection();

        let depth = dbh
            .transaction(|dbh| {
                assert!(dbh.in_transaction());
                Ok(dbh.transaction_depth())
            })
            .unwrap();

        assert_eq!(depth, 1);
        assert!(!dbh.in_transaction());
        let log = driver.log();
        assert_eq!(log.begins, vec![1]);
        assert_eq!(log.commits, vec![1]);
        assert!(log.rollbacks.is_empty());
    }

    #[test]
    fn test_nested_transactions_track_depth() {
        let (driver, dbh) = mock_connection();

        dbh.transaction(|outer| {
            outer.transaction(|inner| {
                assert_eq!(inner.transaction_state(), TransactionState::Transaction(2));
                Ok(())
            })?;
            assert_eq!(outer.transaction_depth(), 1);
            Ok(())
        })
        .unwrap();

        assert_eq!(dbh.transaction_depth(), 0);
        assert_eq!(driver.log().commits, vec![2, 1]);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let (driver, dbh) = mock_connection();

        let result: Result<()> = dbh.transaction(|_| Err(RdbiError::Transaction("boom".to_string())));

        assert!(matches!(result, Err(RdbiError::Transaction(_))));
        assert_eq!(dbh.transaction_depth(), 0);
        let log = driver.log();
        assert_eq!(log.rollbacks, vec![1]);
        assert!(log.commits.is_empty());
    }

    #[test]
    fn test_explicit_commit_inside_body_is_not_repeated() {
        let (driver, dbh) = mock_connection();

        dbh.transaction(|dbh| dbh.commit()).unwrap();

        assert_eq!(dbh.transaction_depth(), 0);
        assert_eq!(driver.log().commits, vec![1]);
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let (driver, dbh) = mock_connection();
        driver.fail_commit(Some("commit refused"));

        let result = dbh.transaction(|_| Ok(()));

        assert_eq!(result.unwrap_err().to_string(), "commit refused");
        assert_eq!(dbh.transaction_depth(), 0);
        assert_eq!(driver.log().rollbacks, vec![1]);
    }

    #[test]
    fn test_panicking_body_rolls_back() {
        let (driver, dbh) = mock_connection();

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _: Result<()> = dbh.transaction(|_| panic!("body panicked"));
        }));

        assert!(outcome.is_err());
        assert_eq!(dbh.transaction_depth(), 0);
        assert_eq!(driver.log().rollbacks, vec![1]);
    }

    #[test]
    fn test_prepare_with_finishes_on_error() {
        let (_driver, dbh) = mock_connection();

        let result: Result<()> = dbh.prepare_with("select 1", |sth| {
            assert!(!sth.is_finished());
            Err(RdbiError::InvalidState("caller gave up".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(dbh.open_statement_count(), 0);
        assert!(dbh.last_statement().is_none());
    }

    #[test]
    fn test_execute_with_returns_body_value() {
        let (driver, dbh) = mock_connection();
        driver.set_rows(generate_data());

        let count = dbh
            .execute_with("select * from foo", &[], |res| res.result_count())
            .unwrap();

        assert_eq!(count, 10);
        assert_eq!(dbh.open_statement_count(), 0);
    }

    #[test]
    fn test_preprocess_query_quotes_binds() {
        let (_driver, dbh) = mock_connection();

        let binds = Binds::from(vec![Value::from("it's")]);
        let query = dbh.preprocess_query("select * from foo where bar = ?", &binds).unwrap();

        assert_eq!(query, "select * from foo where bar = 'it''s'");
        assert_eq!(dbh.last_query().as_deref(), Some("select * from foo where bar = ?"));
    }
}
