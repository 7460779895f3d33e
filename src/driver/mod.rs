/// Driver Module
///
/// The seam between the core and concrete database engines. A driver supplies
/// three pieces:
/// - a [`Driver`] factory that opens sessions from [`ConnectArgs`],
/// - a [`DriverConnection`] per session that creates statements and performs
///   transaction control,
/// - a [`DriverStatement`] per prepared query that turns binds into an
///   [`Execution`] (cursor, schema and output type map).
///
/// Drivers are resolved by name through an explicit [`DriverRegistry`]. The
/// global registry ships with the `Mock` and `SQLite` drivers.

pub mod mock;
pub mod sqlite;

use crate::core::db::connection::Connection;
use crate::core::db::cursor::Cursor;
use crate::core::db::schema::Schema;
use crate::core::{RdbiError, Result, Value};
use crate::preprocess;
use crate::types::{InputTypeMap, OutputTypeMap};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// What a driver hands back from one execution
pub struct Execution {
    /// Row source for the result
    pub cursor: Box<dyn Cursor>,
    /// Shape of every row the cursor yields
    pub schema: Schema,
    /// Conversions applied on fetch, keyed by column host type
    pub type_map: OutputTypeMap,
}

impl Execution {
    /// An execution using the default output conversions
    pub fn new(cursor: Box<dyn Cursor>, schema: Schema) -> Self {
        Execution {
            cursor,
            schema,
            type_map: OutputTypeMap::output_defaults(),
        }
    }

    pub fn with_type_map(mut self, type_map: OutputTypeMap) -> Self {
        self.type_map = type_map;
        self
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Execution")
            .field("schema", &self.schema)
            .field("affected_count", &self.cursor.affected_count())
            .finish()
    }
}

/// Factory for driver sessions
pub trait Driver: Send + Sync {
    /// Name the driver is registered under
    fn name(&self) -> &str;

    /// Opens a new session
    fn connect(&self, args: &ConnectArgs) -> Result<Box<dyn DriverConnection>>;
}

/// One live driver session
///
/// Transaction hooks receive the nesting depth they act on: `begin` gets the
/// depth being entered, `commit` and `rollback` the depth being closed (0 when
/// no transaction is open).
pub trait DriverConnection: Send {
    /// Creates the driver half of a prepared statement
    fn new_statement(&mut self, query: &str) -> Result<Box<dyn DriverStatement>>;

    /// Round-trip probe; `None` when the driver cannot measure one
    fn ping(&mut self) -> Result<Option<u64>> {
        Ok(None)
    }

    fn begin(&mut self, _depth: usize) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self, _depth: usize) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self, _depth: usize) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Describes one table; `None` when it does not exist
    fn table_schema(&mut self, _table_name: &str) -> Result<Option<Schema>> {
        Err(RdbiError::Config(
            "table_schema is not implemented by this driver".to_string(),
        ))
    }

    /// Describes every table of the database
    fn schema(&mut self) -> Result<Vec<Schema>> {
        Err(RdbiError::Config(
            "schema is not implemented by this driver".to_string(),
        ))
    }

    fn database_name(&self) -> Option<String> {
        None
    }

    /// Renders a value as a literal for query preprocessing
    fn quote(&self, value: &Value) -> String {
        preprocess::quote_value(value)
    }
}

/// Driver half of a prepared statement
pub trait DriverStatement: Send {
    /// Runs the statement with already converted binds
    fn new_execution(&mut self, binds: &[Value]) -> Result<Execution>;

    /// Conversions applied to binds before `new_execution` sees them
    fn input_type_map(&self) -> InputTypeMap {
        InputTypeMap::input_defaults()
    }

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Connection parameters handed to a driver (`database`, `username`, ...)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectArgs(BTreeMap<String, String>);

impl ConnectArgs {
    pub fn new() -> Self {
        ConnectArgs(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ConnectArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        ConnectArgs(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A resolved driver plus the arguments used to open sessions with it.
///
/// Pools keep one of these as the template for lazily created connections.
#[derive(Clone)]
pub struct Connector {
    driver: Arc<dyn Driver>,
    args: ConnectArgs,
    rewindable_result: bool,
}

impl Connector {
    pub fn new(driver: Arc<dyn Driver>, args: ConnectArgs) -> Self {
        Connector {
            driver,
            args,
            rewindable_result: false,
        }
    }

    /// Resolves `driver_name` through `registry`
    pub fn by_name(registry: &DriverRegistry, driver_name: &str, args: ConnectArgs) -> Result<Self> {
        Ok(Connector::new(registry.resolve(driver_name)?, args))
    }

    /// Rewindable-result default for connections this connector opens
    pub fn with_rewindable_result(mut self, rewindable: bool) -> Self {
        self.rewindable_result = rewindable;
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    pub fn args(&self) -> &ConnectArgs {
        &self.args
    }

    pub fn rewindable_result(&self) -> bool {
        self.rewindable_result
    }

    /// Opens a new driver session
    pub(crate) fn open(&self) -> Result<Box<dyn DriverConnection>> {
        self.driver.connect(&self.args)
    }

    /// Opens a connected [`Connection`]
    pub fn connect(&self) -> Result<Arc<Connection>> {
        Connection::open(self.clone())
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("driver", &self.driver.name())
            .field("args", &self.args)
            .field("rewindable_result", &self.rewindable_result)
            .finish()
    }
}

/// Name -> driver lookup, populated by explicit registration.
///
/// Names are matched case-insensitively.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

static GLOBAL_DRIVERS: OnceCell<DriverRegistry> = OnceCell::new();

impl DriverRegistry {
    /// An empty registry
    pub fn new() -> Self {
        DriverRegistry::default()
    }

    /// A registry holding the bundled `Mock` and `SQLite` drivers
    pub fn with_builtin() -> Self {
        let registry = DriverRegistry::new();
        registry.register("Mock", Arc::new(mock::MockDriver::new()));
        registry.register("SQLite", Arc::new(sqlite::SqliteDriver));
        registry.register("SQLite3", Arc::new(sqlite::SqliteDriver));
        registry
    }

    /// The process-wide registry, created with the bundled drivers on first use
    pub fn global() -> &'static DriverRegistry {
        GLOBAL_DRIVERS.get_or_init(DriverRegistry::with_builtin)
    }

    /// Registers `driver` under `name`, returning any driver it replaces
    pub fn register(&self, name: &str, driver: Arc<dyn Driver>) -> Option<Arc<dyn Driver>> {
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_lowercase(), driver)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| RdbiError::Config(format!("unknown driver '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&name.to_lowercase())
    }

    /// Registered names (lowercased), sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Connects through the global driver registry.
///
/// # Examples
///
/// ```
/// use rdbi::driver::{connect, ConnectArgs};
///
/// let dbh = connect("SQLite", ConnectArgs::new().with("database", ":memory:")).unwrap();
/// assert!(dbh.is_connected());
/// ```
pub fn connect(driver_name: &str, args: ConnectArgs) -> Result<Arc<Connection>> {
    Connector::by_name(DriverRegistry::global(), driver_name, args)?.connect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_drivers_resolve() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.resolve("Mock").is_ok());
        assert!(registry.resolve("sqlite").is_ok());
        assert_eq!(registry.resolve("SQLITE3").unwrap().name(), "SQLite");
        assert_eq!(registry.names(), vec!["mock", "sqlite", "sqlite3"]);
    }

    #[test]
    fn test_unknown_driver_is_configuration_error() {
        let registry = DriverRegistry::new();
        match registry.resolve("Oracle") {
            Err(RdbiError::Config(msg)) => assert!(msg.contains("Oracle")),
            _ => panic!("Expected Config error"),
        }
        assert!(matches!(
            connect("NoSuchDriver", ConnectArgs::new()),
            Err(RdbiError::Config(_))
        ));
    }

    #[test]
    fn test_connect_args_builder() {
        let args = ConnectArgs::new().with("username", "foo").with("password", "bar");
        assert_eq!(args.get("username"), Some("foo"));
        assert_eq!(args.len(), 2);

        let collected: ConnectArgs = vec![("database", ":memory:")].into_iter().collect();
        assert_eq!(collected.get("database"), Some(":memory:"));
    }

    #[test]
    fn test_connector_opens_connected_handles() {
        let connector = Connector::by_name(DriverRegistry::global(), "Mock", ConnectArgs::new())
            .unwrap()
            .with_rewindable_result(true);
        let dbh = connector.connect().unwrap();

        assert!(dbh.is_connected());
        assert!(dbh.rewindable_result());
        assert_eq!(dbh.driver_name(), "Mock");
    }
}
