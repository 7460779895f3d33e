/// # Test Utilities Module
///
/// Shared fixtures for the unit tests: a scriptable mock connection, a
/// standard data set, and tracing output for debugging failures.

use crate::core::db::connection::Connection;
use crate::core::{Row, Value};
use crate::driver::mock::MockDriver;
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Routes tracing output to the test harness (honors `RUST_LOG`).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A fresh mock driver and a connection opened through it.
///
/// Each call gets its own driver, so scripted behavior never leaks between
/// tests.
pub fn mock_connection() -> (MockDriver, Arc<Connection>) {
    init_tracing();
    let driver = MockDriver::new();
    let dbh = driver
        .connector()
        .connect()
        .expect("mock driver connects");
    (driver, dbh)
}

/// Ten rows of `[i - 5, i]` for `i` in `0..10`
pub fn generate_data() -> Vec<Row> {
    (0..10)
        .map(|i: i64| vec![Value::Integer(i - 5), Value::Integer(i)])
        .collect()
}
