// RDBI: a uniform database access layer.
//
// Connection pools hand out connections; connections prepare statements and
// run nested transactions; statements produce results whose rows come from a
// cursor and are shaped by a pluggable formatter. Concrete databases plug in
// through the [`driver`] traits.

// Core infrastructure modules
pub mod config;
pub mod core;
pub mod types;

// Driver seam and result shaping
pub mod driver;
pub mod formatter;
pub mod preprocess;

#[cfg(test)]
mod test_utils;

pub use crate::core::db::{
    ArrayCursor, Column, Connection, Cursor, Fetch, HostType, Pool, PoolRegistry, QueryResult,
    Schema, Statement, StreamCursor, TransactionState,
};
pub use crate::core::{RdbiError, Result, Row, Value, ValueKind};
pub use driver::{connect, ConnectArgs, Connector, Driver, DriverRegistry};
pub use formatter::{Formatted, FormatterKind, Record, ResultFormatter};
