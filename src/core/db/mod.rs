/// Database Module
///
/// This module provides the database-independent layer of RDBI, organized
/// into focused submodules.
///
/// ## Architecture
///
/// - **Pools** (`pool.rs`): Named, fixed-capacity sets of connections handed out round-robin
/// - **Connections** (`connection.rs`): One session; statement tracking and nested transactions
/// - **Statements** (`statement.rs`): Prepared queries with an open -> finished lifecycle
/// - **Results** (`query.rs`): Schema, binds and a cursor behind a pluggable formatter
/// - **Cursors** (`cursor.rs`): Array-backed and streaming row sources
/// - **Schema** (`schema.rs`): Column metadata that drives output type conversion
///
/// ## Locking
///
/// Pools, connections and statements each guard their state with a mutex.
/// When two are needed the statement lock is always taken before the
/// connection lock, and no connection method runs driver statement code while
/// holding its own lock.
///
/// ## Error Handling
///
/// All operations return the crate-wide `RdbiError`; driver failures pass
/// through unmodified.
pub mod connection;
pub mod cursor;
pub mod pool;
pub mod query;
pub mod schema;
pub mod statement;

pub use connection::*;
pub use cursor::*;
pub use pool::*;
pub use query::*;
pub use schema::{Column, HostType, Schema};
pub use statement::*;
