/// Core Module for RDBI
///
/// This module contains the fundamental components of the crate: the shared
/// error type, the host-side value model, and the database layer (pools,
/// connections, statements, results, cursors and schemas).

pub mod db;
pub mod error;
pub mod value;

// Re-export commonly used types for convenience
pub use error::{RdbiError, Result};
pub use value::{Row, Value, ValueKind, DEFAULT_DATETIME_FORMAT};
