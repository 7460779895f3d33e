/// RDBI Error Module
///
/// This module defines the error type shared by every layer of the crate:
/// pools, connections, statements, results, cursors and formatters.
/// Driver failures are carried through unmodified so their diagnostics survive.
use thiserror::Error;

/// Comprehensive error type for RDBI.
///
/// This enum covers the error kinds a caller can observe:
/// - Misuse of finished handles and non-rewindable cursors
/// - Pool capacity and configuration problems
/// - Failures surfaced by the underlying driver
/// - Formatter and serialization failures
#[derive(Error, Debug)]
pub enum RdbiError {
    /// Operating on a finished statement, result or cursor, or rewinding a stream
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Adding a connection to a pool that is already full
    #[error("Capacity error: {0}")]
    Capacity(String),

    /// Invalid driver specification or pool configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors raised by the bundled SQLite driver
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Opaque errors raised by any other driver, displayed as-is
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// Transaction protocol misuse
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Row shape does not match the schema, or a column lookup failed
    #[error("Schema error: {0}")]
    Schema(String),

    /// A placeholder in a preprocessed query had no matching bind
    #[error("Bind error: {0}")]
    Bind(String),

    /// Result formatter failures
    #[error("Format error: {0}")]
    Format(String),

    /// File system and I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Configuration file parsing errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RdbiError {
    /// Wraps an arbitrary driver error without altering it.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        RdbiError::Driver(Box::new(err))
    }

    /// Builds an `InvalidState` error for a lock whose holder panicked.
    pub(crate) fn poisoned(what: &str) -> Self {
        RdbiError::InvalidState(format!("{} lock poisoned by a panicking thread", what))
    }

    /// Returns true when the error originated in a driver.
    pub fn is_driver_error(&self) -> bool {
        matches!(self, RdbiError::Database(_) | RdbiError::Driver(_))
    }
}

/// Type alias for Result to use RdbiError as the error type.
pub type Result<T> = std::result::Result<T, RdbiError>;
