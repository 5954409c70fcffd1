//! Error types for parish-sync.

use std::fmt;
use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error carried by store failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which kind of write statement failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert-or-update of a batch of rows
    Upsert,
    /// Delete by key of a batch of ids
    Delete,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOp::Upsert => write!(f, "upsert"),
            WriteOp::Delete => write!(f, "delete"),
        }
    }
}

/// Main error type for parish-sync operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message
        message: String,
        /// Source error if any
        #[source]
        source: Option<BoxError>,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Could not open a store connection
    #[error("Connection error on {store} store: {message}")]
    Connection {
        /// Store label
        store: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxError>,
    },

    /// Snapshot fetch failed (connection loss, query fault or timeout)
    #[error("Read error on {store} table '{table}': {message}")]
    Read {
        /// Store label
        store: String,
        /// Table name
        table: String,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxError>,
    },

    /// A store's column set disagrees with the expected one (the source's
    /// columns, or the configured contract)
    #[error(
        "Schema mismatch on {store} table '{table}': missing columns {missing:?}, unexpected columns {unexpected:?}"
    )]
    SchemaMismatch {
        /// Table name
        table: String,
        /// Label of the store whose columns were checked
        store: String,
        /// Expected columns the checked store lacks
        missing: Vec<String>,
        /// Columns the checked store has that were not expected
        unexpected: Vec<String>,
    },

    /// Upsert or delete statement failed
    #[error("Write error on {store} table '{table}' during {operation}: {message}")]
    Write {
        /// Store label
        store: String,
        /// Table name
        table: String,
        /// Failed operation
        operation: WriteOp,
        /// Error message
        message: String,
        /// Source error
        #[source]
        source: Option<BoxError>,
    },

    /// A run is already in flight on this service
    #[error("A sync run is already in progress")]
    Busy,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source.
    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a connection error.
    pub fn connection(
        store: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            store: store.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a read error with a source.
    pub fn read(
        store: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Read {
            store: store.into(),
            table: table.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a read error without a source (bad data, missing table).
    pub fn read_msg(
        store: impl Into<String>,
        table: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Read {
            store: store.into(),
            table: table.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a write error with a source.
    pub fn write(
        store: impl Into<String>,
        table: impl Into<String>,
        operation: WriteOp,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Write {
            store: store.into(),
            table: table.into(),
            operation,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a write error without a source.
    pub fn write_msg(
        store: impl Into<String>,
        table: impl Into<String>,
        operation: WriteOp,
        message: impl Into<String>,
    ) -> Self {
        Self::Write {
            store: store.into(),
            table: table.into(),
            operation,
            message: message.into(),
            source: None,
        }
    }

    /// Create a schema mismatch error. Column lists are sorted.
    pub fn schema_mismatch(
        table: impl Into<String>,
        store: impl Into<String>,
        mut missing: Vec<String>,
        mut unexpected: Vec<String>,
    ) -> Self {
        missing.sort();
        unexpected.sort();
        Self::SchemaMismatch {
            table: table.into(),
            store: store.into(),
            missing,
            unexpected,
        }
    }

    /// Check if rerunning the whole controller may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Read { .. } | Error::Busy | Error::Io(_)
        )
    }

    /// Get the error code for metrics/logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "CONFIG_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Connection { .. } => "CONNECTION_ERROR",
            Error::Read { .. } => "READ_ERROR",
            Error::SchemaMismatch { .. } => "SCHEMA_MISMATCH",
            Error::Write { .. } => "WRITE_ERROR",
            Error::Busy => "BUSY",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Table the error is attached to, if any.
    pub fn table(&self) -> Option<&str> {
        match self {
            Error::Read { table, .. }
            | Error::SchemaMismatch { table, .. }
            | Error::Write { table, .. } => Some(table),
            _ => None,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(e: validator::ValidationErrors) -> Self {
        Error::validation(format!("Config validation failed: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::config("test").code(), "CONFIG_ERROR");
        assert_eq!(Error::validation("test").code(), "VALIDATION_ERROR");
        assert_eq!(
            Error::schema_mismatch("families", "primary", vec![], vec!["photo".into()]).code(),
            "SCHEMA_MISMATCH"
        );
        assert_eq!(
            Error::write_msg("primary", "members", WriteOp::Delete, "boom").code(),
            "WRITE_ERROR"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(Error::read_msg("replica", "users", "connection reset").is_retryable());
        assert!(!Error::config("test").is_retryable());
        assert!(!Error::schema_mismatch("users", "replica", vec!["a".into()], vec![]).is_retryable());
        assert!(!Error::write_msg("primary", "users", WriteOp::Upsert, "fk").is_retryable());
    }

    #[test]
    fn test_schema_mismatch_sorts_and_formats() {
        let err = Error::schema_mismatch(
            "families",
            "primary",
            vec!["zone".into(), "address".into()],
            vec![],
        );
        let msg = err.to_string();
        assert!(msg.contains("primary table 'families'"));
        assert!(msg.contains(r#"missing columns ["address", "zone"]"#));
        assert_eq!(err.table(), Some("families"));
    }

    #[test]
    fn test_write_error_names_operation() {
        let err = Error::write_msg("replica", "anbiyam", WriteOp::Delete, "fk violation");
        assert!(err.to_string().contains("during delete"));
    }
}
