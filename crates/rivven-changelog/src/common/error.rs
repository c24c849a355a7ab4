//! Error types for change-log capture
//!
//! Every failure in the capture core aborts the in-progress interval and is
//! surfaced with enough context (source, statement, position) for triage.
//! Includes error classification for retry decisions and alerting.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Backend administrative / catalog errors
    Database,
    /// Change stream read errors
    Replication,
    /// Schema-related errors (drift, type mapping)
    Schema,
    /// Statement parsing errors (redo SQL)
    Parse,
    /// Configuration errors (invalid settings)
    Configuration,
    /// Network errors (connection, timeout)
    Network,
    /// Serialization errors (JSON)
    Serialization,
    /// Other/unknown errors
    Other,
}

/// Change capture errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Enumerating capture-enabled sources failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// A source's range query failed while merging an interval
    #[error("Stream read error on '{origin}': {message}")]
    StreamRead { origin: String, message: String },

    /// A redo statement did not match the expected grammar
    #[error("Unparsable statement{}: {reason}: {statement}", position_suffix(.position))]
    UnparsableStatement {
        reason: String,
        statement: String,
        position: Option<String>,
    },

    /// Captured column layout disagrees with the values read
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Exclusive table lock could not be acquired in time
    #[error("Timed out after {timeout_ms}ms acquiring exclusive lock on '{table}'")]
    LockTimeout { table: String, timeout_ms: u64 },

    /// Malformed or out-of-order log position
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// The event sink went away before acknowledging a record
    #[error("Sink closed: {0}")]
    SinkClosed(String),

    /// Schema inference / value conversion error
    #[error("Schema error: {0}")]
    Schema(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection refused
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

fn position_suffix(position: &Option<String>) -> String {
    match position {
        Some(pos) => format!(" at {}", pos),
        None => String::new(),
    }
}

impl CdcError {
    /// Create a new discovery error
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a new stream read error tagged with the offending source
    pub fn stream_read(origin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::StreamRead {
            origin: origin.into(),
            message: msg.into(),
        }
    }

    /// Create a new unparsable statement error
    pub fn unparsable(reason: impl Into<String>, statement: impl Into<String>) -> Self {
        Self::UnparsableStatement {
            reason: reason.into(),
            statement: statement.into(),
            position: None,
        }
    }

    /// Create a new schema mismatch error
    pub fn schema_mismatch(msg: impl Into<String>) -> Self {
        Self::SchemaMismatch(msg.into())
    }

    /// Create a new lock timeout error
    pub fn lock_timeout(table: impl Into<String>, timeout: Duration) -> Self {
        Self::LockTimeout {
            table: table.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create a new invalid position error
    pub fn invalid_position(msg: impl Into<String>) -> Self {
        Self::InvalidPosition(msg.into())
    }

    /// Create a new sink closed error
    pub fn sink_closed(msg: impl Into<String>) -> Self {
        Self::SinkClosed(msg.into())
    }

    /// Create a new schema error
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a connection refused error
    pub fn connection_refused(msg: impl Into<String>) -> Self {
        Self::ConnectionRefused(msg.into())
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Attach the originating log position to a parse error.
    ///
    /// Other variants are returned unchanged.
    pub fn at_position(self, pos: impl std::fmt::Display) -> Self {
        match self {
            Self::UnparsableStatement {
                reason, statement, ..
            } => Self::UnparsableStatement {
                reason,
                statement,
                position: Some(pos.to_string()),
            },
            other => other,
        }
    }

    /// Check if this error is retriable.
    ///
    /// Retriable errors abort the interval; the caller restarts it from the
    /// last committed offset. Parse and schema errors are data-integrity
    /// failures and are never retried.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Discovery(_) => true,
            Self::StreamRead { .. } => true,
            Self::LockTimeout { .. } => true,
            Self::ConnectionClosed => true,
            Self::ConnectionRefused(_) => true,
            Self::Timeout(_) => true,

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::UnparsableStatement { .. }
            | Self::SchemaMismatch(_)
            | Self::InvalidPosition(_)
            | Self::SinkClosed(_)
            | Self::Schema(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidState(_)
            | Self::Other(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Discovery(_) => ErrorCategory::Database,
            Self::LockTimeout { .. } => ErrorCategory::Database,
            Self::StreamRead { .. } => ErrorCategory::Replication,
            Self::InvalidPosition(_) => ErrorCategory::Replication,
            Self::SinkClosed(_) => ErrorCategory::Replication,
            Self::UnparsableStatement { .. } => ErrorCategory::Parse,
            Self::SchemaMismatch(_) => ErrorCategory::Schema,
            Self::Schema(_) => ErrorCategory::Schema,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Timeout(_) => ErrorCategory::Network,
            Self::ConnectionClosed => ErrorCategory::Network,
            Self::ConnectionRefused(_) => ErrorCategory::Network,
            Self::Io(_) => ErrorCategory::Network,
            Self::Json(_) => ErrorCategory::Serialization,
            Self::InvalidState(_) => ErrorCategory::Other,
            Self::Other(_) => ErrorCategory::Other,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Discovery(_) => "discovery_error",
            Self::StreamRead { .. } => "stream_read_error",
            Self::UnparsableStatement { .. } => "unparsable_statement",
            Self::SchemaMismatch(_) => "schema_mismatch",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::InvalidPosition(_) => "invalid_position",
            Self::SinkClosed(_) => "sink_closed",
            Self::Schema(_) => "schema_error",
            Self::Config(_) => "config_error",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionRefused(_) => "connection_refused",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::InvalidState(_) => "invalid_state",
            Self::Other(_) => "unknown",
        }
    }
}

/// Result type for change capture operations
pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CdcError::stream_read("dbo.orders", "connection reset");
        assert!(err.to_string().contains("dbo.orders"));
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_unparsable_carries_position() {
        let err = CdcError::unparsable("missing table", "delete from;").at_position("42");
        let msg = err.to_string();
        assert!(msg.contains("at 42"));
        assert!(msg.contains("delete from;"));

        let err = CdcError::unparsable("missing table", "delete from;");
        assert!(!err.to_string().contains(" at "));
    }

    #[test]
    fn test_at_position_leaves_other_variants() {
        let err = CdcError::discovery("boom").at_position("1");
        assert!(matches!(err, CdcError::Discovery(_)));
    }

    #[test]
    fn test_error_is_retriable() {
        assert!(CdcError::discovery("sp_cdc_help failed").is_retriable());
        assert!(CdcError::stream_read("dbo.t", "eof").is_retriable());
        assert!(CdcError::lock_timeout("dbo.t", Duration::from_secs(1)).is_retriable());
        assert!(CdcError::ConnectionClosed.is_retriable());

        assert!(!CdcError::unparsable("x", "y").is_retriable());
        assert!(!CdcError::schema_mismatch("3 != 4").is_retriable());
        assert!(!CdcError::invalid_position("short").is_retriable());
        assert!(!CdcError::config("bad").is_retriable());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            CdcError::discovery("x").category(),
            ErrorCategory::Database
        );
        assert_eq!(
            CdcError::stream_read("s", "x").category(),
            ErrorCategory::Replication
        );
        assert_eq!(CdcError::unparsable("x", "y").category(), ErrorCategory::Parse);
        assert_eq!(
            CdcError::schema_mismatch("x").category(),
            ErrorCategory::Schema
        );
        assert_eq!(CdcError::timeout("x").category(), ErrorCategory::Network);
    }

    #[test]
    fn test_error_code() {
        assert_eq!(CdcError::discovery("x").error_code(), "discovery_error");
        assert_eq!(
            CdcError::lock_timeout("t", Duration::from_millis(5)).error_code(),
            "lock_timeout"
        );
        assert_eq!(CdcError::sink_closed("x").error_code(), "sink_closed");
    }

    #[test]
    fn test_lock_timeout_message() {
        let err = CdcError::lock_timeout("dbo.users", Duration::from_millis(1500));
        assert_eq!(
            err.to_string(),
            "Timed out after 1500ms acquiring exclusive lock on 'dbo.users'"
        );
    }
}
