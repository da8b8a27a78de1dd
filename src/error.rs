//! `dorsh` Error Types
//!
//! Centralized error handling using thiserror for type-safe errors.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for `dorsh`
#[derive(Error, Debug)]
pub enum DorshError {
    #[error("Connection error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Export error: {0}")]
    Export(#[from] ExportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors opening a session
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Cannot reach {host}:{port}: {detail}")]
    Unreachable {
        host: String,
        port: u16,
        detail: String,
    },

    #[error("Access denied for user '{user}'")]
    AccessDenied { user: String },

    #[error("Connection handshake failed: {detail}")]
    Handshake { detail: String },
}

/// Errors executing a statement on an established session
#[derive(Error, Debug)]
pub enum QueryError {
    /// Connection-class failure mid-statement. The session cleans up and
    /// reconnects once; the statement itself is retriable by the caller.
    #[error("Connection lost while executing statement: {detail}")]
    ConnectionLost { detail: String },

    /// The server rejected the statement. The session stays up.
    #[error("Statement rejected by server (code {code}): {message}")]
    Rejected { code: u16, message: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Statement cancelled")]
    Cancelled,

    #[error("Reconnect failed: {0}")]
    ReconnectFailed(#[from] ConnectError),

    #[error("Query failed: {0}")]
    Other(String),
}

impl QueryError {
    /// True for failures that indicate the physical connection is gone
    /// (as opposed to the server rejecting the statement).
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, QueryError::ConnectionLost { .. })
    }
}

/// Progress fetch failures. Never fatal to the statement; the `Display`
/// form is carried on the progress snapshot as a one-line diagnosis.
#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Request timeout")]
    Timeout,

    #[error("Connection error to {host}:{port}")]
    Connection { host: String, port: u16 },

    #[error("Authentication failed (HTTP {status}). Please check username and password.")]
    AuthFailed { status: u16 },

    #[error("HTTP error {status}: {snippet}")]
    Http { status: u16, snippet: String },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("Invalid JSON response: {snippet}")]
    MalformedBody { snippet: String },

    #[error("Progress request failed: {0}")]
    Other(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {reason}")]
    ReadFailed { path: PathBuf, reason: String },

    #[error("Failed to parse config file '{path}': {reason}")]
    ParseFailed { path: PathBuf, reason: String },

    #[error("Failed to write config file '{path}': {reason}")]
    WriteFailed { path: PathBuf, reason: String },

    #[error("Failed to serialize configuration: {0}")]
    SerializeFailed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result type alias for `dorsh` operations
pub type Result<T> = std::result::Result<T, DorshError>;

/// Result type alias for session-opening operations
pub type ConnectResult<T> = std::result::Result<T, ConnectError>;

/// Result type alias for statement execution
pub type StatementResult<T> = std::result::Result<T, QueryError>;

/// Result type alias for progress fetches
pub type ProgressResult<T> = std::result::Result<T, ProgressError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for export operations
pub type ExportResult<T> = std::result::Result<T, ExportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProgressError::AuthFailed { status: 401 };
        assert_eq!(
            err.to_string(),
            "Authentication failed (HTTP 401). Please check username and password."
        );

        let err = QueryError::Rejected {
            code: 1064,
            message: "syntax error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Statement rejected by server (code 1064): syntax error"
        );
    }

    #[test]
    fn test_error_conversion() {
        let query_err = QueryError::ConnectionLost {
            detail: "broken pipe".to_string(),
        };
        let dorsh_err: DorshError = query_err.into();
        assert!(matches!(dorsh_err, DorshError::Query(_)));
    }

    #[test]
    fn test_connection_lost_classification() {
        let lost = QueryError::ConnectionLost {
            detail: "io".to_string(),
        };
        let rejected = QueryError::Rejected {
            code: 1045,
            message: "denied".to_string(),
        };
        assert!(lost.is_connection_lost());
        assert!(!rejected.is_connection_lost());
        assert!(!QueryError::Cancelled.is_connection_lost());
    }
}
