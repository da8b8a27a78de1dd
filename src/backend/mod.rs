//! SQL backend abstraction.
//!
//! The session talks to the engine through this narrow seam: open a
//! connection, run a statement, ping, close. Production uses the
//! MySQL-protocol implementation in [`mysql`]; tests substitute a scripted
//! in-memory backend.

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::{ConnectResult, StatementResult};

pub mod mysql;

pub use mysql::MysqlBackend;

/// One result set from a statement. Statements without a result set
/// (DDL, `USE`, ...) produce an empty column list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    /// Row cells in column order; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
}

impl ResultSet {
    /// True when the statement produced no result set at all
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Index of a column by name, case-insensitive
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }

    /// Cell value by row index and column name, case-insensitive
    pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.get(idx)?.as_deref()
    }
}

/// Factory for physical connections
#[async_trait]
pub trait SqlBackend: Send + Sync {
    type Conn: SqlConnection;

    /// Open a new physical connection with the given settings
    async fn connect(&self, config: &ConnectionConfig) -> ConnectResult<Self::Conn>;
}

/// A live physical connection
#[async_trait]
pub trait SqlConnection: Send {
    /// Run one statement and collect its first result set
    async fn execute(&mut self, sql: &str) -> StatementResult<ResultSet>;

    /// Liveness probe
    async fn ping(&mut self) -> StatementResult<()>;

    /// Server-assigned id of this connection, the `KILL QUERY` target.
    /// Assigned per handshake; a new connection gets a new id.
    fn server_connection_id(&self) -> u64;

    /// Close the connection cleanly
    async fn close(self) -> StatementResult<()>;
}
