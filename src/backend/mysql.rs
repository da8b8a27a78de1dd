//! MySQL-protocol backend on `mysql_async`.
//!
//! Doris frontends speak the MySQL wire protocol, so one backend covers
//! every engine build. Error classification happens here: transport
//! failures become [`QueryError::ConnectionLost`], server rejections keep
//! their code and message in [`QueryError::Rejected`].

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Row, Value};

use crate::config::ConnectionConfig;
use crate::error::{ConnectError, ConnectResult, QueryError, StatementResult};

use super::{ResultSet, SqlBackend, SqlConnection};

/// MySQL server error code for rejected credentials
const ER_ACCESS_DENIED: u16 = 1045;

/// Connection factory for the MySQL wire protocol
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlBackend;

#[async_trait]
impl SqlBackend for MysqlBackend {
    type Conn = MysqlConnection;

    async fn connect(&self, config: &ConnectionConfig) -> ConnectResult<MysqlConnection> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(config.host.clone())
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(config.database.clone());

        let conn = Conn::new(opts)
            .await
            .map_err(|e| classify_connect_error(config, e))?;

        Ok(MysqlConnection { conn })
    }
}

/// One live MySQL-protocol connection
pub struct MysqlConnection {
    conn: Conn,
}

#[async_trait]
impl SqlConnection for MysqlConnection {
    async fn execute(&mut self, sql: &str) -> StatementResult<ResultSet> {
        let mut result = self
            .conn
            .query_iter(sql)
            .await
            .map_err(classify_query_error)?;

        // Column metadata must be captured before the rows are drained;
        // it survives even for zero-row result sets.
        let columns = match result.columns() {
            Some(cols) => cols.iter().map(|c| c.name_str().into_owned()).collect(),
            None => Vec::new(),
        };

        let raw_rows: Vec<Row> = result.collect().await.map_err(classify_query_error)?;
        drop(result);

        let rows = raw_rows.into_iter().map(row_to_cells).collect();

        Ok(ResultSet { columns, rows })
    }

    async fn ping(&mut self) -> StatementResult<()> {
        self.conn.ping().await.map_err(classify_query_error)
    }

    fn server_connection_id(&self) -> u64 {
        u64::from(self.conn.id())
    }

    async fn close(self) -> StatementResult<()> {
        self.conn.disconnect().await.map_err(classify_query_error)
    }
}

fn classify_connect_error(config: &ConnectionConfig, err: mysql_async::Error) -> ConnectError {
    match err {
        mysql_async::Error::Io(io) => ConnectError::Unreachable {
            host: config.host.clone(),
            port: config.port,
            detail: io.to_string(),
        },
        mysql_async::Error::Server(server) if server.code == ER_ACCESS_DENIED => {
            ConnectError::AccessDenied {
                user: config.user.clone(),
            }
        }
        other => ConnectError::Handshake {
            detail: other.to_string(),
        },
    }
}

fn classify_query_error(err: mysql_async::Error) -> QueryError {
    match err {
        mysql_async::Error::Server(server) => QueryError::Rejected {
            code: server.code,
            message: server.message,
        },
        mysql_async::Error::Io(_) | mysql_async::Error::Driver(_) => QueryError::ConnectionLost {
            detail: err.to_string(),
        },
        other => QueryError::Other(other.to_string()),
    }
}

fn row_to_cells(mut row: Row) -> Vec<Option<String>> {
    (0..row.len())
        .map(|i| row.take::<Value, _>(i).and_then(value_to_cell))
        .collect()
}

/// Render a wire value as display text. NULL maps to `None`.
fn value_to_cell(value: Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Value::Int(v) => Some(v.to_string()),
        Value::UInt(v) => Some(v.to_string()),
        Value::Float(v) => Some(v.to_string()),
        Value::Double(v) => Some(v.to_string()),
        temporal @ (Value::Date(..) | Value::Time(..)) => {
            Some(temporal.as_sql(true).trim_matches('\'').to_string())
        }
    }
}
