//! Scripted in-memory backend shared by the integration tests.
//!
//! [`FakeServer`] stands in for a frontend: it hands out connections with
//! fresh server connection ids, answers the discovery statements the
//! session sends, tracks per-connection catalog and database, and records
//! every statement and every `KILL QUERY` it receives. Tests steer it by
//! mutating the shared [`ServerState`]: breaking connections, removing
//! catalogs, failing future connects.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dorsh::backend::{ResultSet, SqlBackend, SqlConnection};
use dorsh::config::ConnectionConfig;
use dorsh::error::{ConnectError, ConnectResult, QueryError, StatementResult};

/// SQL this long in a `SELECT SLEEP(...)` keeps the statement in flight
/// for cancellation tests. Paused-time tests jump over it instantly.
pub const SLEEP_STATEMENT: &str = "SELECT SLEEP(30)";
const SLEEP_DURATION: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct ServerState {
    /// Catalog name to the databases it contains
    pub catalogs: BTreeMap<String, BTreeSet<String>>,
    /// Next server connection id to hand out
    pub next_connection_id: u64,
    /// Number of handshakes served so far
    pub connects: u64,
    /// Remaining connect attempts to reject
    pub fail_connects: u32,
    /// Connection ids whose handles should behave as broken
    pub dead: BTreeSet<u64>,
    /// Every statement received, in arrival order, across all connections
    pub executed: Vec<String>,
    /// `KILL QUERY` targets received
    pub killed: Vec<u64>,
    /// HTTP port reported by `SHOW FRONTENDS`; `None` reports no
    /// connected frontend row
    pub http_port: Option<u16>,
    /// When set, `SHOW CATALOGS` reports this as current regardless of
    /// the connection's own state
    pub force_current_catalog: Option<String>,
    pub version: String,
}

impl ServerState {
    /// Statements whose text contains `needle`
    pub fn executed_matching(&self, needle: &str) -> Vec<String> {
        self.executed
            .iter()
            .filter(|sql| sql.contains(needle))
            .cloned()
            .collect()
    }
}

#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    /// A server with an `internal` catalog holding `demo` and `sales`,
    /// a `hive` catalog holding `warehouse`, and a connected frontend
    /// on HTTP port 8030.
    pub fn new() -> Self {
        let mut catalogs = BTreeMap::new();
        catalogs.insert(
            "internal".to_string(),
            BTreeSet::from(["demo".to_string(), "sales".to_string()]),
        );
        catalogs.insert(
            "hive".to_string(),
            BTreeSet::from(["warehouse".to_string()]),
        );
        Self {
            state: Arc::new(Mutex::new(ServerState {
                catalogs,
                next_connection_id: 1,
                connects: 0,
                fail_connects: 0,
                dead: BTreeSet::new(),
                executed: Vec::new(),
                killed: Vec::new(),
                http_port: Some(8030),
                force_current_catalog: None,
                version: "doris-2.1.0-test".to_string(),
            })),
        }
    }

    /// Shared handle onto the server's state, for steering and asserting
    pub fn state(&self) -> Arc<Mutex<ServerState>> {
        Arc::clone(&self.state)
    }
}

impl Default for FakeServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SqlBackend for FakeServer {
    type Conn = FakeConn;

    async fn connect(&self, config: &ConnectionConfig) -> ConnectResult<FakeConn> {
        let mut state = self.state.lock().unwrap();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(ConnectError::Unreachable {
                host: config.host.clone(),
                port: config.port,
                detail: "scripted connect failure".to_string(),
            });
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connects += 1;

        // The handshake selects the configured database, as the wire
        // protocol does, but only if it exists in the root catalog.
        let database = config.database.clone().filter(|db| {
            state
                .catalogs
                .get("internal")
                .is_some_and(|dbs| dbs.contains(db))
        });

        Ok(FakeConn {
            id,
            catalog: "internal".to_string(),
            database,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct FakeConn {
    id: u64,
    catalog: String,
    database: Option<String>,
    state: Arc<Mutex<ServerState>>,
}

enum Dispatch {
    Reply(StatementResult<ResultSet>),
    Sleep,
}

impl FakeConn {
    fn dispatch(&mut self, sql: &str) -> Dispatch {
        let mut state = self.state.lock().unwrap();

        if state.dead.contains(&self.id) {
            return Dispatch::Reply(Err(QueryError::ConnectionLost {
                detail: "scripted broken connection".to_string(),
            }));
        }

        state.executed.push(sql.to_string());
        let upper = sql.trim().to_uppercase();

        if upper.starts_with("SELECT SLEEP(") {
            return Dispatch::Sleep;
        }

        if upper.starts_with("KILL QUERY") {
            let target = sql
                .trim()
                .rsplit(' ')
                .next()
                .and_then(|t| t.parse::<u64>().ok());
            return Dispatch::Reply(match target {
                Some(id) => {
                    state.killed.push(id);
                    Ok(ResultSet::default())
                }
                None => Err(QueryError::Rejected {
                    code: 1064,
                    message: format!("bad kill target in '{sql}'"),
                }),
            });
        }

        if upper.starts_with("SET SESSION_CONTEXT") {
            return Dispatch::Reply(Ok(ResultSet::default()));
        }

        if upper.starts_with("SHOW VARIABLES LIKE 'VERSION_COMMENT'") {
            return Dispatch::Reply(Ok(ResultSet {
                columns: vec!["Variable_name".to_string(), "Value".to_string()],
                rows: vec![vec![
                    Some("version_comment".to_string()),
                    Some(state.version.clone()),
                ]],
            }));
        }

        if upper.starts_with("SELECT DATABASE()") {
            return Dispatch::Reply(Ok(ResultSet {
                columns: vec!["DATABASE()".to_string()],
                rows: vec![vec![self.database.clone()]],
            }));
        }

        if upper.starts_with("SHOW CATALOGS") {
            let current = state
                .force_current_catalog
                .clone()
                .unwrap_or_else(|| self.catalog.clone());
            let rows = state
                .catalogs
                .keys()
                .map(|name| {
                    let is_current = if *name == current { "Yes" } else { "No" };
                    vec![Some(name.clone()), Some(is_current.to_string())]
                })
                .collect();
            return Dispatch::Reply(Ok(ResultSet {
                columns: vec!["CatalogName".to_string(), "IsCurrent".to_string()],
                rows,
            }));
        }

        if upper.starts_with("SHOW DATABASES") {
            let rows = state
                .catalogs
                .get(&self.catalog)
                .map(|dbs| {
                    dbs.iter()
                        .map(|db| vec![Some(db.clone())])
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            return Dispatch::Reply(Ok(ResultSet {
                columns: vec!["Database".to_string()],
                rows,
            }));
        }

        if upper.starts_with("SHOW FRONTENDS") {
            let (port, connected) = match state.http_port {
                Some(port) => (port.to_string(), "Yes"),
                None => ("8030".to_string(), "No"),
            };
            return Dispatch::Reply(Ok(ResultSet {
                columns: vec![
                    "Name".to_string(),
                    "Host".to_string(),
                    "HttpPort".to_string(),
                    "CurrentConnected".to_string(),
                ],
                rows: vec![vec![
                    Some("fe_test".to_string()),
                    Some("127.0.0.1".to_string()),
                    Some(port),
                    Some(connected.to_string()),
                ]],
            }));
        }

        if let Some(db) = strip_command(sql, "USE") {
            let known = state
                .catalogs
                .get(&self.catalog)
                .is_some_and(|dbs| dbs.contains(&db));
            return Dispatch::Reply(if known {
                self.database = Some(db);
                Ok(ResultSet::default())
            } else {
                Err(QueryError::Rejected {
                    code: 1049,
                    message: format!("Unknown database '{db}'"),
                })
            });
        }

        if let Some(catalog) = strip_command(sql, "SWITCH") {
            return Dispatch::Reply(if state.catalogs.contains_key(&catalog) {
                self.catalog = catalog;
                self.database = None;
                Ok(ResultSet::default())
            } else {
                Err(QueryError::Rejected {
                    code: 1105,
                    message: format!("Unknown catalog '{catalog}'"),
                })
            });
        }

        if upper.starts_with("FAIL") {
            return Dispatch::Reply(Err(QueryError::Rejected {
                code: 1064,
                message: "You have an error in your SQL syntax".to_string(),
            }));
        }

        if upper.starts_with("BREAK CONNECTION") {
            state.dead.insert(self.id);
            return Dispatch::Reply(Err(QueryError::ConnectionLost {
                detail: "scripted mid-statement disconnect".to_string(),
            }));
        }

        // Anything else: a one-cell result echoing the statement
        Dispatch::Reply(Ok(ResultSet {
            columns: vec!["result".to_string()],
            rows: vec![vec![Some(sql.trim().to_string())]],
        }))
    }
}

#[async_trait]
impl SqlConnection for FakeConn {
    async fn execute(&mut self, sql: &str) -> StatementResult<ResultSet> {
        match self.dispatch(sql) {
            Dispatch::Reply(reply) => reply,
            Dispatch::Sleep => {
                tokio::time::sleep(SLEEP_DURATION).await;
                Ok(ResultSet {
                    columns: vec!["sleep".to_string()],
                    rows: vec![vec![Some("0".to_string())]],
                })
            }
        }
    }

    async fn ping(&mut self) -> StatementResult<()> {
        let state = self.state.lock().unwrap();
        if state.dead.contains(&self.id) {
            Err(QueryError::ConnectionLost {
                detail: "scripted broken connection".to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn server_connection_id(&self) -> u64 {
        self.id
    }

    async fn close(self) -> StatementResult<()> {
        Ok(())
    }
}

/// `"use demo"` with command `USE` yields `Some("demo")`
fn strip_command(sql: &str, command: &str) -> Option<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let mut words = trimmed.split_whitespace();
    let first = words.next()?;
    if !first.eq_ignore_ascii_case(command) {
        return None;
    }
    let argument = words.next()?;
    words.next().is_none().then(|| argument.to_string())
}

/// Connection settings pointing at the fake server
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        host: "testhost".to_string(),
        port: 9030,
        user: "root".to_string(),
        password: String::new(),
        database: None,
        http_port: None,
    }
}
