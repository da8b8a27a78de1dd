//! Session management for one logical connection to the engine.
//!
//! A [`Session`] owns at most one live physical connection plus the state
//! that must survive it: current catalog and database, the discovered HTTP
//! status port, the server version and the current trace id. Reconnects
//! replace the physical connection wholesale (handle and server connection
//! id travel together) and can restore the logical state on top of the
//! fresh connection.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{MysqlBackend, ResultSet, SqlBackend, SqlConnection};
use crate::config::ConnectionConfig;
use crate::error::{ConnectResult, QueryError, StatementResult};

/// The engine's default catalog
pub const ROOT_CATALOG: &str = "internal";

const HEALTH_CHECK_ATTEMPTS: u32 = 3;
const HEALTH_CHECK_BACKOFF: Duration = Duration::from_millis(100);

/// Catalog and database captured at interrupt time, consumed by the next
/// state-preserving reconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedSessionState {
    pub catalog: Option<String>,
    pub database: Option<String>,
}

/// A physical connection and the server-assigned id that belongs to it.
/// The two are only ever replaced together.
struct LiveConnection<C> {
    conn: C,
    server_connection_id: u64,
}

/// Result of one executed statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementOutput {
    pub result: ResultSet,
    /// Trace id the statement ran under, when one was stamped
    pub trace_id: Option<String>,
}

/// One logical session against the engine
pub struct Session<B: SqlBackend> {
    backend: B,
    config: ConnectionConfig,
    live: Option<LiveConnection<B::Conn>>,
    version: Option<String>,
    http_status_port: Option<u16>,
    current_trace_id: Option<String>,
    last_known_catalog: Option<String>,
    last_known_database: Option<String>,
    saved_state: Option<SavedSessionState>,
    needs_reset: bool,
}

impl Session<MysqlBackend> {
    /// Session over the MySQL wire protocol (the production backend)
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_backend(MysqlBackend, config)
    }
}

impl<B: SqlBackend> Session<B> {
    pub fn with_backend(backend: B, config: ConnectionConfig) -> Self {
        let http_status_port = config.http_port;
        Self {
            backend,
            config,
            live: None,
            version: None,
            http_status_port,
            current_trace_id: None,
            last_known_catalog: None,
            last_known_database: None,
            saved_state: None,
            needs_reset: false,
        }
    }

    /// Open the physical connection, fetch the server version and discover
    /// the HTTP status port. The server connection id is captured from the
    /// new handle; it changes with every handshake.
    pub async fn connect(&mut self) -> ConnectResult<()> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            user = %self.config.user,
            "connecting"
        );

        let conn = self.backend.connect(&self.config).await?;
        let server_connection_id = conn.server_connection_id();
        self.live = Some(LiveConnection {
            conn,
            server_connection_id,
        });
        self.needs_reset = false;

        // A fresh connection lands in the root catalog, with the configured
        // default database selected.
        self.last_known_catalog = Some(ROOT_CATALOG.to_string());
        self.last_known_database = self.config.database.clone();

        info!(server_connection_id, "connected");

        self.version = self.fetch_version().await;
        if let Some(version) = &self.version {
            debug!(%version, "server version");
        }

        if self.http_status_port.is_none() {
            self.discover_http_status_port().await;
        }

        Ok(())
    }

    /// Close the connection. Afterwards every statement fails fast with
    /// a not-connected error until the next [`connect`](Self::connect).
    pub async fn close(&mut self) {
        if let Some(live) = self.live.take() {
            match live.conn.close().await {
                Ok(()) => info!("session closed"),
                Err(e) => debug!(error = %e, "connection close failed"),
            }
        }
        self.needs_reset = false;
        self.current_trace_id = None;
    }

    pub fn is_connected(&self) -> bool {
        self.live.is_some()
    }

    /// Probe the connection with up to three pings, backing off ~100ms
    /// between attempts. Never fails; a missing connection is unhealthy.
    pub async fn check_health(&mut self) -> bool {
        let Some(live) = self.live.as_mut() else {
            return false;
        };
        for attempt in 1..=HEALTH_CHECK_ATTEMPTS {
            match live.conn.ping().await {
                Ok(()) => return true,
                Err(e) => {
                    debug!(attempt, error = %e, "health check ping failed");
                    if attempt < HEALTH_CHECK_ATTEMPTS {
                        tokio::time::sleep(HEALTH_CHECK_BACKOFF).await;
                    }
                }
            }
        }
        false
    }

    /// Replace the physical connection. With `preserve_state` the catalog
    /// and database are restored on the fresh connection; restoration
    /// failures are logged, never raised, and the reconnect still counts
    /// as successful once the physical connect succeeded.
    pub async fn reconnect(&mut self, preserve_state: bool) -> ConnectResult<()> {
        info!(preserve_state, "reconnecting session");

        // Desired state: an explicit interrupt-time capture wins, then a
        // live read if the old handle still answers, then the caches.
        let desired = match self.saved_state.take() {
            Some(state) => state,
            None => self.capture_state_best_effort().await,
        };

        if let Some(live) = self.live.take() {
            if let Err(e) = live.conn.close().await {
                debug!(error = %e, "old connection close failed");
            }
        }

        self.connect().await?;

        if preserve_state {
            self.restore_state(desired).await;
        }
        Ok(())
    }

    /// Run one statement.
    ///
    /// With `stamp_new_trace_id` a fresh trace id is stamped into the
    /// server session context strictly before the statement is sent.
    /// Cancelling `cancel` while the statement is in flight kills it on the
    /// server through a side connection, marks the session for reset and
    /// returns [`QueryError::Cancelled`].
    pub async fn execute_statement(
        &mut self,
        sql: &str,
        stamp_new_trace_id: bool,
        cancel: &CancellationToken,
    ) -> StatementResult<StatementOutput> {
        if cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        if self.needs_reset {
            debug!("session marked for reset, reconnecting before statement");
            self.reconnect(true).await?;
        } else if self.live.is_none() {
            return Err(QueryError::NotConnected);
        } else if !self.check_health().await {
            warn!("connection unhealthy before statement, reconnecting");
            self.reconnect(true).await?;
        }

        if stamp_new_trace_id {
            self.stamp_new_trace_id().await;
        }
        let trace_id = self.current_trace_id.clone();

        let outcome = {
            let live = self.live.as_mut().ok_or(QueryError::NotConnected)?;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = live.conn.execute(sql) => Some(res),
            }
        };

        match outcome {
            None => {
                // Interrupt path: capture state, kill server-side, mark for
                // reset, propagate. Each step runs even if the previous one
                // failed.
                info!("statement interrupted, cancelling server-side");
                self.saved_state = Some(SavedSessionState {
                    catalog: self.last_known_catalog.clone(),
                    database: self.last_known_database.clone(),
                });
                if !self.cancel_current_statement().await {
                    warn!("server-side cancel did not succeed");
                }
                self.needs_reset = true;
                Err(QueryError::Cancelled)
            }
            Some(Ok(result)) => Ok(StatementOutput { result, trace_id }),
            Some(Err(e)) if e.is_connection_lost() => {
                warn!(error = %e, "connection-class failure, cleaning up");
                if let Err(re) = self.cleanup_and_reconnect().await {
                    warn!(error = %re, "reconnect after failure did not succeed");
                }
                Err(e)
            }
            Some(Err(e)) => {
                // Server rejection or another non-transport failure: the
                // session usually survives, but verify and clean up if not.
                if !self.check_health().await {
                    warn!("connection unhealthy after failed statement, cleaning up");
                    if let Err(re) = self.cleanup_and_reconnect().await {
                        warn!(error = %re, "reconnect after failure did not succeed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Generate a fresh trace id and stamp it into the server session
    /// context. The local id is updated even if the stamping statement
    /// fails; the failure is logged and execution continues untracked.
    pub async fn stamp_new_trace_id(&mut self) -> String {
        let trace_id = generate_trace_id();
        self.current_trace_id = Some(trace_id.clone());
        let stamp = format!("SET session_context = 'trace_id:{trace_id}'");
        match self.execute_raw(&stamp).await {
            Ok(_) => debug!(%trace_id, "stamped trace id"),
            Err(e) => warn!(%trace_id, error = %e, "failed to stamp trace id"),
        }
        trace_id
    }

    /// Kill whatever is running on this session's server connection id,
    /// using a dedicated side connection so a wedged primary handle is
    /// never reused. Returns false instead of raising, whatever goes wrong.
    pub async fn cancel_current_statement(&self) -> bool {
        let Some(connection_id) = self.live.as_ref().map(|l| l.server_connection_id) else {
            debug!("no server connection id known, nothing to cancel");
            return false;
        };

        info!(connection_id, "killing current statement via side connection");
        let mut side = match self.backend.connect(&self.config).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "could not open side connection for cancel");
                return false;
            }
        };

        let killed = match side.execute(&format!("KILL QUERY {connection_id}")).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "kill statement failed");
                false
            }
        };

        if let Err(e) = side.close().await {
            debug!(error = %e, "side connection close failed");
        }
        killed
    }

    /// Current catalog: live when the connection answers, cached otherwise,
    /// the root catalog as the final default.
    ///
    /// When the live read suddenly reports the root catalog while a richer
    /// value is cached, the cache wins: right after an interrupt the server
    /// may already have reset the session while the client still holds the
    /// logical state, and the cached value is the one the user meant.
    pub async fn get_current_catalog(&mut self) -> String {
        match self.read_live_catalog().await {
            Ok(live_catalog) => {
                if live_catalog == ROOT_CATALOG {
                    if let Some(cached) = self.last_known_catalog.clone() {
                        if cached != ROOT_CATALOG {
                            warn!(
                                cached = %cached,
                                "live read reports the root catalog while a richer value is \
                                 cached; preferring the cache (possible post-cancellation reset)"
                            );
                            return cached;
                        }
                    }
                }
                self.last_known_catalog = Some(live_catalog.clone());
                live_catalog
            }
            Err(e) => {
                debug!(error = %e, "live catalog read failed, using cache");
                self.last_known_catalog
                    .clone()
                    .unwrap_or_else(|| ROOT_CATALOG.to_string())
            }
        }
    }

    /// Current database: live when the connection answers, cached otherwise.
    /// `None` when no database is selected.
    pub async fn get_current_database(&mut self) -> Option<String> {
        match self.read_live_database().await {
            Ok(database) => {
                self.last_known_database = database.clone();
                database
            }
            Err(e) => {
                debug!(error = %e, "live database read failed, using cache");
                self.last_known_database.clone()
            }
        }
    }

    /// `USE` a database, updating the cached state on success
    pub async fn use_database(&mut self, database: &str) -> StatementResult<()> {
        let token = CancellationToken::new();
        self.execute_statement(&format!("USE {database}"), false, &token)
            .await?;
        self.last_known_database = Some(database.to_string());
        Ok(())
    }

    /// `SWITCH` to a catalog. The cached database is cleared: databases
    /// are per-catalog and the old selection means nothing in the new one.
    pub async fn switch_catalog(&mut self, catalog: &str) -> StatementResult<()> {
        let token = CancellationToken::new();
        self.execute_statement(&format!("SWITCH {catalog}"), false, &token)
            .await?;
        self.last_known_catalog = Some(catalog.to_string());
        self.last_known_database = None;
        Ok(())
    }

    /// Find the HTTP status port of the connected frontend. Cached after
    /// the first success. Failure is soft: log and return `None`.
    pub async fn discover_http_status_port(&mut self) -> Option<u16> {
        if let Some(port) = self.http_status_port {
            return Some(port);
        }

        let result = match self.execute_raw("SHOW FRONTENDS").await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "HTTP status port discovery failed");
                return None;
            }
        };

        match find_active_http_port(&result) {
            Some(port) => {
                info!(port, "discovered HTTP status port");
                self.http_status_port = Some(port);
                Some(port)
            }
            None => {
                warn!("no connected frontend row with a usable HTTP port");
                None
            }
        }
    }

    pub fn http_status_port(&self) -> Option<u16> {
        self.http_status_port
    }

    /// Server version string, when the post-connect fetch succeeded
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Server-assigned id of the live connection
    pub fn server_connection_id(&self) -> Option<u64> {
        self.live.as_ref().map(|l| l.server_connection_id)
    }

    pub fn current_trace_id(&self) -> Option<&str> {
        self.current_trace_id.as_deref()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn execute_raw(&mut self, sql: &str) -> StatementResult<ResultSet> {
        let live = self.live.as_mut().ok_or(QueryError::NotConnected)?;
        live.conn.execute(sql).await
    }

    /// Drop the (possibly wedged) handle first, then reconnect with state
    /// preservation. Used after connection-class failures where live reads
    /// on the old handle can no longer be trusted.
    async fn cleanup_and_reconnect(&mut self) -> ConnectResult<()> {
        if let Some(live) = self.live.take() {
            if let Err(e) = live.conn.close().await {
                debug!(error = %e, "dead connection close failed");
            }
        }
        self.reconnect(true).await
    }

    async fn capture_state_best_effort(&mut self) -> SavedSessionState {
        let mut catalog = self.last_known_catalog.clone();
        let mut database = self.last_known_database.clone();
        if self.live.is_some() {
            if let Ok(live_catalog) = self.read_live_catalog().await {
                catalog = Some(live_catalog);
            }
            if let Ok(live_database) = self.read_live_database().await {
                database = live_database;
            }
        }
        SavedSessionState { catalog, database }
    }

    /// Restore catalog then database on a fresh connection.
    ///
    /// Tie-break policy: a failed switch to a non-default catalog resets
    /// to the root catalog and clears the cached database; a failed
    /// database restore in a successfully-restored catalog clears only the
    /// cached database and logs what does exist there.
    async fn restore_state(&mut self, desired: SavedSessionState) {
        let SavedSessionState { catalog, database } = desired;

        if let Some(cat) = catalog.filter(|c| c.as_str() != ROOT_CATALOG) {
            match self.execute_raw(&format!("SWITCH {cat}")).await {
                Ok(_) => {
                    info!(catalog = %cat, "restored catalog");
                    self.last_known_catalog = Some(cat);
                }
                Err(e) => {
                    warn!(catalog = %cat, error = %e, "could not restore catalog, staying on the default");
                    self.last_known_catalog = Some(ROOT_CATALOG.to_string());
                    self.last_known_database = None;
                    return;
                }
            }
        }

        if let Some(db) = database {
            match self.execute_raw(&format!("USE {db}")).await {
                Ok(_) => {
                    info!(database = %db, "restored database");
                    self.last_known_database = Some(db);
                }
                Err(e) => {
                    warn!(database = %db, error = %e, "database no longer available after reconnect");
                    self.last_known_database = None;
                    self.log_available_databases().await;
                }
            }
        }
    }

    async fn log_available_databases(&mut self) {
        match self.execute_raw("SHOW DATABASES").await {
            Ok(result) => {
                let names: Vec<&str> = result
                    .rows
                    .iter()
                    .filter_map(|row| row.first().and_then(|c| c.as_deref()))
                    .collect();
                info!(databases = ?names, "databases available in the current catalog");
            }
            Err(e) => debug!(error = %e, "could not list databases"),
        }
    }

    async fn fetch_version(&mut self) -> Option<String> {
        match self
            .execute_raw("SHOW VARIABLES LIKE 'version_comment'")
            .await
        {
            Ok(result) => result.cell(0, "Value").map(str::to_string),
            Err(e) => {
                debug!(error = %e, "version fetch failed");
                None
            }
        }
    }

    async fn read_live_catalog(&mut self) -> StatementResult<String> {
        let result = self.execute_raw("SHOW CATALOGS").await?;
        let current = result.column_index("IsCurrent").and_then(|is_current| {
            let name = result.column_index("CatalogName")?;
            result
                .rows
                .iter()
                .find(|row| {
                    matches!(
                        row.get(is_current).and_then(|c| c.as_deref()),
                        Some(v) if v.eq_ignore_ascii_case("yes")
                    )
                })
                .and_then(|row| row.get(name)?.as_deref().map(str::to_string))
        });
        Ok(current.unwrap_or_else(|| ROOT_CATALOG.to_string()))
    }

    async fn read_live_database(&mut self) -> StatementResult<Option<String>> {
        let result = self.execute_raw("SELECT DATABASE()").await?;
        Ok(result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(Clone::clone))
    }
}

fn generate_trace_id() -> String {
    format!("dorsh_{}", Uuid::new_v4().simple())
}

/// Pick the HTTP port of the currently-connected frontend out of a
/// `SHOW FRONTENDS` result.
fn find_active_http_port(result: &ResultSet) -> Option<u16> {
    let connected_idx = result.column_index("CurrentConnected")?;
    let port_idx = result.column_index("HttpPort")?;
    result
        .rows
        .iter()
        .find(|row| {
            matches!(
                row.get(connected_idx).and_then(|c| c.as_deref()),
                Some(v) if v.eq_ignore_ascii_case("yes")
            )
        })
        .and_then(|row| row.get(port_idx)?.as_deref()?.parse().ok())
}
