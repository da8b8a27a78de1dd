//! Progress tracking for in-flight statements.
//!
//! While a statement runs, a background task polls the frontend's progress
//! REST endpoint once per second, keyed by the statement's trace id, and
//! renders one overwriting status line. A two-second warmup keeps fast
//! statements silent. When no endpoint is reachable the tracker runs
//! against a synthetic progress source instead, so the display pipeline
//! stays exercised end to end.

use std::fmt;
use std::io::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProgressError, ProgressResult};

/// Grace period before the first poll; fast statements render nothing
pub const WARMUP_PERIOD: Duration = Duration::from_secs(2);
/// The warmup is waited out in short slices so stopping stays responsive
const WARMUP_SLICE: Duration = Duration::from_millis(100);
/// Interval between polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Timeout for a single progress fetch
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// Bound on waiting for the poll task to wind down
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Width of the wipe that clears the previous status line
const WIPE_WIDTH: usize = 150;
/// Error text longer than this is truncated in the status line
const ERROR_DISPLAY_LIMIT: usize = 50;

/// Server-side state of the tracked query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Running,
    Finished,
    Unknown,
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Running => write!(f, "RUNNING"),
            QueryState::Finished => write!(f, "FINISHED"),
            QueryState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Lifecycle of the tracker itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Created,
    Warmup,
    Polling,
    Stopped,
}

/// Latest known progress of the tracked statement.
///
/// Numeric fields survive failed fetches; only a successful fetch
/// overwrites them. A failed fetch records its diagnosis in `last_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub query_state: QueryState,
    pub scanned_rows: Option<u64>,
    pub scanned_bytes: Option<u64>,
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
    /// Server-side elapsed time, reported by the mock source only
    pub elapsed_seconds: Option<f64>,
    pub last_error: Option<String>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            query_state: QueryState::Unknown,
            scanned_rows: None,
            scanned_bytes: None,
            cpu_millis: None,
            memory_bytes: None,
            elapsed_seconds: None,
            last_error: None,
        }
    }
}

impl ProgressSnapshot {
    fn apply(&mut self, update: ProgressUpdate) {
        self.query_state = update.query_state;
        self.scanned_rows = Some(update.scanned_rows);
        self.scanned_bytes = Some(update.scanned_bytes);
        self.cpu_millis = Some(update.cpu_millis);
        self.memory_bytes = Some(update.memory_bytes);
        self.elapsed_seconds = update.elapsed_seconds;
        self.last_error = None;
    }

    fn record_error(&mut self, error: &ProgressError) {
        self.last_error = Some(error.to_string());
    }

    fn has_data(&self) -> bool {
        self.scanned_rows.is_some() || self.last_error.is_some()
    }
}

/// One successful progress fetch
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub query_state: QueryState,
    pub scanned_rows: u64,
    pub scanned_bytes: u64,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub elapsed_seconds: Option<f64>,
}

/// Where the live progress endpoint lives and how to authenticate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl ProgressEndpoint {
    // "progres" is the server's own spelling of this route.
    fn url_for(&self, trace_id: &str) -> String {
        format!(
            "http://{}:{}/rest/v2/manager/query/progres/query/{}",
            self.host, self.port, trace_id
        )
    }
}

/// Deterministic synthetic progress. Counters only ever grow; the final
/// update adds a burst so a mock run ends on plausible totals.
pub struct MockProgress {
    rng: StdRng,
    scanned_rows: u64,
    scanned_bytes: u64,
    started: std::time::Instant,
}

impl MockProgress {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            scanned_rows: 0,
            scanned_bytes: 0,
            started: std::time::Instant::now(),
        }
    }

    pub fn next_update(&mut self, finalize: bool) -> ProgressUpdate {
        if finalize {
            self.scanned_rows += self.rng.gen_range(500..=1000);
            self.scanned_bytes += self.rng.gen_range(5u64..=10) * 1024 * 1024;
        } else {
            self.scanned_rows += self.rng.gen_range(80..=120);
            self.scanned_bytes += self.rng.gen_range(900_000..=1_100_000);
        }

        let elapsed = self.started.elapsed();
        let cpu_millis = (elapsed.as_millis() as f64 * self.rng.gen_range(0.8..1.2)) as u64;
        let memory_bytes = (self.scanned_bytes as f64 * self.rng.gen_range(1.5..2.5)) as u64;

        ProgressUpdate {
            query_state: if finalize {
                QueryState::Finished
            } else {
                QueryState::Running
            },
            scanned_rows: self.scanned_rows,
            scanned_bytes: self.scanned_bytes,
            cpu_millis,
            memory_bytes,
            elapsed_seconds: Some(elapsed.as_secs_f64()),
        }
    }
}

#[derive(Clone)]
enum ProgressSource {
    Live {
        client: reqwest::Client,
        endpoint: ProgressEndpoint,
    },
    Mock(Arc<Mutex<MockProgress>>),
}

struct Shared {
    snapshot: Mutex<ProgressSnapshot>,
    tracker_state: Mutex<TrackerState>,
    rendered_lines: AtomicU64,
}

/// Tracks one statement: `CREATED → WARMUP → POLLING → STOPPED`
pub struct ProgressTracker {
    trace_id: String,
    source: ProgressSource,
    shared: Arc<Shared>,
    stop_token: CancellationToken,
    task: Option<JoinHandle<()>>,
    started_at: Option<Instant>,
    total_runtime: Option<Duration>,
    silent: bool,
}

impl ProgressTracker {
    /// Tracker polling the frontend REST endpoint.
    ///
    /// The stop token is a child of `cancel`: cancelling the statement
    /// stops the tracker too, while stopping the tracker leaves the
    /// statement alone.
    pub fn new_live(
        trace_id: impl Into<String>,
        endpoint: ProgressEndpoint,
        cancel: &CancellationToken,
    ) -> Self {
        Self::build(
            trace_id.into(),
            ProgressSource::Live {
                client: reqwest::Client::new(),
                endpoint,
            },
            cancel,
        )
    }

    /// Tracker over a synthetic progress source
    pub fn new_mock(
        trace_id: impl Into<String>,
        seed: Option<u64>,
        cancel: &CancellationToken,
    ) -> Self {
        Self::build(
            trace_id.into(),
            ProgressSource::Mock(Arc::new(Mutex::new(MockProgress::new(seed)))),
            cancel,
        )
    }

    fn build(trace_id: String, source: ProgressSource, cancel: &CancellationToken) -> Self {
        Self {
            trace_id,
            source,
            shared: Arc::new(Shared {
                snapshot: Mutex::new(ProgressSnapshot::default()),
                tracker_state: Mutex::new(TrackerState::Created),
                rendered_lines: AtomicU64::new(0),
            }),
            stop_token: cancel.child_token(),
            task: None,
            started_at: None,
            total_runtime: None,
            silent: false,
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_mock(&self) -> bool {
        matches!(self.source, ProgressSource::Mock(_))
    }

    pub fn state(&self) -> TrackerState {
        *lock_or_recover(&self.shared.tracker_state)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        lock_or_recover(&self.shared.snapshot).clone()
    }

    /// Number of status lines rendered so far
    pub fn rendered_line_count(&self) -> u64 {
        self.shared.rendered_lines.load(Ordering::Relaxed)
    }

    /// Record the start instant and launch the poll task. Must be called
    /// before the tracked statement is sent.
    pub fn start_tracking(&mut self, silent: bool) {
        if self.task.is_some() {
            warn!(trace_id = %self.trace_id, "tracker already started");
            return;
        }

        let started = Instant::now();
        self.started_at = Some(started);
        self.silent = silent;
        set_state(&self.shared, TrackerState::Warmup);
        debug!(trace_id = %self.trace_id, mock = self.is_mock(), "progress tracking started");

        let trace_id = self.trace_id.clone();
        let source = self.source.clone();
        let shared = Arc::clone(&self.shared);
        let stop = self.stop_token.clone();
        self.task = Some(tokio::spawn(async move {
            poll_task(trace_id, source, shared, stop, silent, started).await;
        }));
    }

    /// Stop tracking and freeze the total runtime. Idempotent: the first
    /// call computes the runtime, later calls return the same value.
    pub async fn stop_tracking(&mut self) -> f64 {
        if let Some(frozen) = self.total_runtime {
            return frozen.as_secs_f64();
        }

        let reached_polling = matches!(self.state(), TrackerState::Polling);
        self.stop_token.cancel();

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(JOIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "poll task ended abnormally"),
                Err(_) => warn!("poll task did not stop within the join timeout"),
            }
        }

        let runtime = self
            .started_at
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.total_runtime = Some(runtime);
        set_state(&self.shared, TrackerState::Stopped);

        // A mock run that reached polling closes with one FINISHED line.
        if reached_polling && !self.silent {
            if let ProgressSource::Mock(mock) = &self.source {
                let update = lock_or_recover(mock).next_update(true);
                let snapshot = {
                    let mut snap = lock_or_recover(&self.shared.snapshot);
                    snap.apply(update);
                    snap.clone()
                };
                render_status_line(
                    &snapshot,
                    &self.trace_id,
                    true,
                    runtime.as_secs_f64(),
                    &self.shared,
                );
            }
        }

        debug!(trace_id = %self.trace_id, runtime_secs = runtime.as_secs_f64(), "progress tracking stopped");
        runtime.as_secs_f64()
    }

    /// Frozen once stopped, a live estimate while running, 0 before start
    pub fn total_runtime(&self) -> f64 {
        match self.total_runtime {
            Some(frozen) => frozen.as_secs_f64(),
            None => self
                .started_at
                .map(|started| started.elapsed().as_secs_f64())
                .unwrap_or(0.0),
        }
    }
}

async fn poll_task(
    trace_id: String,
    source: ProgressSource,
    shared: Arc<Shared>,
    stop: CancellationToken,
    silent: bool,
    started: Instant,
) {
    // Warmup: statements that finish in here come and go silently.
    while started.elapsed() < WARMUP_PERIOD {
        if stop.is_cancelled() {
            set_state(&shared, TrackerState::Stopped);
            return;
        }
        tokio::time::sleep(WARMUP_SLICE).await;
    }
    if stop.is_cancelled() {
        set_state(&shared, TrackerState::Stopped);
        return;
    }

    set_state(&shared, TrackerState::Polling);

    loop {
        let fetched = match &source {
            ProgressSource::Live { client, endpoint } => {
                fetch_progress(client, endpoint, &trace_id).await
            }
            ProgressSource::Mock(mock) => Ok(lock_or_recover(mock).next_update(false)),
        };

        let snapshot = {
            let mut snap = lock_or_recover(&shared.snapshot);
            match fetched {
                Ok(update) => snap.apply(update),
                Err(e) => {
                    debug!(error = %e, "progress fetch failed");
                    snap.record_error(&e);
                }
            }
            snap.clone()
        };

        if !silent {
            render_status_line(
                &snapshot,
                &trace_id,
                matches!(source, ProgressSource::Mock(_)),
                started.elapsed().as_secs_f64(),
                &shared,
            );
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn set_state(shared: &Shared, state: TrackerState) {
    *lock_or_recover(&shared.tracker_state) = state;
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fetch and classify one progress report
async fn fetch_progress(
    client: &reqwest::Client,
    endpoint: &ProgressEndpoint,
    trace_id: &str,
) -> ProgressResult<ProgressUpdate> {
    let url = endpoint.url_for(trace_id);
    let response = client
        .get(&url)
        .basic_auth(&endpoint.user, Some(&endpoint.password))
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| classify_transport_error(endpoint, e))?;

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_response(status, &body)
}

fn classify_transport_error(endpoint: &ProgressEndpoint, error: reqwest::Error) -> ProgressError {
    if error.is_timeout() {
        ProgressError::Timeout
    } else if error.is_connect() {
        ProgressError::Connection {
            host: endpoint.host.clone(),
            port: endpoint.port,
        }
    } else {
        ProgressError::Other(error.to_string())
    }
}

#[derive(Deserialize)]
struct ApiBody {
    msg: Option<String>,
    data: Option<serde_json::Value>,
}

/// Classify an HTTP response into a progress update or a diagnosis.
/// Total over arbitrary status/body combinations; never panics.
fn classify_response(status: u16, body: &str) -> ProgressResult<ProgressUpdate> {
    match status {
        401 | 403 => return Err(ProgressError::AuthFailed { status }),
        200 => {}
        other => {
            return Err(ProgressError::Http {
                status: other,
                snippet: snippet(body),
            })
        }
    }

    let parsed: ApiBody = serde_json::from_str(body).map_err(|_| ProgressError::MalformedBody {
        snippet: snippet(body),
    })?;

    match (parsed.msg.as_deref(), &parsed.data) {
        (Some("success"), Some(data)) if data.is_object() => {
            let int = |key: &str| data.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
            let query_state = match data.get("queryState").and_then(|v| v.as_str()) {
                Some("FINISHED") => QueryState::Finished,
                _ => QueryState::Running,
            };
            Ok(ProgressUpdate {
                query_state,
                scanned_rows: int("scanRows"),
                scanned_bytes: int("scanBytes"),
                cpu_millis: int("cpuMs"),
                memory_bytes: int("currentUsedMemoryBytes"),
                elapsed_seconds: None,
            })
        }
        (msg, data) => {
            let msg = msg.unwrap_or("unknown").to_string();
            let message = match data {
                Some(data) => format!("{msg} | {data}"),
                None => msg,
            };
            Err(ProgressError::Api { message })
        }
    }
}

/// Render the single overwriting status line
fn render_status_line(
    snapshot: &ProgressSnapshot,
    trace_id: &str,
    mock: bool,
    runtime_secs: f64,
    shared: &Shared,
) {
    let mut line = String::new();
    if mock {
        line.push_str("[Mock] ");
    }
    line.push_str(&format!(
        "State: {} | Trace ID: {} | Runtime: {:.2}s",
        snapshot.query_state, trace_id, runtime_secs
    ));

    if !snapshot.has_data() {
        line.push_str(" | Waiting for progress data...");
    } else {
        let counts = |v: Option<u64>, f: fn(u64) -> String| {
            v.map(f).unwrap_or_else(|| "N/A".to_string())
        };
        line.push_str(&format!(
            " | ScannedRows: {} | ScannedBytes: {}",
            counts(snapshot.scanned_rows, format_count),
            counts(snapshot.scanned_bytes, format_bytes),
        ));
        match snapshot.cpu_millis {
            Some(cpu) => line.push_str(&format!(" | CPU: {:.2}s", cpu as f64 / 1000.0)),
            None => line.push_str(" | CPU: N/A"),
        }
        line.push_str(&format!(
            " | Mem: {}",
            counts(snapshot.memory_bytes, format_bytes)
        ));
        if let Some(elapsed) = snapshot.elapsed_seconds {
            line.push_str(&format!(" | Time: {elapsed:.1}s"));
        }
        if let Some(error) = &snapshot.last_error {
            line.push_str(&format!(" | Error: {}", truncate_error(error)));
        }
    }

    print!("\r{:width$}\r{line}", "", width = WIPE_WIDTH);
    let _ = std::io::stdout().flush();
    shared.rendered_lines.fetch_add(1, Ordering::Relaxed);
}

/// `1234567` → `1,234,567`
fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Human-readable byte count, two decimals
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    for unit in UNITS {
        if size < 1024.0 {
            return format!("{size:.2} {unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.2} PB")
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= ERROR_DISPLAY_LIMIT {
        return error.to_string();
    }
    let head: String = error.chars().take(ERROR_DISPLAY_LIMIT - 3).collect();
    format!("{head}...")
}

fn snippet(body: &str) -> String {
    body.chars().take(100).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_classify_success() {
        let body = r#"{"msg":"success","data":{"scanRows":1500,"scanBytes":2048000,"cpuMs":3500,"currentUsedMemoryBytes":52428800}}"#;
        let update = classify_response(200, body).unwrap();
        assert_eq!(update.scanned_rows, 1500);
        assert_eq!(update.scanned_bytes, 2_048_000);
        assert_eq!(update.cpu_millis, 3500);
        assert_eq!(update.memory_bytes, 52_428_800);
        assert_eq!(update.query_state, QueryState::Running);
    }

    #[test]
    fn test_classify_success_missing_fields_default_zero() {
        let body = r#"{"msg":"success","data":{"scanRows":10}}"#;
        let update = classify_response(200, body).unwrap();
        assert_eq!(update.scanned_rows, 10);
        assert_eq!(update.scanned_bytes, 0);
        assert_eq!(update.cpu_millis, 0);
    }

    #[test]
    fn test_classify_api_error() {
        let body = r#"{"msg":"failed","data":"query not found"}"#;
        let err = classify_response(200, body).unwrap_err();
        match err {
            ProgressError::Api { message } => {
                assert!(message.contains("failed"));
                assert!(message.contains("query not found"));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_auth_failure() {
        assert!(matches!(
            classify_response(401, ""),
            Err(ProgressError::AuthFailed { status: 401 })
        ));
        assert!(matches!(
            classify_response(403, "denied"),
            Err(ProgressError::AuthFailed { status: 403 })
        ));
    }

    #[test]
    fn test_classify_http_error_carries_snippet() {
        let err = classify_response(500, "internal server error").unwrap_err();
        match err {
            ProgressError::Http { status, snippet } => {
                assert_eq!(status, 500);
                assert_eq!(snippet, "internal server error");
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn test_classify_malformed_body() {
        let err = classify_response(200, "<html>not json</html>").unwrap_err();
        assert!(matches!(err, ProgressError::MalformedBody { .. }));

        // Arbitrary garbage must classify, not panic
        let err = classify_response(200, "\u{0}\u{1}\u{2}").unwrap_err();
        assert!(matches!(err, ProgressError::MalformedBody { .. }));
    }

    #[test]
    fn test_mock_counters_strictly_monotonic() {
        let mut mock = MockProgress::new(Some(7));
        let mut last_rows = 0;
        let mut last_bytes = 0;
        for _ in 0..5 {
            let update = mock.next_update(false);
            assert!(update.scanned_rows > last_rows);
            assert!(update.scanned_bytes > last_bytes);
            last_rows = update.scanned_rows;
            last_bytes = update.scanned_bytes;
        }
        let final_update = mock.next_update(true);
        assert!(final_update.scanned_rows >= last_rows + 500);
        assert!(final_update.scanned_bytes >= last_bytes + 5 * 1024 * 1024);
        assert_eq!(final_update.query_state, QueryState::Finished);
    }

    #[test]
    fn test_mock_is_deterministic_for_a_seed() {
        let mut a = MockProgress::new(Some(42));
        let mut b = MockProgress::new(Some(42));
        for _ in 0..3 {
            let ua = a.next_update(false);
            let ub = b.next_update(false);
            assert_eq!(ua.scanned_rows, ub.scanned_rows);
            assert_eq!(ua.scanned_bytes, ub.scanned_bytes);
        }
    }

    #[test]
    fn test_mock_memory_tracks_scanned_bytes() {
        let mut mock = MockProgress::new(Some(1));
        let update = mock.next_update(false);
        let lower = (update.scanned_bytes as f64 * 1.5) as u64;
        let upper = (update.scanned_bytes as f64 * 2.5) as u64;
        assert!(update.memory_bytes >= lower && update.memory_bytes <= upper);
    }

    #[test]
    fn test_snapshot_retains_data_across_errors() {
        let mut snap = ProgressSnapshot::default();
        snap.apply(ProgressUpdate {
            query_state: QueryState::Running,
            scanned_rows: 100,
            scanned_bytes: 1000,
            cpu_millis: 10,
            memory_bytes: 2000,
            elapsed_seconds: None,
        });
        snap.record_error(&ProgressError::Timeout);
        assert_eq!(snap.scanned_rows, Some(100));
        assert_eq!(snap.scanned_bytes, Some(1000));
        assert_eq!(snap.last_error.as_deref(), Some("Request timeout"));

        // The next good fetch clears the diagnosis
        snap.apply(ProgressUpdate {
            query_state: QueryState::Running,
            scanned_rows: 200,
            scanned_bytes: 2000,
            cpu_millis: 20,
            memory_bytes: 4000,
            elapsed_seconds: None,
        });
        assert_eq!(snap.last_error, None);
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_truncate_error() {
        let short = "short error";
        assert_eq!(truncate_error(short), short);

        let long = "x".repeat(80);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), ERROR_DISPLAY_LIMIT);
        assert!(truncated.ends_with("..."));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_zero_runtime() {
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new_mock("dorsh_t0", None, &token);
        assert_eq!(tracker.state(), TrackerState::Created);
        let runtime = tracker.stop_tracking().await;
        assert_eq!(runtime, 0.0);
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[tokio::test]
    async fn test_double_stop_returns_same_runtime() {
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new_mock("dorsh_t1", None, &token);
        tracker.start_tracking(true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first = tracker.stop_tracking().await;
        let second = tracker.stop_tracking().await;
        assert!(first >= 0.0);
        assert_eq!(first, second);
        assert_eq!(tracker.total_runtime(), first);
    }

    #[tokio::test]
    async fn test_stop_within_warmup_renders_nothing() {
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new_mock("dorsh_t2", None, &token);
        tracker.start_tracking(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let runtime = tracker.stop_tracking().await;
        assert_eq!(tracker.rendered_line_count(), 0);
        assert!(runtime >= 0.0);
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_renders_and_final_snapshot_finishes() {
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new_mock("dorsh_t3", Some(5), &token);
        tracker.start_tracking(false);

        // Past the warmup and through a few poll ticks
        tokio::time::sleep(WARMUP_PERIOD + POLL_INTERVAL * 2).await;
        assert_eq!(tracker.state(), TrackerState::Polling);
        assert!(tracker.rendered_line_count() >= 1);

        tracker.stop_tracking().await;
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.query_state, QueryState::Finished);
        assert!(snapshot.scanned_rows.unwrap_or(0) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_statement_token_cancels_tracker() {
        let token = CancellationToken::new();
        let mut tracker = ProgressTracker::new_mock("dorsh_t4", None, &token);
        tracker.start_tracking(true);

        token.cancel();
        tokio::time::sleep(Duration::from_millis(200)).await;
        // The poll task exits on its own once the parent token fires
        let runtime = tracker.stop_tracking().await;
        assert!(runtime >= 0.0);
        assert_eq!(tracker.state(), TrackerState::Stopped);
    }

    async fn serve_once(response: String) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        port
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn test_live_fetch_success() {
        let body = r#"{"msg":"success","data":{"scanRows":123,"scanBytes":456,"cpuMs":789,"currentUsedMemoryBytes":1024}}"#;
        let port = serve_once(http_response("200 OK", body)).await;
        let endpoint = ProgressEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            user: "root".to_string(),
            password: String::new(),
        };
        let update = fetch_progress(&reqwest::Client::new(), &endpoint, "dorsh_live")
            .await
            .unwrap();
        assert_eq!(update.scanned_rows, 123);
        assert_eq!(update.memory_bytes, 1024);
    }

    #[tokio::test]
    async fn test_live_fetch_auth_failure() {
        let port = serve_once(http_response("401 Unauthorized", "{}")).await;
        let endpoint = ProgressEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            user: "root".to_string(),
            password: "wrong".to_string(),
        };
        let err = fetch_progress(&reqwest::Client::new(), &endpoint, "dorsh_live")
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::AuthFailed { status: 401 }));
    }

    #[tokio::test]
    async fn test_live_fetch_connection_error() {
        // Bind then drop, so the port is very likely closed
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = ProgressEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            user: "root".to_string(),
            password: String::new(),
        };
        let err = fetch_progress(&reqwest::Client::new(), &endpoint, "dorsh_live")
            .await
            .unwrap_err();
        assert!(matches!(err, ProgressError::Connection { .. }));
    }

    #[test]
    fn test_endpoint_url_keeps_server_spelling() {
        let endpoint = ProgressEndpoint {
            host: "fe1".to_string(),
            port: 8030,
            user: "root".to_string(),
            password: String::new(),
        };
        assert_eq!(
            endpoint.url_for("dorsh_abc"),
            "http://fe1:8030/rest/v2/manager/query/progres/query/dorsh_abc"
        );
    }
}
