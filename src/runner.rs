//! Sequential execution of statement blocks.
//!
//! One [`QueryRunner`] takes a block of raw input, splits it, and runs the
//! statements in order with the required choreography per statement: stamp
//! the trace id, start the progress tracker, send, stop the tracker,
//! render. Catalog and database switches bypass progress tracking. A
//! failed statement triggers at most one block-level reconnect; if even
//! that fails the rest of the block is reported as skipped.

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::backend::{ResultSet, SqlBackend};
use crate::display;
use crate::error::QueryError;
use crate::export;
use crate::progress::{ProgressEndpoint, ProgressTracker};
use crate::session::{Session, StatementOutput};
use crate::splitter::split_statements;

static USE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*use\s+(\S+?)\s*;?\s*$").unwrap());
static SWITCH_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*switch\s+(\S+?)\s*;?\s*$").unwrap());

/// Options for one block run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Use synthetic progress even when an endpoint would be available
    pub mock_progress: bool,
    /// Seed for the synthetic progress source
    pub mock_seed: Option<u64>,
    /// Suppress the progress status line
    pub silent_progress: bool,
    /// Export each result set to this CSV file
    pub output: Option<PathBuf>,
}

/// Outcome of one statement within a block
#[derive(Debug)]
pub enum StatementOutcome {
    Completed {
        output: StatementOutput,
        runtime_secs: f64,
    },
    Failed(QueryError),
    /// Not attempted: an earlier statement aborted the block
    Skipped,
}

/// One statement and what became of it
#[derive(Debug)]
pub struct StatementRun {
    pub sql: String,
    pub outcome: StatementOutcome,
}

/// Everything that happened while running a block
#[derive(Debug, Default)]
pub struct BlockSummary {
    pub runs: Vec<StatementRun>,
}

impl BlockSummary {
    pub fn all_completed(&self) -> bool {
        self.runs
            .iter()
            .all(|run| matches!(run.outcome, StatementOutcome::Completed { .. }))
    }

    pub fn was_cancelled(&self) -> bool {
        self.runs.iter().any(|run| {
            matches!(
                run.outcome,
                StatementOutcome::Failed(QueryError::Cancelled)
            )
        })
    }
}

/// Runs blocks of statements against one session
pub struct QueryRunner<'a, B: SqlBackend> {
    session: &'a mut Session<B>,
    options: RunOptions,
    wrote_output: bool,
}

impl<'a, B: SqlBackend> QueryRunner<'a, B> {
    pub fn new(session: &'a mut Session<B>, options: RunOptions) -> Self {
        Self {
            session,
            options,
            wrote_output: false,
        }
    }

    /// Treat the output file as already written, so the next export appends.
    pub fn mark_output_written(&mut self) {
        self.wrote_output = true;
    }

    pub fn wrote_any_output(&self) -> bool {
        self.wrote_output
    }

    /// Split `input` and run its statements in order.
    ///
    /// Cancellation aborts the block; remaining statements are reported
    /// as skipped, as are statements after a reconnect that failed.
    pub async fn run_block(&mut self, input: &str, cancel: &CancellationToken) -> BlockSummary {
        let statements = split_statements(input);
        let total = statements.len();
        let mut summary = BlockSummary::default();
        let mut skip_remaining = false;

        for (i, sql) in statements.into_iter().enumerate() {
            if skip_remaining || cancel.is_cancelled() {
                summary.runs.push(StatementRun {
                    sql,
                    outcome: StatementOutcome::Skipped,
                });
                continue;
            }

            if total > 1 {
                println!("Executing statement {}/{}: {}", i + 1, total, sql);
            }

            let outcome = self.run_statement(&sql, cancel).await;

            match &outcome {
                StatementOutcome::Failed(QueryError::Cancelled) => {
                    println!("\nQuery cancelled");
                    skip_remaining = true;
                }
                StatementOutcome::Failed(e) => {
                    eprintln!("Error: {e}");
                    // The session reconnects on its own after transport
                    // failures; only if it is still dead does the block
                    // get one more chance before giving up.
                    if !self.session.check_health().await {
                        println!("Attempting to reconnect to clean up connection state...");
                        match self.session.reconnect(true).await {
                            Ok(()) => println!("Reconnection successful."),
                            Err(re) => {
                                warn!(error = %re, "block-level reconnect failed");
                                println!("Failed to reconnect. Skipping remaining statements.");
                                skip_remaining = true;
                            }
                        }
                    }
                }
                _ => {}
            }

            summary.runs.push(StatementRun { sql, outcome });
        }

        summary
    }

    async fn run_statement(&mut self, sql: &str, cancel: &CancellationToken) -> StatementOutcome {
        // Switches run directly, without progress tracking.
        if let Some(database) = capture_argument(&USE_RE, sql) {
            return match self.session.use_database(&database).await {
                Ok(()) => {
                    println!("Database changed to {database}");
                    StatementOutcome::Completed {
                        output: StatementOutput {
                            result: ResultSet::default(),
                            trace_id: None,
                        },
                        runtime_secs: 0.0,
                    }
                }
                Err(e) => StatementOutcome::Failed(e),
            };
        }
        if let Some(catalog) = capture_argument(&SWITCH_RE, sql) {
            return match self.session.switch_catalog(&catalog).await {
                Ok(()) => {
                    println!("Switched to catalog {catalog}");
                    StatementOutcome::Completed {
                        output: StatementOutput {
                            result: ResultSet::default(),
                            trace_id: None,
                        },
                        runtime_secs: 0.0,
                    }
                }
                Err(e) => StatementOutcome::Failed(e),
            };
        }

        // Ordering requirement: trace id stamped first, poller running
        // second, statement sent last.
        let trace_id = self.session.stamp_new_trace_id().await;
        let mut tracker = self.build_tracker(&trace_id, cancel).await;
        tracker.start_tracking(self.options.silent_progress);

        let result = self.session.execute_statement(sql, false, cancel).await;

        let runtime_secs = tracker.stop_tracking().await;
        if tracker.rendered_line_count() > 0 {
            println!();
        }

        match result {
            Ok(output) => {
                let rendered = display::render_statement_output(&output, runtime_secs);
                if !rendered.is_empty() {
                    print!("{rendered}");
                }
                self.export_if_requested(&output.result);
                StatementOutcome::Completed {
                    output,
                    runtime_secs,
                }
            }
            Err(e) => StatementOutcome::Failed(e),
        }
    }

    async fn build_tracker(&mut self, trace_id: &str, cancel: &CancellationToken) -> ProgressTracker {
        if self.options.mock_progress {
            return ProgressTracker::new_mock(trace_id, self.options.mock_seed, cancel);
        }

        match self.session.discover_http_status_port().await {
            Some(port) => {
                let config = self.session.config();
                ProgressTracker::new_live(
                    trace_id,
                    ProgressEndpoint {
                        host: config.host.clone(),
                        port,
                        user: config.user.clone(),
                        password: config.password.clone(),
                    },
                    cancel,
                )
            }
            None => {
                if !self.options.silent_progress {
                    println!("Warning: Could not determine HTTP port. Progress will use mock data.");
                }
                ProgressTracker::new_mock(trace_id, self.options.mock_seed, cancel)
            }
        }
    }

    fn export_if_requested(&mut self, result: &ResultSet) {
        let Some(path) = self.options.output.clone() else {
            return;
        };
        if result.is_empty() {
            return;
        }

        let append = self.wrote_output;
        match export::export_result_csv(&path, result, append) {
            Ok(()) => {
                self.wrote_output = true;
                if append {
                    println!("Query results appended to: {}", path.display());
                } else {
                    println!("Query results exported to: {}", path.display());
                }
            }
            Err(e) => eprintln!("Failed to export query results: {e}"),
        }
    }
}

fn capture_argument(re: &Regex, sql: &str) -> Option<String> {
    re.captures(sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
