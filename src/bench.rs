//! Benchmark mode: run statements from a `.sql` file or a directory of
//! `.sql` files N times each, without trace ids or progress tracking, and
//! report per-query and overall timings.

use std::io::Write as _;
use std::path::Path;
use std::time::Instant;

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use crate::backend::SqlBackend;
use crate::display::render_grid;
use crate::error::{QueryError, Result};
use crate::export::export_benchmark_csv;
use crate::session::Session;
use crate::splitter::split_statements;

const STATEMENT_PREVIEW_CHARS: usize = 100;

/// One benchmarked statement with its per-run wall times.
///
/// A `None` run is one that errored; statistics cover successful runs only.
#[derive(Debug, Clone)]
pub struct BenchmarkEntry {
    pub index: usize,
    pub source: String,
    pub statement: String,
    pub runs: Vec<Option<f64>>,
}

impl BenchmarkEntry {
    fn successes(&self) -> impl Iterator<Item = f64> + '_ {
        self.runs.iter().flatten().copied()
    }

    pub fn min(&self) -> Option<f64> {
        self.successes().fold(None, |acc, t| {
            Some(acc.map_or(t, |m: f64| m.min(t)))
        })
    }

    pub fn max(&self) -> Option<f64> {
        self.successes().fold(None, |acc, t| {
            Some(acc.map_or(t, |m: f64| m.max(t)))
        })
    }

    pub fn avg(&self) -> Option<f64> {
        let (count, sum) = self
            .successes()
            .fold((0usize, 0.0), |(n, s), t| (n + 1, s + t));
        (count > 0).then(|| sum / count as f64)
    }
}

#[derive(Debug, Clone)]
pub struct BenchmarkReport {
    pub started_at: DateTime<Local>,
    pub times: u32,
    pub total_runtime_secs: f64,
    pub entries: Vec<BenchmarkEntry>,
}

impl BenchmarkReport {
    /// Successful times grouped by run number, so run 1 of every query can
    /// be compared against run 2 (cache warmup effects show up here)
    fn times_by_run(&self) -> Vec<Vec<f64>> {
        let mut columns = vec![Vec::new(); self.times as usize];
        for entry in &self.entries {
            for (i, run) in entry.runs.iter().enumerate() {
                if let (Some(t), Some(column)) = (run, columns.get_mut(i)) {
                    column.push(*t);
                }
            }
        }
        columns
    }

    /// Mean of each run column; `None` where every query failed that run
    pub fn run_averages(&self) -> Vec<Option<f64>> {
        self.times_by_run()
            .into_iter()
            .map(|column| {
                (!column.is_empty())
                    .then(|| column.iter().sum::<f64>() / column.len() as f64)
            })
            .collect()
    }

    /// Percentile of each run column, e.g. `0.5` for P50
    pub fn run_percentiles(&self, fraction: f64) -> Vec<Option<f64>> {
        self.times_by_run()
            .into_iter()
            .map(|mut column| {
                column.sort_by(f64::total_cmp);
                percentile(&column, fraction)
            })
            .collect()
    }

    pub fn total_executions(&self) -> usize {
        self.entries.len() * self.times as usize
    }
}

fn percentile(sorted: &[f64], fraction: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let idx = (sorted.len() as f64 * fraction) as usize;
    Some(sorted[idx.min(sorted.len() - 1)])
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SourcedStatement {
    source: String,
    sql: String,
}

/// Run every statement under `sql_path` `times` times and print a report.
///
/// `USE` and `SWITCH` are executed once as setup commands and excluded from
/// timing. Returns `Ok(false)` when the benchmark was cut short by
/// cancellation, a failed reconnect, or empty input.
pub async fn run_benchmark<B: SqlBackend>(
    session: &mut Session<B>,
    sql_path: &Path,
    times: u32,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<bool> {
    let times = times.max(1);
    let statements = gather_statements(sql_path)?;
    if statements.is_empty() {
        eprintln!("No SQL statements found in {}", sql_path.display());
        return Ok(false);
    }

    let started_at = Local::now();
    println!(
        "Benchmarking {} statement(s) from {}, {} run(s) each",
        statements.len(),
        sql_path.display(),
        times
    );
    println!("Started at {}", started_at.format("%Y-%m-%d %H:%M:%S"));
    println!();

    let wall_start = Instant::now();
    let mut report = BenchmarkReport {
        started_at,
        times,
        total_runtime_secs: 0.0,
        entries: Vec::new(),
    };
    let mut completed = true;

    'queries: for stmt in statements {
        if is_setup_command(&stmt.sql) {
            println!("Executing setup command: {}", stmt.sql);
            if let Err(e) = session.execute_statement(&stmt.sql, false, cancel).await {
                eprintln!("Setup command failed: {e}");
            }
            continue;
        }

        let mut entry = BenchmarkEntry {
            index: report.entries.len() + 1,
            source: stmt.source,
            statement: stmt.sql,
            runs: Vec::with_capacity(times as usize),
        };

        print!("Benchmarking Query #{} from {}... ", entry.index, entry.source);
        let _ = std::io::stdout().flush();

        for run in 1..=times {
            if cancel.is_cancelled() {
                println!("\nBenchmark cancelled");
                completed = false;
                report.entries.push(entry);
                break 'queries;
            }

            let start = Instant::now();
            match session.execute_statement(&entry.statement, false, cancel).await {
                Ok(_) => {
                    entry.runs.push(Some(start.elapsed().as_secs_f64()));
                    print!(".");
                    let _ = std::io::stdout().flush();
                }
                Err(e) => {
                    entry.runs.push(None);
                    println!("\nError during run #{run}: {e}");
                    if matches!(e, QueryError::Cancelled) {
                        println!("Benchmark cancelled");
                        completed = false;
                        report.entries.push(entry);
                        break 'queries;
                    }
                    if !session.check_health().await {
                        println!("Attempting to reconnect...");
                        match session.reconnect(true).await {
                            Ok(()) => println!("Reconnection successful"),
                            Err(re) => {
                                println!("Failed to reconnect: {re}");
                                completed = false;
                                report.entries.push(entry);
                                break 'queries;
                            }
                        }
                    }
                }
            }
        }

        println!(" Done");
        report.entries.push(entry);
    }

    report.total_runtime_secs = wall_start.elapsed().as_secs_f64();
    print_report(&report);

    if let Some(path) = output {
        match export_benchmark_csv(path, &report) {
            Ok(()) => println!("\nBenchmark results exported to: {}", path.display()),
            Err(e) => eprintln!("\nFailed to export benchmark results: {e}"),
        }
    }

    Ok(completed)
}

/// Collect statements from a `.sql` file, or from every `.sql` file in a
/// directory in file-name order. Sources carry `file.sql:{n}` positions
/// when a file holds more than one statement.
fn gather_statements(sql_path: &Path) -> Result<Vec<SourcedStatement>> {
    let mut files = Vec::new();
    if sql_path.is_dir() {
        for dir_entry in std::fs::read_dir(sql_path)? {
            let path = dir_entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        files.sort();
    } else {
        files.push(sql_path.to_path_buf());
    }

    let mut statements = Vec::new();
    for file in files {
        let contents = std::fs::read_to_string(&file)?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.display().to_string());
        let split = split_statements(&contents);
        let numbered = split.len() > 1;
        for (i, sql) in split.into_iter().enumerate() {
            let source = if numbered {
                format!("{}:{}", name, i + 1)
            } else {
                name.clone()
            };
            statements.push(SourcedStatement { source, sql });
        }
    }
    Ok(statements)
}

fn is_setup_command(sql: &str) -> bool {
    matches!(
        sql.split_whitespace()
            .next()
            .map(|w| w.to_ascii_lowercase())
            .as_deref(),
        Some("use") | Some("switch")
    )
}

fn print_report(report: &BenchmarkReport) {
    println!("\n=== BENCHMARK RESULTS ===\n");

    let mut columns = vec!["No.".to_string(), "Query #".to_string(), "Source".to_string()];
    for run in 1..=report.times {
        columns.push(format!("Run {run}"));
    }
    columns.extend(["Min".to_string(), "Max".to_string(), "Avg".to_string()]);

    let mut rows: Vec<Vec<String>> = report
        .entries
        .iter()
        .map(|entry| {
            let mut row = vec![
                entry.index.to_string(),
                format!("Query {}", entry.index),
                entry.source.clone(),
            ];
            for run in 0..report.times as usize {
                row.push(match entry.runs.get(run) {
                    Some(Some(secs)) => format!("{secs:.4}"),
                    Some(None) => "ERR".to_string(),
                    None => "N/A".to_string(),
                });
            }
            row.push(format_stat(entry.min()));
            row.push(format_stat(entry.max()));
            row.push(format_stat(entry.avg()));
            row
        })
        .collect();
    rows.push(summary_row("Average", &report.run_averages()));
    rows.push(summary_row("P50", &report.run_percentiles(0.5)));
    rows.push(summary_row("P95", &report.run_percentiles(0.95)));
    println!("{}", render_grid(&columns, &rows));

    let stats_columns = vec!["Metric".to_string(), "Value".to_string()];
    let stats_rows = vec![
        vec![
            "Total Runtime".to_string(),
            format!("{:.2} seconds", report.total_runtime_secs),
        ],
        vec![
            "Number of Queries".to_string(),
            report.entries.len().to_string(),
        ],
        vec![
            "Total Executions".to_string(),
            report.total_executions().to_string(),
        ],
    ];
    println!("{}", render_grid(&stats_columns, &stats_rows));

    let sql_columns = vec![
        "No.".to_string(),
        "Query #".to_string(),
        "Source".to_string(),
        "SQL".to_string(),
    ];
    let sql_rows: Vec<Vec<String>> = report
        .entries
        .iter()
        .map(|entry| {
            vec![
                entry.index.to_string(),
                format!("Query {}", entry.index),
                entry.source.clone(),
                preview(&entry.statement),
            ]
        })
        .collect();
    println!("{}", render_grid(&sql_columns, &sql_rows));
}

/// A labeled summary row for the timing table: run-column values with the
/// leading and trailing columns left blank
fn summary_row(label: &str, per_run: &[Option<f64>]) -> Vec<String> {
    let mut row = vec![String::new(), label.to_string(), String::new()];
    for value in per_run {
        row.push(match value {
            Some(secs) => format!("{secs:.4}"),
            None => "N/A".to_string(),
        });
    }
    row.extend([String::new(), String::new(), String::new()]);
    row
}

fn format_stat(stat: Option<f64>) -> String {
    stat.map(|secs| format!("{secs:.4}")).unwrap_or_default()
}

fn preview(statement: &str) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= STATEMENT_PREVIEW_CHARS {
        flat
    } else {
        let mut shortened: String = flat.chars().take(STATEMENT_PREVIEW_CHARS - 3).collect();
        shortened.push_str("...");
        shortened
    }
}
