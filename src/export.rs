//! CSV export of query results and benchmark reports.

use std::fs::OpenOptions;
use std::path::Path;

use crate::backend::ResultSet;
use crate::bench::{BenchmarkEntry, BenchmarkReport};
use crate::error::{ExportError, ExportResult};

const APPEND_SEPARATOR: &str = "# SQL Query Results";

/// Write a result set as CSV. With `append` set and an existing file, a
/// blank line and a separator comment are written before the next header,
/// so consecutive exports stay readable in one file.
pub fn export_result_csv(path: &Path, result: &ResultSet, append: bool) -> ExportResult<()> {
    let appending = append && path.exists();

    let file = OpenOptions::new()
        .create(true)
        .append(appending)
        .write(true)
        .truncate(!appending)
        .open(path)
        .map_err(|e| ExportError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);

    if appending {
        writer.write_record([""])?;
        writer.write_record([APPEND_SEPARATOR])?;
    }

    writer.write_record(&result.columns)?;
    for row in &result.rows {
        let record: Vec<&str> = row.iter().map(|cell| cell.as_deref().unwrap_or("")).collect();
        writer.write_record(record)?;
    }

    writer.flush().map_err(|e| ExportError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

/// Write a benchmark report: per-query run times with min/max/avg, then an
/// overall statistics block.
pub fn export_benchmark_csv(path: &Path, report: &BenchmarkReport) -> ExportResult<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(|e| ExportError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

    let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);

    writer.write_record(["# Query Execution Times (seconds)"])?;

    let mut header = vec!["No.".to_string(), "Query #".to_string(), "Source".to_string()];
    for run in 1..=report.times {
        header.push(format!("Run {run}"));
    }
    header.extend(["Min".to_string(), "Max".to_string(), "Avg".to_string()]);
    writer.write_record(&header)?;

    for entry in &report.entries {
        let mut record = vec![
            entry.index.to_string(),
            format!("Query {}", entry.index),
            entry.source.clone(),
        ];
        for run in &entry.runs {
            record.push(match run {
                Some(secs) => format!("{secs:.4}"),
                None => "ERR".to_string(),
            });
        }
        record.push(format_stat(entry.min()));
        record.push(format_stat(entry.max()));
        record.push(format_stat(entry.avg()));
        writer.write_record(&record)?;
    }

    let mut average_row = vec![String::new(), "Average".to_string(), String::new()];
    for run_avg in report.run_averages() {
        average_row.push(format_stat(run_avg));
    }
    average_row.extend([String::new(), String::new(), String::new()]);
    writer.write_record(&average_row)?;

    writer.write_record([""])?;
    writer.write_record(["# Overall Statistics"])?;
    writer.write_record(["Metric", "Value"])?;
    let stats = [
        (
            "Total Runtime",
            format!("{:.2} seconds", report.total_runtime_secs),
        ),
        ("Number of Queries", report.entries.len().to_string()),
        ("Total Executions", report.total_executions().to_string()),
    ];
    for (metric, value) in stats {
        writer.write_record([metric, value.as_str()])?;
    }

    writer.flush().map_err(|e| ExportError::WriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn format_stat(stat: Option<f64>) -> String {
    match stat {
        Some(secs) => format!("{secs:.4}"),
        None => String::new(),
    }
}
