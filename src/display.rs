//! Result rendering.
//!
//! Aligned ASCII tables in the style of the classic mysql client, with
//! display widths measured so wide (CJK) glyphs keep the grid straight.
//! Everything renders to a `String`; callers decide where it goes.

use unicode_width::UnicodeWidthStr;

use crate::backend::ResultSet;
use crate::session::StatementOutput;

const NULL_TEXT: &str = "NULL";

/// Render a result set as an aligned grid. Empty result sets (statements
/// without result data) render as an empty string.
pub fn render_table(result: &ResultSet) -> String {
    if result.is_empty() {
        return String::new();
    }

    let rows: Vec<Vec<String>> = result
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| cell.clone().unwrap_or_else(|| NULL_TEXT.to_string()))
                .collect()
        })
        .collect();

    render_grid(&result.columns, &rows)
}

/// Render a head row plus data rows as an aligned grid
pub fn render_grid(columns: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = columns.iter().map(|c| c.width()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.width());
            }
        }
    }

    let mut out = String::new();
    push_separator(&mut out, &widths);
    push_row(&mut out, columns, &widths);
    push_separator(&mut out, &widths);
    for row in rows {
        push_row(&mut out, row, &widths);
    }
    push_separator(&mut out, &widths);
    out
}

/// Table plus the `Rows:` / `Trace ID:` / `Query Time:` trailer.
/// Statements without a result set produce nothing at all.
pub fn render_statement_output(output: &StatementOutput, runtime_secs: f64) -> String {
    if output.result.is_empty() {
        return String::new();
    }

    let mut out = render_table(&output.result);
    out.push_str(&format!("Rows: {}\n", output.result.row_count()));
    if let Some(trace_id) = &output.trace_id {
        out.push_str(&format!("Trace ID: {trace_id}\n"));
    }
    out.push_str(&format!("Query Time: {runtime_secs:.2}s\n"));
    out
}

fn push_separator(out: &mut String, widths: &[usize]) {
    for width in widths {
        out.push('+');
        out.push_str(&"-".repeat(width + 2));
    }
    out.push_str("+\n");
}

fn push_row<S: AsRef<str>>(out: &mut String, cells: &[S], widths: &[usize]) {
    for (i, width) in widths.iter().enumerate() {
        let text = cells.get(i).map(|c| c.as_ref()).unwrap_or("");
        let pad = width.saturating_sub(text.width());
        out.push_str("| ");
        out.push_str(text);
        out.push_str(&" ".repeat(pad));
        out.push(' ');
    }
    out.push_str("|\n");
}
