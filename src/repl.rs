//! Interactive shell.
//!
//! Multi-line input is accumulated until a trailing terminator; `use`,
//! `switch` and `source` are accepted without one. Ctrl+C at the prompt
//! clears the current buffer, Ctrl+C during a statement cancels it through
//! the statement's cancellation token, Ctrl+D exits after a best-effort
//! cancel of anything still running server-side.

use once_cell::sync::Lazy;
use regex::Regex;
use rustyline::config::Config;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::Editor;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::SqlBackend;
use crate::config::AppConfig;
use crate::error::{DorshError, Result};
use crate::runner::{BlockSummary, QueryRunner, RunOptions};
use crate::session::Session;

static SOURCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*source\s+(\S+?)\s*;?\s*$").unwrap());
static BARE_COMMAND_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*(use|switch|source)\s+\S+\s*$").unwrap());

const CONTINUATION_PROMPT: &str = "      -> ";

/// Run the interactive loop until exit
pub async fn run_repl<B: SqlBackend>(
    session: &mut Session<B>,
    options: RunOptions,
) -> Result<()> {
    print_banner(session);

    let config = Config::builder().auto_add_history(false).build();
    let mut editor: Editor<(), DefaultHistory> =
        Editor::with_config(config).map_err(readline_to_io)?;

    let history_path = AppConfig::history_file_path();
    if let Some(path) = &history_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = editor.load_history(path) {
            debug!(error = %e, "no usable history file");
        }
    }

    let mut buffer = String::new();
    let mut wrote_output = false;

    loop {
        let prompt = if buffer.is_empty() {
            let catalog = session.get_current_catalog().await;
            let database = session
                .get_current_database()
                .await
                .unwrap_or_else(|| "(none)".to_string());
            format!("dorsh [{catalog}][{database}]> ")
        } else {
            CONTINUATION_PROMPT.to_string()
        };

        match editor.readline(&prompt) {
            Ok(line) => {
                let trimmed = line.trim();

                if buffer.is_empty() {
                    match trimmed {
                        "" => continue,
                        "exit" | "quit" | "\\q" => break,
                        "help" | "\\h" => {
                            print_help();
                            continue;
                        }
                        "\\d" => {
                            buffer.push_str("SHOW DATABASES;");
                        }
                        "\\t" => {
                            buffer.push_str("SHOW TABLES;");
                        }
                        _ => {
                            buffer.push_str(&line);
                        }
                    }
                } else {
                    buffer.push('\n');
                    buffer.push_str(&line);
                }

                let pending = buffer.trim().to_string();
                if !input_complete(&pending) {
                    continue;
                }
                buffer.clear();

                let _ = editor.add_history_entry(&pending);

                if let Some(path) = capture_source_path(&pending) {
                    run_source_file(session, &options, &path, &mut wrote_output).await;
                    continue;
                }

                run_with_interrupt(session, &options, &pending, &mut wrote_output).await;
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at the prompt: drop whatever was typed
                buffer.clear();
                println!("^C");
            }
            Err(ReadlineError::Eof) => {
                println!("Received exit signal");
                let _ = session.cancel_current_statement().await;
                break;
            }
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        if let Err(e) = editor.save_history(path) {
            debug!(error = %e, "could not save history");
        }
    }

    Ok(())
}

/// Run one block with Ctrl+C wired to its cancellation token
async fn run_with_interrupt<B: SqlBackend>(
    session: &mut Session<B>,
    options: &RunOptions,
    input: &str,
    wrote_output: &mut bool,
) -> BlockSummary {
    let token = CancellationToken::new();
    let watcher = {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        })
    };

    let mut runner = QueryRunner::new(session, options.clone());
    if *wrote_output {
        runner.mark_output_written();
    }
    let summary = runner.run_block(input, &token).await;
    *wrote_output = runner.wrote_any_output();

    watcher.abort();
    summary
}

async fn run_source_file<B: SqlBackend>(
    session: &mut Session<B>,
    options: &RunOptions,
    path: &str,
    wrote_output: &mut bool,
) {
    let expanded = shellexpand::tilde(path).into_owned();
    match std::fs::read_to_string(&expanded) {
        Ok(contents) => {
            println!("Executing statements from: {expanded}");
            run_with_interrupt(session, options, &contents, wrote_output).await;
        }
        Err(e) => eprintln!("Failed to read file {expanded}: {e}"),
    }
}

fn print_banner<B: SqlBackend>(session: &Session<B>) {
    println!("Welcome to dorsh. Statements end with ;");
    if let Some(version) = session.version() {
        println!("Server version: {version}");
    }
    println!("Press Ctrl+C to cancel a running statement, Ctrl+D to exit.");
    println!("Type 'help' or '\\h' for help, '\\q' or 'exit' to quit.");
    println!();
}

fn print_help() {
    println!("List of commands:");
    println!("  \\q, exit, quit      Exit the shell");
    println!("  \\h, help            Show this help");
    println!("  \\d                  SHOW DATABASES");
    println!("  \\t                  SHOW TABLES");
    println!("  use <db>            Switch to a database");
    println!("  switch <catalog>    Switch to a catalog");
    println!("  source <file>       Run statements from a file");
    println!();
    println!("Statements end with ';'. Ctrl+C cancels a running statement.");
}

/// A buffer is complete with a trailing terminator, or when it is one of
/// the bare commands that never needs one.
fn input_complete(pending: &str) -> bool {
    pending.ends_with(';') || BARE_COMMAND_RE.is_match(pending)
}

fn capture_source_path(input: &str) -> Option<String> {
    SOURCE_RE
        .captures(input)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn readline_to_io(e: ReadlineError) -> DorshError {
    match e {
        ReadlineError::Io(io) => DorshError::Io(io),
        other => DorshError::Io(std::io::Error::other(other.to_string())),
    }
}
