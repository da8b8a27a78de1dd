//! dorsh binary entry point.
//!
//! Parses flags, layers them over the loaded configuration, connects the
//! session and dispatches to one of the modes: benchmark, one-shot
//! execute, file execution, or the interactive shell.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::SystemTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use dorsh::backend::MysqlBackend;
use dorsh::bench::run_benchmark;
use dorsh::config::AppConfig;
use dorsh::repl::run_repl;
use dorsh::runner::{BlockSummary, QueryRunner, RunOptions};
use dorsh::session::Session;

/// Interactive client for Doris-compatible SQL engines with live query
/// progress reporting.
#[derive(Parser, Debug)]
#[command(name = "dorsh", version, about)]
struct Cli {
    /// Frontend host
    #[arg(long)]
    host: Option<String>,

    /// Frontend MySQL-protocol port
    #[arg(long)]
    port: Option<u16>,

    /// Frontend HTTP port for progress tracking (discovered when omitted)
    #[arg(long)]
    http_port: Option<u16>,

    /// Username
    #[arg(long)]
    user: Option<String>,

    /// Password
    #[arg(long)]
    password: Option<String>,

    /// Default database
    #[arg(long)]
    database: Option<String>,

    /// Execute statements and exit
    #[arg(short = 'e', long, value_name = "SQL")]
    execute: Option<String>,

    /// Execute statements from a file and exit
    #[arg(short = 'f', long, value_name = "PATH", conflicts_with = "execute")]
    file: Option<PathBuf>,

    /// Use synthetic progress data instead of the frontend REST endpoint
    #[arg(long)]
    mock: bool,

    /// Export query results to a CSV file
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,

    /// Benchmark statements from a .sql file or directory and exit
    #[arg(long, value_name = "PATH", conflicts_with_all = ["execute", "file"])]
    benchmark: Option<PathBuf>,

    /// Runs per statement in benchmark mode
    #[arg(long, default_value_t = 1, value_name = "N")]
    times: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = AppConfig::load();
    apply_overrides(&mut config, &cli);

    // Held for the life of the process so buffered log lines reach disk
    let _guard = init_logging(&config);

    let mut session: Session<MysqlBackend> = Session::new(config.connection.clone());
    if let Err(e) = session.connect().await {
        eprintln!(
            "Failed to connect to {}:{}: {e}",
            config.connection.host, config.connection.port
        );
        return ExitCode::FAILURE;
    }

    let options = RunOptions {
        mock_progress: config.progress.mock,
        mock_seed: config.progress.mock_seed,
        silent_progress: false,
        output: cli.output.clone(),
    };

    let code = dispatch(&cli, &mut session, options).await;
    session.close().await;
    code
}

async fn dispatch(
    cli: &Cli,
    session: &mut Session<MysqlBackend>,
    options: RunOptions,
) -> ExitCode {
    if let Some(bench_path) = &cli.benchmark {
        let token = interrupt_token();
        return match run_benchmark(
            session,
            bench_path,
            cli.times,
            cli.output.as_deref(),
            &token,
        )
        .await
        {
            Ok(true) => ExitCode::SUCCESS,
            Ok(false) => ExitCode::FAILURE,
            Err(e) => {
                eprintln!("Benchmark failed: {e}");
                ExitCode::FAILURE
            }
        };
    }

    if let Some(sql) = &cli.execute {
        return exit_code(run_block_once(session, options, sql).await);
    }

    if let Some(file) = &cli.file {
        let expanded = shellexpand::tilde(&file.display().to_string()).into_owned();
        let contents = match std::fs::read_to_string(&expanded) {
            Ok(contents) => contents,
            Err(e) => {
                eprintln!("Failed to read file {expanded}: {e}");
                return ExitCode::FAILURE;
            }
        };
        println!("Executing SQL from file: {expanded}");
        return exit_code(run_block_once(session, options, &contents).await);
    }

    match run_repl(session, options).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Shell error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run one block with Ctrl+C wired to cancellation
async fn run_block_once(
    session: &mut Session<MysqlBackend>,
    options: RunOptions,
    input: &str,
) -> BlockSummary {
    let token = interrupt_token();
    let mut runner = QueryRunner::new(session, options);
    runner.run_block(input, &token).await
}

/// A token cancelled by the first Ctrl+C
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    token
}

fn exit_code(summary: BlockSummary) -> ExitCode {
    if summary.all_completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(http_port) = cli.http_port {
        config.connection.http_port = Some(http_port);
    }
    if let Some(user) = &cli.user {
        config.connection.user = user.clone();
    }
    if let Some(password) = &cli.password {
        config.connection.password = password.clone();
    }
    if let Some(database) = &cli.database {
        config.connection.database = Some(database.clone());
    }
    if cli.mock {
        config.progress.mock = true;
    }
}

/// Initialize the logging system based on configuration.
///
/// Logs default to a file under the log directory so the terminal stays
/// free for the prompt and the progress line.
fn init_logging(config: &AppConfig) -> WorkerGuard {
    let logging = &config.logging;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let (writer, guard) = if logging.file_output {
        let dir = config.log_dir();
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "dorsh.log");
                tracing_appender::non_blocking(appender)
            }
            Err(_) => tracing_appender::non_blocking(std::io::stderr()),
        }
    } else {
        tracing_appender::non_blocking(std::io::stderr())
    };
    let ansi = !logging.file_output;

    let fmt_layer = match logging.format.as_str() {
        "json" => {
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_level(true)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .with_current_span(true);
            if logging.timestamps {
                layer.with_timer(SystemTime::default()).boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        "pretty" => {
            let layer = fmt::layer()
                .pretty()
                .with_writer(writer)
                .with_target(true)
                .with_level(true)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .with_ansi(ansi);
            if logging.timestamps {
                layer.with_timer(SystemTime::default()).boxed()
            } else {
                layer.without_time().boxed()
            }
        }
        _ => {
            let layer = fmt::layer()
                .compact()
                .with_writer(writer)
                .with_target(true)
                .with_level(true)
                .with_file(logging.file_line)
                .with_line_number(logging.file_line)
                .with_ansi(ansi);
            if logging.timestamps {
                layer.with_timer(SystemTime::default()).boxed()
            } else {
                layer.without_time().boxed()
            }
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::debug!(
        level = %logging.level,
        format = %logging.format,
        "logging initialized"
    );
    guard
}
