//! dorsh library
//!
//! An interactive client for Doris-compatible SQL engines:
//! - session management with health checks, reconnect and state restore
//! - trace-id stamped statement execution with cancellation
//! - live or mock query progress tracking over the HTTP status port
//! - statement splitting, table display, CSV export and benchmarking

pub mod backend;
pub mod bench;
pub mod config;
pub mod display;
pub mod error;
pub mod export;
pub mod progress;
pub mod repl;
pub mod runner;
pub mod session;
pub mod splitter;

pub use config::AppConfig;
pub use error::{DorshError, Result};
pub use session::Session;
