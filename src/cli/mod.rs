//! CLI module for samwal
//!
//! Provides command-line interface for:
//! - format: Create the devices and write a fresh log header
//! - inspect: Print the committed epochs still on the log
//! - recover: Replay the log onto the masters
//! - exercise: Run a scripted transaction workload

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{exercise, format, inspect, recover, run, run_command, Config};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
