//! CLI module for aerocast
//!
//! Provides command-line interface for:
//! - simulate: run a cluster on the in-memory network and report on it
//! - check-config: validate a stack configuration file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{check_config, run, run_command, simulate, SimulationOptions};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{write_error, write_response};
