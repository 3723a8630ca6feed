//! CLI argument definitions using clap
//!
//! Commands:
//! - aerocast simulate [--members N] [--messages N] [--partition] [--config <path>]
//! - aerocast check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// aerocast - reliable group communication over an in-memory network
#[derive(Parser, Debug)]
#[command(name = "aerocast")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Also print INFO lifecycle events (default: warnings and errors only)
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a cluster on an in-memory network and print a JSON report
    Simulate {
        /// Number of members
        #[arg(long, default_value_t = 3)]
        members: usize,

        /// Multicasts sent by each member
        #[arg(long, default_value_t = 10)]
        messages: usize,

        /// Split the cluster in two, then heal it and wait for the merge
        #[arg(long)]
        partition: bool,

        /// Group name
        #[arg(long, default_value = "aerocast-sim")]
        cluster: String,

        /// Stack configuration file (defaults apply when omitted)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Seconds to wait for each convergence step
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },

    /// Validate a stack configuration file and exit
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./aerocast.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
