//! aerocast CLI entry point
//!
//! Parses arguments and dispatches to `cli::run`, which prints the JSON
//! result. Exits non-zero on failure.

use aerocast::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
