//! # envie CLI
//!
//! Binary entry point for the `envie` command-line tool.
//!
//! Its responsibilities are limited to:
//! - Parsing command-line arguments using `clap`.
//! - Dispatching to the command implementations.
//! - Turning errors into a non-zero exit status. A request that ran but left
//!   failed or skipped nodes prints its manifest first and then exits with 1.
//!
//! Everything else lives in the `envie` library crate.

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    cli.execute()
}
