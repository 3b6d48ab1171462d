//! # Env Command Implementation
//!
//! Read-only views of the ledger.
//!
//! ## Subcommands
//!
//! - **`list`**: every recorded environment, or those of one merge request
//! - **`outputs`**: outputs of every applied environment of one scope, merged
//!   into one object

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use log::info;
use serde_json::Value;

use envie::config::MergeRequestId;
use envie::ledger::Scope;
use envie::output::{render_entries, OutputConfig};

use crate::cli::GlobalArgs;

/// Inspect recorded environments
#[derive(Args, Debug)]
pub struct EnvArgs {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: EnvSubcommand,
}

#[derive(Subcommand, Debug)]
pub enum EnvSubcommand {
    /// List recorded environments
    List(ListArgs),
    /// Print the merged outputs of one merge request or of the stable scope
    Outputs(OutputsArgs),
}

/// Arguments for the env list command
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only show environments of this merge request
    #[arg(long, value_name = "ID")]
    pub mr: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the env outputs command
#[derive(Args, Debug)]
pub struct OutputsArgs {
    /// Merge request whose outputs are shown
    #[arg(long, value_name = "ID", required_unless_present = "stable")]
    pub mr: Option<String>,

    /// Show the outputs of the stable environments instead
    #[arg(long, conflicts_with = "mr")]
    pub stable: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Also write the JSON object to this file
    #[arg(short, long, value_name = "PATH")]
    pub file: Option<PathBuf>,
}

/// Execute the `env` command.
pub fn execute(args: EnvArgs, global: &GlobalArgs) -> Result<()> {
    match args.command {
        EnvSubcommand::List(list_args) => list(list_args, global),
        EnvSubcommand::Outputs(outputs_args) => outputs(outputs_args, global),
    }
}

fn list(args: ListArgs, global: &GlobalArgs) -> Result<()> {
    let output = OutputConfig::from_env_and_flag(&global.color);
    let workspace = super::load_workspace(global)?;
    let orchestrator = super::orchestrator(global, &workspace);

    let mr = args.mr.map(MergeRequestId::new).transpose()?;
    let entries = orchestrator.env_list(mr.as_ref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        print!("{}", render_entries(&output, &entries));
    }
    Ok(())
}

fn outputs(args: OutputsArgs, global: &GlobalArgs) -> Result<()> {
    let workspace = super::load_workspace(global)?;
    let orchestrator = super::orchestrator(global, &workspace);

    let scope = match args.mr {
        Some(mr) => Scope::MergeRequest(MergeRequestId::new(mr)?),
        None => Scope::Stable,
    };
    let merged = orchestrator.env_outputs(&scope)?;
    let json = serde_json::to_string_pretty(&merged)?;

    if let Some(path) = &args.file {
        std::fs::write(path, format!("{}\n", json))
            .with_context(|| format!("cannot write {}", path.display()))?;
        info!("Wrote outputs of {} to {}", scope, path.display());
    }
    if args.json {
        println!("{}", json);
    } else {
        print!("{}", render_outputs(&merged));
    }
    Ok(())
}

/// One `name = value` line per output, values as JSON
fn render_outputs(outputs: &BTreeMap<String, Value>) -> String {
    outputs
        .iter()
        .map(|(name, value)| format!("{} = {}\n", name, value))
        .collect()
}
