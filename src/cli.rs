//! CLI argument parsing and command dispatch

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use crate::commands;

/// envie - Ephemeral per-merge-request environments on top of stable infrastructure
#[derive(Parser, Debug)]
#[command(name = "envie")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    log_level: String,
}

/// Options shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Workspace root. Defaults to the nearest directory above the current
    /// one containing `workspace.envie`.
    #[arg(long, global = true, value_name = "DIR", env = "ENVIE_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Ledger file, overriding the workspace setting
    #[arg(long, global = true, value_name = "FILE", env = "ENVIE_LEDGER")]
    pub ledger: Option<PathBuf>,

    /// Infrastructure engine binary (e.g. `terraform`, `tofu`)
    #[arg(long, global = true, value_name = "BINARY", env = "ENVIE_ENGINE")]
    pub engine: Option<String>,

    /// Colorize output (always, never, auto)
    #[arg(long, global = true, value_name = "WHEN", default_value = "auto")]
    pub color: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deploy a service and its dependencies for a merge request
    Deploy(commands::deploy::DeployArgs),

    /// Tear down the environments of a merge request
    Destroy(commands::destroy::DestroyArgs),

    /// Inspect recorded environments
    Env(commands::env::EnvArgs),

    /// List the services of the workspace
    Ls(commands::ls::LsArgs),

    /// Display the dependency tree of a service
    Tree(commands::tree::TreeArgs),

    /// Check every service declaration and dependency graph
    Validate(commands::validate::ValidateArgs),

    /// Generate shell completion scripts
    Completions(commands::completions::CompletionsArgs),
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        init_logging(&self.log_level);

        let result = match self.command {
            Commands::Deploy(args) => commands::deploy::execute(args, &self.global),
            Commands::Destroy(args) => commands::destroy::execute(args, &self.global),
            Commands::Env(args) => commands::env::execute(args, &self.global),
            Commands::Ls(args) => commands::ls::execute(args, &self.global),
            Commands::Tree(args) => commands::tree::execute(args, &self.global),
            Commands::Validate(args) => commands::validate::execute(args, &self.global),
            Commands::Completions(args) => commands::completions::execute(args),
        };
        result.map_err(commands::categorize)
    }
}

/// `RUST_LOG` takes precedence over `--log-level`
fn init_logging(level: &str) {
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}
