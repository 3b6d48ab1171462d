//! # Destroy Command Implementation
//!
//! `envie destroy --mr <ID>` tears down every environment the merge request
//! owns, in reverse dependency order, using only what the ledger recorded.
//! Stable environments the merge request referenced are left alone.
//!
//! `envie destroy --stable <SERVICE>` tears down one stable environment,
//! refused while another stable environment depends on it.
//!
//! Asks for confirmation unless `--yes` or `--dry-run` is given.

use anyhow::Result;
use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};

use envie::config::MergeRequestId;
use envie::output::{emoji, OutputConfig};
use envie::phases::execution::ExecutionOptions;

use crate::cli::GlobalArgs;

/// Tear down environments
#[derive(Args, Debug)]
pub struct DestroyArgs {
    /// Merge request whose environments are destroyed
    #[arg(long, value_name = "ID", required_unless_present = "stable")]
    pub mr: Option<String>,

    /// Destroy one stable environment instead
    #[arg(long, value_name = "SERVICE", conflicts_with = "mr")]
    pub stable: Option<String>,

    /// Show what would be destroyed without doing it
    #[arg(long)]
    pub dry_run: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,

    /// Keep destroying independent branches after a failure
    #[arg(long)]
    pub keep_going: bool,

    /// Cancel the request after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the manifest as JSON
    #[arg(long)]
    pub json: bool,
}

enum Request {
    Stable(String),
    MergeRequest(MergeRequestId),
}

/// Execute the `destroy` command.
pub fn execute(args: DestroyArgs, global: &GlobalArgs) -> Result<()> {
    let output = OutputConfig::from_env_and_flag(&global.color);
    let workspace = super::load_workspace(global)?;
    let request = match (args.stable, args.mr) {
        (Some(service), _) => Request::Stable(service),
        (None, Some(mr)) => Request::MergeRequest(MergeRequestId::new(mr)?),
        (None, None) => anyhow::bail!("either --mr or --stable is required"),
    };
    let what = match &request {
        Request::Stable(service) => format!("stable environment '{}'", service),
        Request::MergeRequest(mr) => format!("every environment of merge request {}", mr),
    };

    if !args.yes && !args.dry_run {
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!("Destroy {}?", what))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("{} Aborted, nothing was destroyed", emoji(&output, "✋", "[ABORT]"));
            return Ok(());
        }
    }

    let options = ExecutionOptions {
        concurrency: workspace.concurrency(),
        keep_going: args.keep_going,
    };
    let orchestrator = super::orchestrator(global, &workspace)
        .with_options(options)
        .with_cancellation(super::cancellation(args.timeout)?);

    let report = match &request {
        Request::Stable(service) => orchestrator.destroy_stable(service, args.dry_run)?,
        Request::MergeRequest(mr) => orchestrator.destroy(mr, args.dry_run)?,
    };

    super::finish(&report, args.json, &output)
}
