//! # Deploy Command Implementation
//!
//! `envie deploy [SERVICE] --mr <ID>` brings up the service and every
//! dependency that resolves to ephemeral for that merge request, binding the
//! rest to their stable environments. Without `SERVICE` the service owning
//! the current directory is deployed.
//!
//! `envie deploy --stable [SERVICE]` applies the service and its dependencies
//! into the shared stable scope instead.
//!
//! With `--dry-run` nothing is written or applied; the plan is printed with
//! every node marked `planned`, `bound` or `failed`.
//!
//! `-E/--environment database=ephemeral` overrides the declared mixing policy
//! of a dependency for this run. It can be repeated.

use anyhow::{Context, Result};
use clap::Args;

use envie::config::{EnvironmentOverride, MergeRequestId};
use envie::output::OutputConfig;
use envie::phases::execution::ExecutionOptions;
use envie::phases::orchestrator::{resolve_root, ServiceTarget};
use envie::phases::resolution;

use crate::cli::GlobalArgs;

/// Deploy a service and its dependencies
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Service to deploy. Defaults to the service owning the current directory.
    #[arg(value_name = "SERVICE")]
    pub service: Option<String>,

    /// Merge request the environments belong to
    #[arg(long, value_name = "ID", required_unless_present = "stable")]
    pub mr: Option<String>,

    /// Deploy into the shared stable scope instead of a merge request
    #[arg(long, conflicts_with = "mr")]
    pub stable: bool,

    /// Override the environment of a dependency (`database=ephemeral`)
    #[arg(
        short = 'E',
        long = "environment",
        value_name = "SERVICE=KIND",
        conflicts_with = "stable"
    )]
    pub environment: Vec<EnvironmentOverride>,

    /// Show the plan without applying anything
    #[arg(long)]
    pub dry_run: bool,

    /// Keep applying independent branches after a failure
    #[arg(long)]
    pub keep_going: bool,

    /// Maximum number of nodes applied at once within a batch
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: Option<u16>,

    /// Cancel the request after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Print the manifest as JSON
    #[arg(long)]
    pub json: bool,
}

/// Execute the `deploy` command.
pub fn execute(args: DeployArgs, global: &GlobalArgs) -> Result<()> {
    let output = OutputConfig::from_env_and_flag(&global.color);
    let catalog = super::load_catalog(global)?;

    let options = ExecutionOptions {
        concurrency: args
            .concurrency
            .map(usize::from)
            .unwrap_or_else(|| catalog.workspace.concurrency()),
        keep_going: args.keep_going,
    };
    let overrides = resolution::collect_overrides(args.environment.iter().cloned())?;
    let orchestrator = super::orchestrator(global, &catalog.workspace)
        .with_options(options)
        .with_overrides(overrides)
        .with_cancellation(super::cancellation(args.timeout)?);

    let cwd;
    let target = match &args.service {
        Some(name) => ServiceTarget::Named(name),
        None => {
            cwd = std::env::current_dir().context("cannot read the current directory")?;
            ServiceTarget::WorkingDirectory(&cwd)
        }
    };

    let report = if args.stable {
        let service = resolve_root(&catalog, target)?;
        orchestrator.deploy_stable(&catalog, &service, args.dry_run)?
    } else {
        let mr = args
            .mr
            .as_deref()
            .context("--mr is required unless --stable is given")?;
        let mr = MergeRequestId::new(mr)?;
        orchestrator.deploy(&catalog, target, &mr, args.dry_run)?
    };

    super::finish(&report, args.json, &output)
}
