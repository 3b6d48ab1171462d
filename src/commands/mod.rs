//! # CLI Command Implementations
//!
//! Each subcommand of `envie` lives in its own file with:
//! - an `Args` struct deriving `clap::Args`
//! - an `execute` function taking the parsed args (and the global options)
//!
//! The helpers below load the workspace once per invocation and wire the
//! file ledger and the engine executor into an [`Orchestrator`].

pub mod completions;
pub mod deploy;
pub mod destroy;
pub mod env;
pub mod ls;
pub mod tree;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;

use envie::cancel::CancellationToken;
use envie::executor::TerraformExecutor;
use envie::ledger::FileLedger;
use envie::output::{render_report, OutputConfig};
use envie::phases::orchestrator::{DeploymentReport, Orchestrator};
use envie::registry::{self, Catalog, Workspace};

use crate::cli::GlobalArgs;

/// Workspace root from `--workspace`, or the nearest ancestor of the current
/// directory holding `workspace.envie`
pub fn workspace_root(global: &GlobalArgs) -> Result<PathBuf> {
    match &global.workspace {
        Some(root) => Ok(root.clone()),
        None => {
            let cwd = std::env::current_dir().context("cannot read the current directory")?;
            Ok(registry::find_workspace_root(&cwd))
        }
    }
}

pub fn load_catalog(global: &GlobalArgs) -> Result<Catalog> {
    let root = workspace_root(global)?;
    Catalog::load(&root)
        .with_context(|| format!("failed to load workspace {}", root.display()))
}

/// Workspace settings only, for commands driven by the ledger alone
pub fn load_workspace(global: &GlobalArgs) -> Result<Workspace> {
    let root = workspace_root(global)?;
    Workspace::load(&root)
        .with_context(|| format!("failed to load workspace {}", root.display()))
}

/// Orchestrator over the file ledger and the configured engine binary
pub fn orchestrator(global: &GlobalArgs, workspace: &Workspace) -> Orchestrator {
    let workspace = workspace.clone();
    let ledger_path = global
        .ledger
        .clone()
        .unwrap_or_else(|| workspace.ledger_path());
    let binary = global
        .engine
        .clone()
        .unwrap_or_else(|| workspace.engine_binary());

    Orchestrator::new(
        workspace,
        Arc::new(FileLedger::new(ledger_path)),
        Arc::new(TerraformExecutor::new(binary)),
    )
}

/// Token cancelled by Ctrl-C and, when `timeout_secs` is given, by the
/// deadline
pub fn cancellation(timeout_secs: Option<u64>) -> Result<CancellationToken> {
    let token = match timeout_secs {
        Some(secs) => CancellationToken::with_timeout(Duration::from_secs(secs)),
        None => CancellationToken::new(),
    };

    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted; waiting for running engine processes to stop");
        handler_token.cancel();
    })
    .context("failed to install the Ctrl-C handler")?;

    Ok(token)
}

/// Head an error caused by the library with its category, so the first line
/// of the report says what kind of failure it was
pub fn categorize(err: anyhow::Error) -> anyhow::Error {
    let category = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<envie::error::Error>())
        .map(envie::error::Error::category);
    match category {
        Some(category) => err.context(category.to_string()),
        None => err,
    }
}

/// Print the manifest and turn an unsuccessful report into an error
pub fn finish(report: &DeploymentReport, json: bool, output: &OutputConfig) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render_report(output, report));
    }

    if report.is_success() {
        Ok(())
    } else {
        let failed = report.nodes_with("failed").len();
        let skipped = report.nodes_with("skipped").len();
        Err(anyhow::anyhow!(
            "{} node(s) failed, {} skipped",
            failed,
            skipped
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envie::error::Error;

    #[test]
    fn test_categorize_library_errors() {
        let err = anyhow::Error::from(Error::CycleDetected {
            cycle: "a -> b -> a".to_string(),
        })
        .context("failed to load workspace /ws");

        let categorized = categorize(err);
        assert_eq!(categorized.to_string(), "configuration error");
        let chain: Vec<String> = categorized.chain().map(|c| c.to_string()).collect();
        assert_eq!(chain[1], "failed to load workspace /ws");
        assert!(chain[2].contains("a -> b -> a"));

        let ledger = categorize(anyhow::Error::from(Error::Ledger {
            path: "ledger.json".to_string(),
            message: "corrupted".to_string(),
        }));
        assert_eq!(ledger.to_string(), "state ledger unavailable");
    }

    #[test]
    fn test_categorize_leaves_other_errors_alone() {
        let err = categorize(anyhow::anyhow!("1 node(s) failed, 0 skipped"));
        assert_eq!(err.to_string(), "1 node(s) failed, 0 skipped");
        assert_eq!(err.chain().count(), 1);
    }
}
