//! # Ls Command Implementation
//!
//! Lists every service of the workspace catalog with its dependencies and the
//! mixing policies it declares. Read-only.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use envie::config::EnvironmentKind;
use envie::output::{emoji, OutputConfig};
use envie::registry::{Catalog, Service};

use crate::cli::GlobalArgs;

/// List the services of the workspace
#[derive(Args, Debug)]
pub struct LsArgs {
    /// Use long listing format showing directory and description
    #[arg(short, long)]
    pub long: bool,

    /// Show only the number of services
    #[arg(long)]
    pub count: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ServiceSummary<'a> {
    name: &'a str,
    description: &'a str,
    directory: String,
    dependencies: &'a [String],
    default_policy: Option<EnvironmentKind>,
    mixing_policy: &'a BTreeMap<String, EnvironmentKind>,
}

/// Execute the `ls` command.
pub fn execute(args: LsArgs, global: &GlobalArgs) -> Result<()> {
    let output = OutputConfig::from_env_and_flag(&global.color);
    let catalog = super::load_catalog(global)?;

    if args.count {
        println!("{}", catalog.len());
        return Ok(());
    }

    if args.json {
        let summaries: Vec<ServiceSummary<'_>> = catalog
            .services()
            .map(|service| summarize(&catalog, service))
            .collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if catalog.is_empty() {
        println!(
            "{} No services found in {}",
            emoji(&output, "📭", "[INFO]"),
            catalog.workspace.root.display()
        );
        return Ok(());
    }

    let width = catalog.names().map(str::len).max().unwrap_or(0);
    for service in catalog.services() {
        println!("{}", list_line(service, width));
        if args.long {
            println!(
                "    {}",
                relative(&catalog.workspace.root, &service.directory)
            );
            if !service.description.is_empty() {
                println!("    {}", service.description);
            }
        }
    }
    println!("\n{} service(s)", catalog.len());

    Ok(())
}

fn summarize<'a>(catalog: &Catalog, service: &'a Service) -> ServiceSummary<'a> {
    ServiceSummary {
        name: &service.name,
        description: &service.description,
        directory: relative(&catalog.workspace.root, &service.directory),
        dependencies: &service.dependencies,
        default_policy: service.default_policy,
        mixing_policy: &service.mixing_policy,
    }
}

/// `api       [stable] -> networking, database (stable)`
fn list_line(service: &Service, width: usize) -> String {
    let mut line = format!("{:<width$}", service.name);
    if let Some(policy) = service.default_policy {
        line.push_str(&format!("  [{}]", policy));
    }
    if !service.dependencies.is_empty() {
        let dependencies: Vec<String> = service
            .dependencies
            .iter()
            .map(|dep| match service.policy_for(dep) {
                Some(policy) => format!("{} ({})", dep, policy),
                None => dep.clone(),
            })
            .collect();
        line.push_str(&format!("  -> {}", dependencies.join(", ")));
    }
    line.trim_end().to_string()
}

fn relative(root: &Path, directory: &Path) -> String {
    directory
        .strip_prefix(root)
        .unwrap_or(directory)
        .display()
        .to_string()
}
