//! # Validate Command Implementation
//!
//! Checks a workspace without deploying anything:
//!
//! - **Declarations**: every `.envie` file parses, names are unique and every
//!   dependency points at a declared service.
//! - **Graphs**: the dependency graph of every service is acyclic.
//! - **Policies**: resolution succeeds for every service; conflicting mixing
//!   policies are logged as warnings.
//!
//! This command is a safe, read-only operation that does not modify any files.

use anyhow::Result;
use clap::Args;

use envie::output::{emoji, OutputConfig};
use envie::phases;
use envie::phases::resolution::{self, Overrides};
use envie::registry::Catalog;

use crate::cli::GlobalArgs;

/// Check every service declaration and dependency graph
#[derive(Args, Debug)]
pub struct ValidateArgs {}

/// Execute the `validate` command.
pub fn execute(_args: ValidateArgs, global: &GlobalArgs) -> Result<()> {
    let out = OutputConfig::from_env_and_flag(&global.color);
    let root = super::workspace_root(global)?;
    println!(
        "{} Validating workspace: {}",
        emoji(&out, "🔍", "[SCAN]"),
        root.display()
    );

    let catalog = match Catalog::load(&root) {
        Ok(catalog) => {
            println!(
                "{} Loaded {} service declaration(s)",
                emoji(&out, "✅", "[OK]"),
                catalog.len()
            );
            catalog
        }
        Err(e) => {
            println!("{} {}", emoji(&out, "❌", "[ERR]"), e);
            return Err(anyhow::anyhow!("Workspace validation failed"));
        }
    };

    println!(
        "\n{} Checking dependency graphs...",
        emoji(&out, "🔄", "[CHECK]")
    );
    let problems = check_graphs(&catalog);
    for problem in &problems {
        println!("{} {}", emoji(&out, "❌", "[ERR]"), problem);
    }

    if problems.is_empty() {
        println!(
            "{} All {} service graph(s) are valid",
            emoji(&out, "✅", "[OK]"),
            catalog.len()
        );
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Workspace validation failed with {} error(s)",
            problems.len()
        ))
    }
}

/// One message per service whose graph cannot be built or resolved
fn check_graphs(catalog: &Catalog) -> Vec<String> {
    catalog
        .names()
        .filter_map(|name| {
            let result = phases::build_graph(catalog, name)
                .and_then(|graph| resolution::decide(&graph, catalog, &Overrides::new()));
            result.err().map(|e| format!("{}: {}", name, e))
        })
        .collect()
}
