//! # Tree Command Implementation
//!
//! Displays the dependency tree of a service, each node annotated with the
//! environment kind it resolves to when the service is deployed for a merge
//! request:
//!
//! - `[ephemeral]`: brought up per merge request
//! - `[stable]`: bound to the shared stable environment
//! - `[not deployed]`: only reachable through a stable environment
//!
//! A dependency shared by several services appears under each of them.
//! `--environment` previews the same overrides `deploy` accepts.
//! Read-only; the ledger is not consulted.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Args;
use ptree::{print_tree, TreeItem};

use envie::config::{EnvironmentKind, EnvironmentOverride};
use envie::output::{emoji, OutputConfig};
use envie::phases::orchestrator::{resolve_root, ServiceTarget};
use envie::phases::{self, resolution, DependencyGraph};

use crate::cli::GlobalArgs;

/// Display the dependency tree of a service
#[derive(Args, Debug)]
pub struct TreeArgs {
    /// Root service. Defaults to the service owning the current directory.
    #[arg(value_name = "SERVICE")]
    pub service: Option<String>,

    /// Maximum depth to display in the tree.
    ///
    /// Use 0 to show only the root, 1 to show direct dependencies, etc.
    #[arg(long, value_name = "NUM")]
    pub depth: Option<usize>,

    /// Override the environment of a dependency (`database=ephemeral`)
    #[arg(short = 'E', long = "environment", value_name = "SERVICE=KIND")]
    pub environment: Vec<EnvironmentOverride>,
}

/// Execute the `tree` command.
pub fn execute(args: TreeArgs, global: &GlobalArgs) -> Result<()> {
    let output = OutputConfig::from_env_and_flag(&global.color);
    let catalog = super::load_catalog(global)?;

    let cwd;
    let target = match &args.service {
        Some(name) => ServiceTarget::Named(name),
        None => {
            cwd = std::env::current_dir().context("cannot read the current directory")?;
            ServiceTarget::WorkingDirectory(&cwd)
        }
    };
    let root = resolve_root(&catalog, target)?;
    let graph = phases::build_graph(&catalog, &root)?;
    let overrides = resolution::collect_overrides(args.environment)?;
    let kinds: BTreeMap<String, EnvironmentKind> = resolution::decide(&graph, &catalog, &overrides)?
        .into_iter()
        .map(|decision| (decision.service, decision.kind))
        .collect();

    println!(
        "{} Dependency tree of '{}'",
        emoji(&output, "🌳", "[TREE]"),
        root
    );
    let tree_root = build_tree_node(&graph, &kinds, &root, args.depth.unwrap_or(usize::MAX), 0);
    print_tree(&tree_root).context("failed to display tree")?;

    Ok(())
}

fn annotation(kinds: &BTreeMap<String, EnvironmentKind>, service: &str) -> &'static str {
    match kinds.get(service) {
        Some(kind) => kind.as_str(),
        None => "not deployed",
    }
}

/// Build a tree node for `service` and, depth permitting, its dependencies
fn build_tree_node(
    graph: &DependencyGraph,
    kinds: &BTreeMap<String, EnvironmentKind>,
    service: &str,
    max_depth: usize,
    current_depth: usize,
) -> TreeNode {
    let label = format!("{} [{}]", service, annotation(kinds, service));

    let children = if current_depth >= max_depth {
        vec![]
    } else {
        graph
            .dependencies(service)
            .iter()
            .map(|dep| build_tree_node(graph, kinds, dep, max_depth, current_depth + 1))
            .collect()
    };
    TreeNode { label, children }
}

/// Tree node structure for ptree visualization
#[derive(Clone)]
struct TreeNode {
    label: String,
    children: Vec<TreeNode>,
}

impl TreeItem for TreeNode {
    type Child = TreeNode;

    fn write_self<W: std::io::Write>(
        &self,
        f: &mut W,
        _style: &ptree::Style,
    ) -> std::io::Result<()> {
        write!(f, "{}", self.label)
    }

    fn children(&self) -> std::borrow::Cow<'_, [Self::Child]> {
        std::borrow::Cow::Borrowed(&self.children)
    }
}
