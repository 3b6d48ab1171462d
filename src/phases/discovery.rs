//! Phase 1: Dependency Graph Construction
//!
//! This is the first phase of an envie deployment. It turns the catalog into
//! the dependency graph of one requested service.
//!
//! ## Process
//!
//! 1.  **Breadth-First Expansion**: Starting at the root, each service's
//!     `dependencies` are followed in declared order and looked up in the
//!     catalog. Every service reachable from the root becomes a node.
//!
//! 2.  **Cycle Detection**: The discovered nodes are then coloured
//!     white/gray/black in a depth-first walk from the root. Meeting a gray
//!     node means the current path loops back on itself; the error names the
//!     full loop (`api -> database -> api`).
//!
//! Because dependency lists are walked in declared order, two runs over
//! unchanged declarations produce identical graphs and, downstream, identical
//! plans.

use std::collections::{BTreeMap, VecDeque};

use log::debug;

use super::DependencyGraph;
use crate::error::{Error, Result};
use crate::registry::Catalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Build the dependency graph of `root` from the catalog.
///
/// Fails with [`Error::NotFound`] when `root` (or, for catalogs built by hand,
/// a dependency) is unknown and with [`Error::CycleDetected`] when the graph
/// is not acyclic.
pub fn build(catalog: &Catalog, root: &str) -> Result<DependencyGraph> {
    let root_service = catalog.lookup(root)?;
    let mut graph = DependencyGraph::new(root_service.name.clone());
    let mut queue = VecDeque::from([root_service.name.clone()]);

    while let Some(current) = queue.pop_front() {
        let service = catalog.lookup(&current)?;
        for dependency in &service.dependencies {
            let target = catalog.lookup(dependency)?;
            if graph.add_node(&target.name) {
                queue.push_back(target.name.clone());
            }
            graph.add_edge(&service.name, &target.name);
        }
    }

    detect_cycles(&graph)?;

    debug!(
        "Dependency graph for '{}': {} node(s) [{}]",
        root,
        graph.len(),
        graph.nodes().collect::<Vec<_>>().join(", ")
    );
    Ok(graph)
}

/// Verify the graph is acyclic using white/gray/black colouring.
pub fn detect_cycles(graph: &DependencyGraph) -> Result<()> {
    let mut colors: BTreeMap<&str, Color> = graph.nodes().map(|n| (n, Color::White)).collect();
    let mut path = Vec::new();

    for node in graph.nodes() {
        if colors.get(node) == Some(&Color::White) {
            visit(graph, node, &mut colors, &mut path)?;
        }
    }
    Ok(())
}

fn visit<'a>(
    graph: &'a DependencyGraph,
    node: &'a str,
    colors: &mut BTreeMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    colors.insert(node, Color::Gray);
    path.push(node);

    for dependency in graph.dependencies(node) {
        let dependency = dependency.as_str();
        match colors.get(dependency).copied().unwrap_or(Color::White) {
            Color::Gray => {
                let start = path.iter().position(|n| *n == dependency).unwrap_or(0);
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(dependency);
                return Err(Error::CycleDetected {
                    cycle: cycle.join(" -> "),
                });
            }
            Color::White => visit(graph, dependency, colors, path)?,
            Color::Black => {}
        }
    }

    path.pop();
    colors.insert(node, Color::Black);
    Ok(())
}
