//! Implementation of the phases of an envie deployment.
//!
//! ## Overview
//!
//! A deploy request runs through these phases:
//! 1. Discovery - Build the dependency graph of the requested service
//! 2. Resolution - Decide ephemeral vs. stable per node and derive state keys
//! 3. Ordering - Compute deterministic deploy batches (reverse for destroy)
//! 4. Execution - Apply/destroy batch by batch, recording every node in the ledger
//!
//! The orchestrator ties the phases together and is the invocation surface
//! used by the CLI (`deploy`, `destroy`, `env list`).
//!
//! Every value produced here is request-scoped. Only the ledger and the
//! engine's own state backend outlive a run.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::{EnvironmentKind, MergeRequestId};

// Phase modules
pub mod discovery;
pub mod execution;
pub mod orchestrator;
pub mod ordering;
pub mod resolution;

pub use discovery::build as build_graph;
pub use ordering::{plan, reverse_plan};
pub use resolution::resolve;

/// Dependency graph of one deploy request.
///
/// Nodes are the services reachable from the root; an edge `A -> B` means A
/// depends on B. Always acyclic once returned by [`discovery::build`].
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyGraph {
    root: String,
    /// Nodes in breadth-first discovery order
    order: Vec<String>,
    /// Dependencies of each node in declared order
    edges: BTreeMap<String, Vec<String>>,
}

impl DependencyGraph {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        let mut edges = BTreeMap::new();
        edges.insert(root.clone(), Vec::new());
        Self {
            order: vec![root.clone()],
            root,
            edges,
        }
    }

    /// Add a node if it is not present yet. Returns `true` when it was new.
    pub fn add_node(&mut self, name: &str) -> bool {
        if self.edges.contains_key(name) {
            return false;
        }
        self.edges.insert(name.to_string(), Vec::new());
        self.order.push(name.to_string());
        true
    }

    /// Add an edge `from -> to`, creating `to` if needed.
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        if let Some(deps) = self.edges.get_mut(from) {
            if !deps.iter().any(|d| d == to) {
                deps.push(to.to_string());
            }
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Nodes in breadth-first discovery order, root first
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    /// Direct dependencies of `name` in declared order
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes that directly depend on `name`, in discovery order
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.nodes()
            .filter(|node| self.dependencies(node).iter().any(|d| d == name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Concrete environment a graph node is bound to for one merge request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedEnvironment {
    pub service_name: String,
    pub kind: EnvironmentKind,
    /// Set only for ephemeral environments
    pub merge_request_id: Option<MergeRequestId>,
    /// Backend address of this node's infrastructure state
    pub state_key: String,
    /// Outputs available to dependents as input variables
    pub outputs: BTreeMap<String, serde_json::Value>,
}

impl ResolvedEnvironment {
    pub fn is_stable(&self) -> bool {
        self.kind == EnvironmentKind::Stable
    }
}

/// Result of the resolution phase for one request
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Kind of environment this request creates. Nodes of the other kind are
    /// bindings and are never applied.
    pub target: EnvironmentKind,
    /// Successfully resolved nodes
    pub environments: BTreeMap<String, ResolvedEnvironment>,
    /// Nodes whose binding could not be resolved, with the reason
    pub unresolved: BTreeMap<String, String>,
}

impl Default for Resolution {
    fn default() -> Self {
        Self::new(EnvironmentKind::Ephemeral)
    }
}

impl Resolution {
    pub fn new(target: EnvironmentKind) -> Self {
        Self {
            target,
            environments: BTreeMap::new(),
            unresolved: BTreeMap::new(),
        }
    }

    pub fn get(&self, service: &str) -> Option<&ResolvedEnvironment> {
        self.environments.get(service)
    }

    /// Whether `service` is resolved and must be applied by this request
    pub fn needs_apply(&self, service: &str) -> bool {
        self.get(service).is_some_and(|env| env.kind == self.target)
    }

    /// Resolved nodes that are only referenced, never applied
    pub fn bindings(&self) -> impl Iterator<Item = &ResolvedEnvironment> {
        self.environments
            .values()
            .filter(move |env| env.kind != self.target)
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Ordered deploy batches.
///
/// Nodes within a batch have no dependency relation and are sorted by name;
/// every node's dependencies sit in strictly earlier batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentPlan {
    pub batches: Vec<Vec<String>>,
}

impl DeploymentPlan {
    pub fn new(batches: Vec<Vec<String>>) -> Self {
        Self { batches }
    }

    /// Index of the batch containing `service`
    pub fn batch_index(&self, service: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|node| node == service))
    }

    /// All nodes in execution order
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.batches.iter().flatten().map(String::as_str)
    }

    pub fn contains(&self, service: &str) -> bool {
        self.nodes().any(|node| node == service)
    }

    pub fn node_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}

impl fmt::Display for DeploymentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.batches.is_empty() {
            return f.write_str("(empty)");
        }
        let rendered: Vec<String> = self
            .batches
            .iter()
            .map(|batch| format!("[{}]", batch.join(", ")))
            .collect();
        f.write_str(&rendered.join(" -> "))
    }
}
