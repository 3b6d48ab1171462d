//! Phase 3: Deployment Ordering
//!
//! Turns a resolved graph into batches. A node's batch index is one more than
//! the largest batch index among its planned dependencies (zero without any),
//! so everything a node needs has finished before its batch starts. Nodes in a
//! batch are independent of each other and sorted by name.
//!
//! Only nodes the request applies are planned; stable bindings are not part of
//! any batch. Teardown walks the same batches backwards.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use super::{DependencyGraph, DeploymentPlan, Resolution};
use crate::ledger::LedgerEntry;

/// Plan the nodes of `graph` that `resolution` marks for apply
pub fn plan(graph: &DependencyGraph, resolution: &Resolution) -> DeploymentPlan {
    let planned: BTreeSet<&str> = graph
        .nodes()
        .filter(|node| resolution.needs_apply(node))
        .collect();

    let nodes = planned
        .iter()
        .map(|node| {
            let dependencies = graph
                .dependencies(node)
                .iter()
                .map(String::as_str)
                .filter(|dep| planned.contains(dep))
                .collect();
            (*node, dependencies)
        })
        .collect();

    let plan = layer(nodes);
    debug!("Deployment plan: {}", plan);
    plan
}

/// The same batches in reverse order, for teardown
pub fn reverse_plan(plan: &DeploymentPlan) -> DeploymentPlan {
    DeploymentPlan::new(plan.batches.iter().rev().cloned().collect())
}

/// Forward plan over ledger entries, using their recorded dependencies.
///
/// Dependencies that are not among `entries` are ignored.
pub fn plan_from_entries(entries: &[LedgerEntry]) -> DeploymentPlan {
    let present: BTreeSet<&str> = entries.iter().map(|e| e.service_name.as_str()).collect();
    let nodes = entries
        .iter()
        .map(|entry| {
            let dependencies = entry
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|dep| present.contains(dep))
                .collect();
            (entry.service_name.as_str(), dependencies)
        })
        .collect();
    layer(nodes)
}

/// Assign batch indices level by level.
///
/// Each round takes every node whose dependencies all sit in earlier rounds.
/// Input built from a validated graph is acyclic; anything left over when no
/// round makes progress is placed in one final batch.
fn layer(nodes: BTreeMap<&str, Vec<&str>>) -> DeploymentPlan {
    let mut assigned: BTreeSet<&str> = BTreeSet::new();
    let mut remaining = nodes;
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.iter().all(|dep| assigned.contains(dep)))
            .map(|(node, _)| *node)
            .collect();

        if ready.is_empty() {
            let stuck: Vec<String> = remaining.keys().map(|n| n.to_string()).collect();
            warn!(
                "Recorded dependencies form a cycle between {}; scheduling them last",
                stuck.join(", ")
            );
            batches.push(stuck);
            break;
        }

        for node in &ready {
            remaining.remove(node);
        }
        assigned.extend(ready.iter().copied());
        batches.push(ready.into_iter().map(String::from).collect());
    }

    DeploymentPlan::new(batches)
}
