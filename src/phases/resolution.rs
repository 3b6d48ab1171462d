//! Phase 2: Environment Resolution
//!
//! Decides, for every node of a dependency graph, whether it gets its own
//! merge-request-scoped instance or binds to the shared stable one.
//!
//! ## Policy
//!
//! For an edge `requester -> dependency` the first of these wins:
//!
//! 1. an override given for this run (`deploy --environment database=stable`)
//! 2. the requester's override for that dependency (`depends: [{name, environment}]`)
//! 3. the dependency's own `environment` default
//! 4. `ephemeral`
//!
//! The root is always ephemeral. Nodes are visited breadth-first from the
//! root, so when several requesters reach the same dependency the one
//! discovered first decides; later requesters that disagree are logged.
//!
//! Dependencies of a stable node belong to that stable environment's own
//! lifecycle. Nodes reachable only through stable nodes are therefore left out
//! of the resolution entirely.
//!
//! ## Bindings
//!
//! A stable node binds to the `applied` ledger entry of the stable scope and
//! reuses its state key and outputs. Without one the request fails with
//! [`Error::UnresolvedStableBinding`]; nothing in the merge request can be
//! applied against a stable environment that does not exist.

use std::collections::{BTreeMap, VecDeque};

use log::{debug, warn};

use super::{DependencyGraph, Resolution, ResolvedEnvironment};
use crate::config::{EnvironmentKind, EnvironmentOverride, MergeRequestId};
use crate::error::{Error, Result};
use crate::ledger::{LedgerKey, LedgerStatus, LedgerStore, Scope};
use crate::registry::Catalog;

/// Per-run mixing overrides, by service name
pub type Overrides = BTreeMap<String, EnvironmentKind>;

/// Collect command-line overrides, rejecting a service given two kinds
pub fn collect_overrides(
    overrides: impl IntoIterator<Item = EnvironmentOverride>,
) -> Result<Overrides> {
    let mut collected = Overrides::new();
    for EnvironmentOverride { service, kind } in overrides {
        match collected.get(&service) {
            Some(existing) if *existing != kind => {
                return Err(Error::config(format!(
                    "'{}' is overridden as both {} and {}",
                    service, existing, kind
                )));
            }
            _ => {
                collected.insert(service, kind);
            }
        }
    }
    Ok(collected)
}

/// Policy decided for one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub service: String,
    pub kind: EnvironmentKind,
    /// The requester whose policy decided, `None` for the root
    pub requested_by: Option<String>,
}

/// State key of an ephemeral instance. Deterministic in its inputs.
pub fn ephemeral_state_key(project: &str, merge_request: &MergeRequestId, service: &str) -> String {
    format!(
        "ephemeral/{}-{}/{}/terraform.tfstate",
        project, merge_request, service
    )
}

/// State key of a stable instance
pub fn stable_state_key(project: &str, service: &str) -> String {
    format!("stable/{}/{}/terraform.tfstate", project, service)
}

/// Decide ephemeral vs. stable for every node the request includes, in
/// breadth-first order from the root.
///
/// Overrides must name known services and cannot make the root stable.
/// Overrides for services outside the graph are ignored with a warning.
pub fn decide(
    graph: &DependencyGraph,
    catalog: &Catalog,
    overrides: &Overrides,
) -> Result<Vec<Decision>> {
    check_overrides(graph, catalog, overrides)?;
    let root = graph.root().to_string();
    let mut decided: BTreeMap<String, EnvironmentKind> = BTreeMap::new();
    let mut decisions = vec![Decision {
        service: root.clone(),
        kind: EnvironmentKind::Ephemeral,
        requested_by: None,
    }];
    decided.insert(root.clone(), EnvironmentKind::Ephemeral);

    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        let requester = catalog.lookup(&current)?;
        for dependency in graph.dependencies(&current) {
            let kind = overrides
                .get(dependency)
                .copied()
                .or(requester.policy_for(dependency))
                .or(catalog.lookup(dependency)?.default_policy)
                .unwrap_or(EnvironmentKind::Ephemeral);

            match decided.get(dependency) {
                Some(existing) if *existing != kind => {
                    warn!(
                        "'{}' requests '{}' as {}, but it is already resolved as {}; keeping {}",
                        current, dependency, kind, existing, existing
                    );
                }
                Some(_) => {}
                None => {
                    decided.insert(dependency.clone(), kind);
                    decisions.push(Decision {
                        service: dependency.clone(),
                        kind,
                        requested_by: Some(current.clone()),
                    });
                    if kind == EnvironmentKind::Ephemeral {
                        queue.push_back(dependency.clone());
                    }
                }
            }
        }
    }

    for node in graph.nodes().filter(|n| !decided.contains_key(*n)) {
        debug!(
            "'{}' is only reachable through stable environments and is not part of this request",
            node
        );
    }

    Ok(decisions)
}

fn check_overrides(
    graph: &DependencyGraph,
    catalog: &Catalog,
    overrides: &Overrides,
) -> Result<()> {
    for (service, kind) in overrides {
        catalog.lookup(service)?;
        if service == graph.root() && *kind == EnvironmentKind::Stable {
            return Err(Error::ConfigParse {
                message: format!(
                    "'{}' is the service being deployed and is always ephemeral",
                    service
                ),
                hint: Some(format!(
                    "use 'envie deploy --stable {}' to deploy it as stable",
                    service
                )),
            });
        }
        if !graph.contains(service) {
            warn!(
                "Ignoring override for '{}': it is not a dependency of '{}'",
                service,
                graph.root()
            );
        }
    }
    Ok(())
}

/// Resolve every node for `merge_request`, failing on the first stable binding
/// that has no applied stable environment.
pub fn resolve(
    graph: &DependencyGraph,
    catalog: &Catalog,
    merge_request: &MergeRequestId,
    ledger: &dyn LedgerStore,
    overrides: &Overrides,
) -> Result<Resolution> {
    resolve_with(graph, catalog, merge_request, ledger, overrides, true)
}

/// Like [`resolve`], but records unresolved bindings in
/// [`Resolution::unresolved`] instead of failing. Used by dry runs so the
/// rest of the plan can still be shown.
pub fn resolve_partial(
    graph: &DependencyGraph,
    catalog: &Catalog,
    merge_request: &MergeRequestId,
    ledger: &dyn LedgerStore,
    overrides: &Overrides,
) -> Result<Resolution> {
    resolve_with(graph, catalog, merge_request, ledger, overrides, false)
}

fn resolve_with(
    graph: &DependencyGraph,
    catalog: &Catalog,
    merge_request: &MergeRequestId,
    ledger: &dyn LedgerStore,
    overrides: &Overrides,
    strict: bool,
) -> Result<Resolution> {
    let project = catalog.workspace.project_name();
    let mut resolution = Resolution::new(EnvironmentKind::Ephemeral);

    for decision in decide(graph, catalog, overrides)? {
        let service = decision.service;
        match decision.kind {
            EnvironmentKind::Ephemeral => {
                let environment = ResolvedEnvironment {
                    state_key: ephemeral_state_key(&project, merge_request, &service),
                    service_name: service.clone(),
                    kind: EnvironmentKind::Ephemeral,
                    merge_request_id: Some(merge_request.clone()),
                    outputs: BTreeMap::new(),
                };
                debug!("'{}' -> ephemeral ({})", service, environment.state_key);
                resolution.environments.insert(service, environment);
            }
            EnvironmentKind::Stable => {
                let key = LedgerKey::new(Scope::Stable, service.clone());
                match ledger.get(&key)? {
                    Some(entry) if entry.status == LedgerStatus::Applied => {
                        debug!("'{}' -> stable ({})", service, entry.state_key);
                        resolution.environments.insert(
                            service.clone(),
                            ResolvedEnvironment {
                                service_name: service,
                                kind: EnvironmentKind::Stable,
                                merge_request_id: None,
                                state_key: entry.state_key,
                                outputs: entry.outputs,
                            },
                        );
                    }
                    _ => {
                        let error = Error::UnresolvedStableBinding {
                            service: service.clone(),
                            required_by: decision.requested_by.unwrap_or_default(),
                        };
                        if strict {
                            return Err(error);
                        }
                        resolution.unresolved.insert(service, error.to_string());
                    }
                }
            }
        }
    }

    Ok(resolution)
}

/// Resolve every node of `graph` into the stable scope.
///
/// Used when deploying a stable environment itself: the root and all of its
/// dependencies are stable and applied under stable state keys.
pub fn resolve_stable(graph: &DependencyGraph, catalog: &Catalog) -> Resolution {
    let project = catalog.workspace.project_name();
    let mut resolution = Resolution::new(EnvironmentKind::Stable);
    for node in graph.nodes() {
        resolution.environments.insert(
            node.to_string(),
            ResolvedEnvironment {
                service_name: node.to_string(),
                kind: EnvironmentKind::Stable,
                merge_request_id: None,
                state_key: stable_state_key(&project, node),
                outputs: BTreeMap::new(),
            },
        );
    }
    resolution
}
