//! Orchestrator for deploy and teardown requests
//!
//! This module ties the phases together behind the operations the CLI
//! exposes:
//!
//! - [`Orchestrator::deploy`]: graph, resolution, plan and apply for one
//!   merge request
//! - [`Orchestrator::destroy`]: teardown of everything a merge request owns,
//!   driven only by the ledger
//! - [`Orchestrator::env_list`]: ledger entries of one or all scopes
//! - [`Orchestrator::env_outputs`]: outputs of one scope merged into one map
//! - [`Orchestrator::deploy_stable`] / [`Orchestrator::destroy_stable`]: the
//!   lifecycle of the shared stable environments
//!
//! Every operation returns a [`DeploymentReport`] listing the outcome of each
//! node, including on partial failure. Configuration, resolution and ledger
//! errors abort before anything is applied and are returned as errors.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use super::execution::{self, ExecutionContext, ExecutionOptions, NodeOutcome};
use super::resolution::Overrides;
use super::{discovery, ordering, resolution, DeploymentPlan, Resolution, ResolvedEnvironment};
use crate::cancel::CancellationToken;
use crate::config::{BackendSettings, EnvironmentKind, MergeRequestId};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::ledger::{LedgerEntry, LedgerKey, LedgerStatus, LedgerStore, Scope};
use crate::lock::StateLocks;
use crate::registry::{Catalog, Workspace};

/// How the service to deploy is identified
#[derive(Debug, Clone, Copy)]
pub enum ServiceTarget<'a> {
    Named(&'a str),
    /// The service owning this directory
    WorkingDirectory(&'a Path),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Deploy,
    Destroy,
}

/// Manifest of one request
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentReport {
    pub operation: Operation,
    pub scope: Scope,
    /// Requested service, if the request named one
    pub root: Option<String>,
    pub dry_run: bool,
    pub plan: DeploymentPlan,
    pub environments: BTreeMap<String, ResolvedEnvironment>,
    pub outcomes: BTreeMap<String, NodeOutcome>,
}

impl DeploymentReport {
    fn new(operation: Operation, scope: Scope, root: Option<String>, dry_run: bool) -> Self {
        Self {
            operation,
            scope,
            root,
            dry_run,
            plan: DeploymentPlan::default(),
            environments: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    /// No node failed or was skipped
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(NodeOutcome::is_success)
    }

    /// Nodes whose outcome carries `label` (`applied`, `failed`, ...)
    pub fn nodes_with(&self, label: &str) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.label() == label)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

/// Entry point for every envie operation
pub struct Orchestrator {
    workspace: Workspace,
    ledger: Arc<dyn LedgerStore>,
    executor: Arc<dyn Executor>,
    locks: StateLocks,
    cancel: CancellationToken,
    backend: BackendSettings,
    state_dir: PathBuf,
    options: ExecutionOptions,
    overrides: Overrides,
}

impl Orchestrator {
    pub fn new(
        workspace: Workspace,
        ledger: Arc<dyn LedgerStore>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let state_dir = workspace.state_dir();
        Self {
            backend: workspace.backend(),
            locks: StateLocks::new(&state_dir),
            options: ExecutionOptions {
                concurrency: workspace.concurrency(),
                keep_going: false,
            },
            cancel: CancellationToken::new(),
            overrides: Overrides::new(),
            state_dir,
            workspace,
            ledger,
            executor,
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Mixing overrides applied to every merge request deploy
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn ledger(&self) -> &dyn LedgerStore {
        self.ledger.as_ref()
    }

    fn context(&self) -> ExecutionContext<'_> {
        ExecutionContext {
            executor: self.executor.as_ref(),
            ledger: self.ledger.as_ref(),
            locks: &self.locks,
            cancel: &self.cancel,
            backend: &self.backend,
            state_dir: &self.state_dir,
            options: self.options,
        }
    }

    /// Deploy `target` and its dependencies for `merge_request`.
    ///
    /// With `dry_run` nothing is applied and neither files nor ledger entries
    /// are written; unresolved stable bindings are reported instead of
    /// failing the request.
    pub fn deploy(
        &self,
        catalog: &Catalog,
        target: ServiceTarget<'_>,
        merge_request: &MergeRequestId,
        dry_run: bool,
    ) -> Result<DeploymentReport> {
        let root = resolve_root(catalog, target)?;
        let graph = discovery::build(catalog, &root)?;
        let scope = Scope::MergeRequest(merge_request.clone());
        info!(
            "Deploying '{}' for merge request {}{}",
            root,
            merge_request,
            if dry_run { " (dry run)" } else { "" }
        );

        let mut resolution = if dry_run {
            resolution::resolve_partial(
                &graph,
                catalog,
                merge_request,
                self.ledger(),
                &self.overrides,
            )?
        } else {
            resolution::resolve(
                &graph,
                catalog,
                merge_request,
                self.ledger(),
                &self.overrides,
            )?
        };
        let plan = ordering::plan(&graph, &resolution);

        let mut report =
            DeploymentReport::new(Operation::Deploy, scope.clone(), Some(root), dry_run);
        for binding in resolution.bindings() {
            report
                .outcomes
                .insert(binding.service_name.clone(), NodeOutcome::Bound);
        }
        for (service, reason) in &resolution.unresolved {
            report
                .outcomes
                .insert(service.clone(), NodeOutcome::Failed(reason.clone()));
        }

        if dry_run {
            mark_planned(&mut report.outcomes, &plan, |node| {
                graph.dependencies(node).to_vec()
            });
        } else {
            self.record_bindings(&scope, &resolution)?;
            let applied = execution::apply(
                &self.context(),
                &scope,
                &graph,
                catalog,
                &plan,
                &mut resolution,
            )?;
            report.outcomes.extend(applied);
        }

        report.plan = plan;
        report.environments = resolution.environments;
        Ok(report)
    }

    /// Apply `service` and its dependencies into the stable scope
    pub fn deploy_stable(
        &self,
        catalog: &Catalog,
        service: &str,
        dry_run: bool,
    ) -> Result<DeploymentReport> {
        let graph = discovery::build(catalog, service)?;
        let mut resolution = resolution::resolve_stable(&graph, catalog);
        let plan = ordering::plan(&graph, &resolution);
        info!("Deploying stable environment '{}'", service);

        let mut report = DeploymentReport::new(
            Operation::Deploy,
            Scope::Stable,
            Some(service.to_string()),
            dry_run,
        );
        if dry_run {
            mark_planned(&mut report.outcomes, &plan, |node| {
                graph.dependencies(node).to_vec()
            });
        } else {
            report.outcomes = execution::apply(
                &self.context(),
                &Scope::Stable,
                &graph,
                catalog,
                &plan,
                &mut resolution,
            )?;
        }

        report.plan = plan;
        report.environments = resolution.environments;
        Ok(report)
    }

    /// Tear down everything `merge_request` owns, in reverse dependency order.
    ///
    /// Stable environments the merge request referenced are never touched.
    pub fn destroy(
        &self,
        merge_request: &MergeRequestId,
        dry_run: bool,
    ) -> Result<DeploymentReport> {
        let scope = Scope::MergeRequest(merge_request.clone());
        let entries = self.ledger.list(Some(&scope))?;
        let (bindings, owned): (Vec<LedgerEntry>, Vec<LedgerEntry>) = entries
            .into_iter()
            .partition(|entry| entry.kind == EnvironmentKind::Stable);
        info!(
            "Destroying merge request {}: {} environment(s), {} stable reference(s)",
            merge_request,
            owned.len(),
            bindings.len()
        );

        self.teardown(scope, owned, bindings, dry_run)
    }

    /// Tear down one stable environment.
    ///
    /// Refused while another stable environment still depends on it.
    pub fn destroy_stable(&self, service: &str, dry_run: bool) -> Result<DeploymentReport> {
        let stable = self.ledger.list(Some(&Scope::Stable))?;
        let entry = stable
            .iter()
            .find(|entry| entry.service_name == service)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                name: service.to_string(),
                available: stable.iter().map(|e| e.service_name.clone()).collect(),
            })?;

        if let Some(dependent) = stable
            .iter()
            .find(|other| other.dependencies.iter().any(|d| d == service))
        {
            return Err(Error::Execution {
                service: service.to_string(),
                operation: "destroy".to_string(),
                message: format!(
                    "stable environment '{}' still depends on it",
                    dependent.service_name
                ),
            });
        }

        let referenced_by: Vec<String> = self
            .ledger
            .list(None)?
            .into_iter()
            .filter(|e| e.scope != Scope::Stable && e.service_name == service)
            .map(|e| e.scope.to_string())
            .collect();
        if !referenced_by.is_empty() {
            warn!(
                "Stable environment '{}' is still referenced by {}",
                service,
                referenced_by.join(", ")
            );
        }

        self.teardown(Scope::Stable, vec![entry], Vec::new(), dry_run)
    }

    /// Ledger entries of one merge request, or of every scope
    pub fn env_list(&self, merge_request: Option<&MergeRequestId>) -> Result<Vec<LedgerEntry>> {
        let scope = merge_request.map(|id| Scope::MergeRequest(id.clone()));
        self.ledger.list(scope.as_ref())
    }

    /// Outputs of every applied environment in one scope, merged into one map.
    ///
    /// Entries are merged in service name order. When two services export the
    /// same output name the later one wins and the clash is logged.
    pub fn env_outputs(&self, scope: &Scope) -> Result<BTreeMap<String, Value>> {
        let mut merged: BTreeMap<String, Value> = BTreeMap::new();
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        for entry in self.ledger.list(Some(scope))? {
            if entry.status != LedgerStatus::Applied {
                debug!("Skipping outputs of '{}' ({})", entry.service_name, entry.status);
                continue;
            }
            for (name, value) in entry.outputs {
                if let Some(previous) = owners.insert(name.clone(), entry.service_name.clone()) {
                    warn!(
                        "Output '{}' of '{}' replaces the one of '{}'",
                        name, entry.service_name, previous
                    );
                }
                merged.insert(name, value);
            }
        }
        Ok(merged)
    }

    fn teardown(
        &self,
        scope: Scope,
        owned: Vec<LedgerEntry>,
        bindings: Vec<LedgerEntry>,
        dry_run: bool,
    ) -> Result<DeploymentReport> {
        let plan = ordering::reverse_plan(&ordering::plan_from_entries(&owned));
        let mut report = DeploymentReport::new(Operation::Destroy, scope, None, dry_run);
        for entry in owned.iter().chain(&bindings) {
            report
                .environments
                .insert(entry.service_name.clone(), environment_of(entry));
        }
        for binding in &bindings {
            report
                .outcomes
                .insert(binding.service_name.clone(), NodeOutcome::Bound);
        }

        let by_name: BTreeMap<String, LedgerEntry> = owned
            .into_iter()
            .map(|entry| (entry.service_name.clone(), entry))
            .collect();

        if dry_run {
            mark_planned(&mut report.outcomes, &plan, |node| {
                by_name
                    .values()
                    .filter(|e| e.dependencies.iter().any(|d| d == node))
                    .map(|e| e.service_name.clone())
                    .collect()
            });
        } else {
            let destroyed = execution::destroy(&self.context(), &plan, &by_name)?;
            let complete = destroyed
                .values()
                .all(|outcome| *outcome == NodeOutcome::Destroyed);
            report.outcomes.extend(destroyed);

            if complete {
                for binding in &bindings {
                    debug!("Dropping reference to stable '{}'", binding.service_name);
                    self.ledger.remove(&binding.key())?;
                }
            }
        }

        report.plan = plan;
        Ok(report)
    }

    /// Record the stable environments a merge request references, so `env
    /// list` shows them. An ephemeral instance recorded under the same name is
    /// never overwritten.
    fn record_bindings(&self, scope: &Scope, resolution: &Resolution) -> Result<()> {
        for binding in resolution.bindings() {
            let key = LedgerKey::new(scope.clone(), binding.service_name.clone());
            if let Some(existing) = self.ledger.get(&key)? {
                if existing.kind == EnvironmentKind::Ephemeral {
                    warn!(
                        "'{}' has an ephemeral instance in {}; it is now bound to stable and must be destroyed separately",
                        binding.service_name, scope
                    );
                    continue;
                }
            }

            let mut entry = LedgerEntry::pending(
                scope.clone(),
                binding.service_name.clone(),
                EnvironmentKind::Stable,
                binding.state_key.clone(),
                Vec::new(),
            )
            .with_status(LedgerStatus::Applied);
            entry.outputs = binding.outputs.clone();
            self.ledger.record(entry)?;
        }
        Ok(())
    }
}

/// Name of the service a request targets
pub fn resolve_root(catalog: &Catalog, target: ServiceTarget<'_>) -> Result<String> {
    match target {
        ServiceTarget::Named(name) => Ok(catalog.lookup(name)?.name.clone()),
        ServiceTarget::WorkingDirectory(cwd) => {
            Ok(catalog.discover_owning_service(cwd)?.name.clone())
        }
    }
}

/// Dry run: every plan node is `planned` unless something it waits on is
/// failed or skipped.
fn mark_planned(
    outcomes: &mut BTreeMap<String, NodeOutcome>,
    plan: &DeploymentPlan,
    waits_on: impl Fn(&str) -> Vec<String>,
) {
    for node in plan.nodes() {
        let blocked = waits_on(node).into_iter().find_map(|other| {
            outcomes
                .get(&other)
                .filter(|outcome| !outcome.is_success())
                .map(|_| format!("'{}' cannot be deployed", other))
        });
        let outcome = match blocked {
            Some(reason) => NodeOutcome::Skipped(reason),
            None => NodeOutcome::Planned,
        };
        outcomes.insert(node.to_string(), outcome);
    }
}

fn environment_of(entry: &LedgerEntry) -> ResolvedEnvironment {
    ResolvedEnvironment {
        service_name: entry.service_name.clone(),
        kind: entry.kind,
        merge_request_id: match &entry.scope {
            Scope::MergeRequest(id) if entry.kind == EnvironmentKind::Ephemeral => {
                Some(id.clone())
            }
            _ => None,
        },
        state_key: entry.state_key.clone(),
        outputs: entry.outputs.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::phases::execution::tests::{workspace_with, MockExecutor};
    use tempfile::TempDir;

    const SCENARIO: &[(&str, &str)] = &[
        ("services/networking", "name: networking\n"),
        (
            "services/database",
            "name: database\ndepends: [networking]\n",
        ),
        (
            "services/api",
            "name: api\ndepends:\n  - name: database\n    environment: stable\n  - networking\n",
        ),
    ];

    struct Fixture {
        _temp: TempDir,
        catalog: Catalog,
        ledger: MemoryLedger,
        executor: Arc<MockExecutor>,
        orchestrator: Orchestrator,
    }

    fn fixture(executor: MockExecutor) -> Fixture {
        let (temp, catalog) = workspace_with(SCENARIO);
        let ledger = MemoryLedger::new();
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::new(
            catalog.workspace.clone(),
            Arc::new(ledger.clone()),
            executor.clone(),
        )
        .with_options(ExecutionOptions {
            concurrency: 1,
            keep_going: false,
        });
        Fixture {
            _temp: temp,
            catalog,
            ledger,
            executor,
            orchestrator,
        }
    }

    fn mr(id: &str) -> MergeRequestId {
        MergeRequestId::new(id).unwrap()
    }

    fn seed_stable_database(ledger: &MemoryLedger) {
        let mut entry = LedgerEntry::pending(
            Scope::Stable,
            "database",
            EnvironmentKind::Stable,
            "stable/app/database/terraform.tfstate",
            vec![],
        )
        .with_status(LedgerStatus::Applied);
        entry
            .outputs
            .insert("table_name".to_string(), serde_json::json!("users"));
        ledger.record(entry).unwrap();
    }

    fn scope_names(ledger: &MemoryLedger, scope: &Scope) -> Vec<String> {
        ledger
            .list(Some(scope))
            .unwrap()
            .into_iter()
            .map(|e| e.service_name)
            .collect()
    }

    #[test]
    fn test_mixed_environment_scenario() {
        let f = fixture(MockExecutor::new());
        seed_stable_database(&f.ledger);

        let report = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("123"), false)
            .unwrap();

        assert_eq!(report.plan.to_string(), "[networking] -> [api]");
        assert_eq!(f.executor.calls(), vec!["apply:networking", "apply:api"]);
        assert_eq!(report.outcomes["database"], NodeOutcome::Bound);
        assert_eq!(report.nodes_with("applied"), vec!["api", "networking"]);
        assert!(report.is_success());

        let database = &report.environments["database"];
        assert_eq!(database.state_key, "stable/app/database/terraform.tfstate");
        assert_eq!(
            report.environments["networking"].state_key,
            "ephemeral/app-123/networking/terraform.tfstate"
        );
        assert_eq!(f.executor.inputs_of("api")["database_table_name"], "users");

        let scope = Scope::MergeRequest(mr("123"));
        assert_eq!(
            scope_names(&f.ledger, &scope),
            vec!["api", "database", "networking"]
        );
        let binding = f
            .ledger
            .get(&LedgerKey::new(scope, "database"))
            .unwrap()
            .unwrap();
        assert_eq!(binding.kind, EnvironmentKind::Stable);
    }

    #[test]
    fn test_unresolved_stable_binding_applies_nothing() {
        let f = fixture(MockExecutor::new());

        let err = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("123"), false)
            .unwrap_err();

        assert!(matches!(err, Error::UnresolvedStableBinding { .. }));
        assert!(f.executor.calls().is_empty());
        assert!(f.ledger.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let f = fixture(MockExecutor::new());
        seed_stable_database(&f.ledger);
        let before = f.ledger.list(None).unwrap();

        let report = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("123"), true)
            .unwrap();

        assert!(f.executor.calls().is_empty());
        assert_eq!(f.ledger.list(None).unwrap(), before);
        assert_eq!(report.plan.to_string(), "[networking] -> [api]");
        assert_eq!(report.nodes_with("planned"), vec!["api", "networking"]);
        let api_dir = f.catalog.lookup("api").unwrap().directory.clone();
        assert!(!api_dir.join(".envie-remote-state.tf").exists());
    }

    #[test]
    fn test_dry_run_reports_unresolved_binding() {
        let f = fixture(MockExecutor::new());

        let report = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("123"), true)
            .unwrap();

        assert!(matches!(report.outcomes["database"], NodeOutcome::Failed(_)));
        assert_eq!(report.outcomes["networking"], NodeOutcome::Planned);
        assert_eq!(
            report.outcomes["api"],
            NodeOutcome::Skipped("'database' cannot be deployed".to_string())
        );
        assert!(!report.is_success());
    }

    #[test]
    fn test_failed_dependency_skips_api() {
        let f = fixture(MockExecutor::new().failing(&["networking"]));
        seed_stable_database(&f.ledger);

        let report = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("123"), false)
            .unwrap();

        assert_eq!(f.executor.calls(), vec!["apply:networking"]);
        assert_eq!(report.nodes_with("failed"), vec!["networking"]);
        assert_eq!(report.nodes_with("skipped"), vec!["api"]);
        assert!(!report.is_success());
    }

    #[test]
    fn test_destroy_reverses_and_keeps_stable() {
        let f = fixture(MockExecutor::new());
        seed_stable_database(&f.ledger);
        f.orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("123"), false)
            .unwrap();

        let report = f.orchestrator.destroy(&mr("123"), false).unwrap();

        assert_eq!(report.plan.to_string(), "[api] -> [networking]");
        assert_eq!(
            f.executor.calls(),
            vec![
                "apply:networking",
                "apply:api",
                "destroy:api",
                "destroy:networking"
            ]
        );
        assert_eq!(report.outcomes["database"], NodeOutcome::Bound);
        assert!(report.is_success());
        assert!(scope_names(&f.ledger, &Scope::MergeRequest(mr("123"))).is_empty());

        let stable = f
            .ledger
            .get(&LedgerKey::new(Scope::Stable, "database"))
            .unwrap()
            .unwrap();
        assert_eq!(stable.status, LedgerStatus::Applied);
    }

    #[test]
    fn test_destroy_dry_run_and_empty_merge_request() {
        let f = fixture(MockExecutor::new());
        seed_stable_database(&f.ledger);
        f.orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("5"), false)
            .unwrap();

        let report = f.orchestrator.destroy(&mr("5"), true).unwrap();
        assert_eq!(report.nodes_with("planned"), vec!["api", "networking"]);
        assert_eq!(f.ledger.list(Some(&Scope::MergeRequest(mr("5")))).unwrap().len(), 3);

        let empty = f.orchestrator.destroy(&mr("999"), false).unwrap();
        assert!(empty.is_empty());
        assert!(empty.plan.is_empty());
    }

    #[test]
    fn test_destroy_failure_is_reported() {
        let g = fixture(MockExecutor::new().failing(&["networking"]));
        seed_stable_database(&g.ledger);
        g.ledger
            .record(
                LedgerEntry::pending(
                    Scope::MergeRequest(mr("9")),
                    "networking",
                    EnvironmentKind::Ephemeral,
                    "ephemeral/app-9/networking/terraform.tfstate",
                    vec![],
                )
                .in_directory(g.catalog.lookup("networking").unwrap().directory.clone())
                .with_status(LedgerStatus::Applied),
            )
            .unwrap();

        let report = g.orchestrator.destroy(&mr("9"), false).unwrap();
        assert!(matches!(report.outcomes["networking"], NodeOutcome::Failed(_)));
        let entry = g
            .ledger
            .get(&LedgerKey::new(Scope::MergeRequest(mr("9")), "networking"))
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, LedgerStatus::Failed);
    }

    #[test]
    fn test_stable_lifecycle() {
        let f = fixture(MockExecutor::new());

        let report = f
            .orchestrator
            .deploy_stable(&f.catalog, "database", false)
            .unwrap();
        assert_eq!(report.plan.to_string(), "[networking] -> [database]");
        assert_eq!(
            scope_names(&f.ledger, &Scope::Stable),
            vec!["database", "networking"]
        );

        // The merge request can now bind to the stable database
        let report = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("1"), false)
            .unwrap();
        assert!(report.is_success());
        assert_eq!(
            report.environments["database"].state_key,
            "stable/app/database/terraform.tfstate"
        );

        let err = f
            .orchestrator
            .destroy_stable("networking", false)
            .unwrap_err();
        assert!(err.to_string().contains("'database' still depends on it"));

        let report = f.orchestrator.destroy_stable("database", false).unwrap();
        assert_eq!(report.outcomes["database"], NodeOutcome::Destroyed);
        assert_eq!(scope_names(&f.ledger, &Scope::Stable), vec!["networking"]);

        assert!(matches!(
            f.orchestrator.destroy_stable("database", false).unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_deploy_from_working_directory() {
        let f = fixture(MockExecutor::new());
        let dir = f.catalog.lookup("networking").unwrap().directory.clone();

        let report = f
            .orchestrator
            .deploy(&f.catalog, ServiceTarget::WorkingDirectory(&dir), &mr("3"), true)
            .unwrap();
        assert_eq!(report.root.as_deref(), Some("networking"));
        assert_eq!(report.plan.to_string(), "[networking]");
    }

    #[test]
    fn test_env_list_filters_by_merge_request() {
        let f = fixture(MockExecutor::new());
        seed_stable_database(&f.ledger);
        f.orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("networking"), &mr("1"), false)
            .unwrap();
        f.orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("networking"), &mr("2"), false)
            .unwrap();

        assert_eq!(f.orchestrator.env_list(Some(&mr("1"))).unwrap().len(), 1);
        assert_eq!(f.orchestrator.env_list(None).unwrap().len(), 3);
    }

    #[test]
    fn test_environment_override_deploys_database_ephemerally() {
        let f = fixture(MockExecutor::new());
        let orchestrator = Orchestrator::new(
            f.catalog.workspace.clone(),
            Arc::new(f.ledger.clone()),
            f.executor.clone(),
        )
        .with_options(ExecutionOptions {
            concurrency: 1,
            keep_going: false,
        })
        .with_overrides(Overrides::from([(
            "database".to_string(),
            EnvironmentKind::Ephemeral,
        )]));

        let report = orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("8"), false)
            .unwrap();

        assert_eq!(report.plan.to_string(), "[networking] -> [database] -> [api]");
        assert_eq!(report.nodes_with("applied"), vec!["api", "database", "networking"]);
        assert_eq!(
            report.environments["database"].state_key,
            "ephemeral/app-8/database/terraform.tfstate"
        );
        assert!(f
            .ledger
            .get(&LedgerKey::new(Scope::Stable, "database"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_env_outputs_merges_applied_entries() {
        let f = fixture(
            MockExecutor::new()
                .with_output("networking", "vpc_id", serde_json::json!("vpc-1"))
                .with_output("api", "url", serde_json::json!("https://api-4"))
                .with_output("api", "vpc_id", serde_json::json!("shadowed")),
        );
        seed_stable_database(&f.ledger);
        f.orchestrator
            .deploy(&f.catalog, ServiceTarget::Named("api"), &mr("4"), false)
            .unwrap();
        let scope = Scope::MergeRequest(mr("4"));
        f.ledger
            .update(&LedgerKey::new(scope.clone(), "database"), LedgerStatus::Failed)
            .unwrap();

        let outputs = f.orchestrator.env_outputs(&scope).unwrap();
        assert_eq!(outputs["url"], "https://api-4");
        assert_eq!(outputs["vpc_id"], "vpc-1");
        assert!(!outputs.contains_key("table_name"));

        let empty = f.orchestrator.env_outputs(&Scope::MergeRequest(mr("5"))).unwrap();
        assert!(empty.is_empty());
    }
}
