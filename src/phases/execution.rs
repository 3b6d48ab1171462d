//! Phase 4: Execution
//!
//! Runs a [`DeploymentPlan`] batch by batch. Nodes of one batch run in
//! parallel on a bounded rayon pool; the next batch starts only once the
//! previous one has finished.
//!
//! For every node applied:
//!
//! 1. a `pending` ledger entry is recorded (a ledger failure aborts the run)
//! 2. input variables are composed from the dependencies' outputs
//! 3. the state key lock is taken
//! 4. the backend block, the state key's work directory and its inputs file
//!    are written, and the executor runs while the lock is held
//! 5. the entry is recorded `applied` with outputs, or `failed`
//!
//! By default the first failure halts the run: un-started nodes of the batch
//! and all later batches are skipped. With `keep_going` only dependents of a
//! failed node are skipped. Teardown mirrors this with dependents and
//! dependencies swapped.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;

use super::{DependencyGraph, DeploymentPlan, Resolution, ResolvedEnvironment};
use crate::backend;
use crate::cancel::CancellationToken;
use crate::config::BackendSettings;
use crate::defaults;
use crate::error::{Error, Result};
use crate::executor::{ApplyOutcome, ApplyRequest, DestroyRequest, Executor};
use crate::ledger::{LedgerEntry, LedgerStatus, LedgerStore, Scope};
use crate::lock::StateLocks;
use crate::registry::Catalog;

/// What happened to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum NodeOutcome {
    Applied,
    Destroyed,
    /// Dry run: would have been applied or destroyed
    Planned,
    /// Stable environment referenced by the request, left untouched
    Bound,
    Failed(String),
    Skipped(String),
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, NodeOutcome::Failed(_) | NodeOutcome::Skipped(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeOutcome::Applied => "applied",
            NodeOutcome::Destroyed => "destroyed",
            NodeOutcome::Planned => "planned",
            NodeOutcome::Bound => "bound",
            NodeOutcome::Failed(_) => "failed",
            NodeOutcome::Skipped(_) => "skipped",
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            NodeOutcome::Failed(detail) | NodeOutcome::Skipped(detail) => Some(detail),
            _ => None,
        }
    }
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}

/// Knobs of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Nodes of one batch running at the same time
    pub concurrency: usize,
    /// Keep running branches unaffected by a failure
    pub keep_going: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            concurrency: defaults::DEFAULT_CONCURRENCY,
            keep_going: false,
        }
    }
}

/// Collaborators shared by every worker of a run
pub struct ExecutionContext<'a> {
    pub executor: &'a dyn Executor,
    pub ledger: &'a dyn LedgerStore,
    pub locks: &'a StateLocks,
    pub cancel: &'a CancellationToken,
    pub backend: &'a BackendSettings,
    pub state_dir: &'a Path,
    pub options: ExecutionOptions,
}

impl ExecutionContext<'_> {
    fn pool(&self) -> Result<ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.concurrency.max(1))
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))
    }

    /// Reason a node must not start, if the run is cancelled or halted
    fn halt_reason(&self, halted: &AtomicBool) -> Option<String> {
        if self.cancel.is_cancelled() {
            Some("cancelled before start".to_string())
        } else if halted.load(Ordering::SeqCst) {
            Some("not started after an earlier failure".to_string())
        } else {
            None
        }
    }

    fn record_failure(&self, halted: &AtomicBool) {
        if !self.options.keep_going {
            halted.store(true, Ordering::SeqCst);
        }
    }
}

/// Apply every node of `plan` into `scope`.
///
/// Outputs of applied nodes are written back into `resolution` so later
/// batches can consume them. Returns the outcome of every planned node; only
/// ledger and setup failures are returned as errors.
pub fn apply(
    ctx: &ExecutionContext<'_>,
    scope: &Scope,
    graph: &DependencyGraph,
    catalog: &Catalog,
    plan: &DeploymentPlan,
    resolution: &mut Resolution,
) -> Result<BTreeMap<String, NodeOutcome>> {
    let pool = ctx.pool()?;
    let halted = AtomicBool::new(false);
    let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();

    for (index, batch) in plan.batches.iter().enumerate() {
        let mut runnable = Vec::new();
        for node in batch {
            let blocked = ctx.halt_reason(&halted).or_else(|| {
                blocked_by(
                    graph.dependencies(node).iter().map(String::as_str),
                    &outcomes,
                    "dependency",
                )
            });
            match blocked {
                Some(reason) => {
                    info!("Skipping '{}': {}", node, reason);
                    outcomes.insert(node.clone(), NodeOutcome::Skipped(reason));
                }
                None => runnable.push(node.clone()),
            }
        }

        info!("Batch {}: applying [{}]", index + 1, runnable.join(", "));
        let job = ApplyJob {
            ctx,
            scope,
            graph,
            catalog,
            resolution: &*resolution,
            halted: &halted,
        };
        let results = run_batch(&pool, &runnable, |node| job.run(node));

        for (node, result) in results {
            let (outcome, applied) = result?;
            if let (Some(applied), Some(environment)) =
                (applied, resolution.environments.get_mut(&node))
            {
                environment.outputs = applied.outputs;
            }
            outcomes.insert(node, outcome);
        }
    }

    Ok(outcomes)
}

/// Destroy every node of `plan`, which must already be in teardown order.
///
/// `entries` are the ledger entries of the nodes, keyed by service name.
/// Destroyed entries are removed from the ledger; failures are recorded
/// `failed` and leave the entry in place.
pub fn destroy(
    ctx: &ExecutionContext<'_>,
    plan: &DeploymentPlan,
    entries: &BTreeMap<String, LedgerEntry>,
) -> Result<BTreeMap<String, NodeOutcome>> {
    let pool = ctx.pool()?;
    let halted = AtomicBool::new(false);
    let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();

    for (index, batch) in plan.batches.iter().enumerate() {
        let mut runnable = Vec::new();
        for node in batch {
            let dependents = entries
                .values()
                .filter(|entry| entry.dependencies.iter().any(|d| d == node))
                .map(|entry| entry.service_name.as_str());
            let blocked = ctx
                .halt_reason(&halted)
                .or_else(|| blocked_by(dependents, &outcomes, "dependent"));
            match blocked {
                Some(reason) => {
                    info!("Skipping teardown of '{}': {}", node, reason);
                    outcomes.insert(node.clone(), NodeOutcome::Skipped(reason));
                }
                None => runnable.push(node.clone()),
            }
        }

        info!("Batch {}: destroying [{}]", index + 1, runnable.join(", "));
        let results = run_batch(&pool, &runnable, |node| {
            destroy_node(ctx, entries.get(node), node, &halted)
        });
        for (node, result) in results {
            outcomes.insert(node, result?);
        }
    }

    Ok(outcomes)
}

/// Run `work` for every node of one batch on `pool`, preserving batch order
/// in the result.
fn run_batch<T, F>(pool: &ThreadPool, nodes: &[String], work: F) -> Vec<(String, T)>
where
    T: Send,
    F: Fn(&str) -> T + Sync,
{
    pool.install(|| {
        nodes
            .par_iter()
            .map(|node| (node.clone(), work(node)))
            .collect()
    })
}

/// First `related` node whose outcome prevents this one from running
fn blocked_by<'a>(
    related: impl IntoIterator<Item = &'a str>,
    outcomes: &BTreeMap<String, NodeOutcome>,
    relation: &str,
) -> Option<String> {
    related
        .into_iter()
        .find_map(|other| match outcomes.get(other) {
            Some(NodeOutcome::Failed(_)) => Some(format!("{} '{}' failed", relation, other)),
            Some(NodeOutcome::Skipped(_)) => {
                Some(format!("{} '{}' was skipped", relation, other))
            }
            _ => None,
        })
}

struct ApplyJob<'a> {
    ctx: &'a ExecutionContext<'a>,
    scope: &'a Scope,
    graph: &'a DependencyGraph,
    catalog: &'a Catalog,
    resolution: &'a Resolution,
    halted: &'a AtomicBool,
}

impl ApplyJob<'_> {
    fn run(&self, node: &str) -> Result<(NodeOutcome, Option<ApplyOutcome>)> {
        let ctx = self.ctx;
        if let Some(reason) = ctx.halt_reason(self.halted) {
            return Ok((NodeOutcome::Skipped(reason), None));
        }

        let environment = match self.resolution.get(node) {
            Some(environment) => environment,
            None => {
                return Ok((
                    NodeOutcome::Failed(format!("'{}' has no resolved environment", node)),
                    None,
                ))
            }
        };
        let service = self.catalog.lookup(node)?;
        let dependencies: Vec<&ResolvedEnvironment> = self
            .graph
            .dependencies(node)
            .iter()
            .filter_map(|dep| self.resolution.get(dep))
            .collect();

        let mut entry = LedgerEntry::pending(
            self.scope.clone(),
            node,
            environment.kind,
            &environment.state_key,
            dependencies.iter().map(|d| d.service_name.clone()).collect(),
        )
        .in_directory(&service.directory);
        ctx.ledger.record(entry.clone())?;

        let request = ApplyRequest {
            service: node.to_string(),
            directory: service.directory.clone(),
            state_key: environment.state_key.clone(),
            work_dir: backend::work_dir(ctx.state_dir, &environment.state_key),
            kind: environment.kind,
            inputs: backend::compose_inputs(environment, dependencies.iter().copied()),
        };

        match self.execute(&request) {
            Ok(outcome) => {
                info!(
                    "Applied '{}' ({} resource(s), {} output(s))",
                    node,
                    outcome.resource_ids.len(),
                    outcome.outputs.len()
                );
                entry.outputs = outcome.outputs.clone();
                entry.resource_ids = outcome.resource_ids.clone();
                ctx.ledger.record(entry.with_status(LedgerStatus::Applied))?;
                Ok((NodeOutcome::Applied, Some(outcome)))
            }
            Err(e) => {
                error!("Applying '{}' failed: {}", node, e);
                ctx.record_failure(self.halted);
                entry.message = Some(e.to_string());
                ctx.ledger.record(entry.with_status(LedgerStatus::Failed))?;
                Ok((NodeOutcome::Failed(e.to_string()), None))
            }
        }
    }

    fn execute(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        let ctx = self.ctx;
        let _lock = ctx.locks.acquire(&request.state_key, ctx.cancel)?;
        backend::write_descriptor(&request.directory, ctx.backend)?;
        backend::prepare_work_dir(ctx.backend, &request.state_key, ctx.state_dir)?;
        backend::write_inputs(&request.work_dir, &request.inputs)?;
        ctx.executor.apply(request, ctx.cancel)
    }
}

fn destroy_node(
    ctx: &ExecutionContext<'_>,
    entry: Option<&LedgerEntry>,
    node: &str,
    halted: &AtomicBool,
) -> Result<NodeOutcome> {
    if let Some(reason) = ctx.halt_reason(halted) {
        return Ok(NodeOutcome::Skipped(reason));
    }
    let Some(entry) = entry else {
        return Ok(NodeOutcome::Failed(format!("no ledger entry for '{}'", node)));
    };

    let request = DestroyRequest {
        service: node.to_string(),
        directory: entry.directory.clone(),
        state_key: entry.state_key.clone(),
        work_dir: backend::work_dir(ctx.state_dir, &entry.state_key),
    };

    let result = ctx
        .locks
        .acquire(&request.state_key, ctx.cancel)
        .and_then(|_lock| {
            backend::write_descriptor(&request.directory, ctx.backend)?;
            backend::prepare_work_dir(ctx.backend, &request.state_key, ctx.state_dir)?;
            ctx.executor.destroy(&request, ctx.cancel)?;
            if let Err(e) = backend::remove_work_dir(&request.work_dir) {
                warn!("Could not remove {}: {}", request.work_dir.display(), e);
            }
            Ok(())
        });

    match result {
        Ok(()) => {
            info!("Destroyed '{}'", node);
            ctx.ledger.remove(&entry.key())?;
            Ok(NodeOutcome::Destroyed)
        }
        Err(e) => {
            error!("Destroying '{}' failed: {}", node, e);
            ctx.record_failure(halted);
            let mut failed = entry.clone().with_status(LedgerStatus::Failed);
            failed.message = Some(e.to_string());
            ctx.ledger.record(failed)?;
            Ok(NodeOutcome::Failed(e.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::MergeRequestId;
    use crate::ledger::{LedgerKey, MemoryLedger};
    use crate::phases::resolution::Overrides;
    use crate::phases::{discovery, ordering, resolution};
    use serde_json::Value;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Executor double that records calls and fails on request
    #[derive(Default)]
    pub(crate) struct MockExecutor {
        calls: Mutex<Vec<String>>,
        inputs: Mutex<BTreeMap<String, BTreeMap<String, Value>>>,
        failing: BTreeSet<String>,
        outputs: BTreeMap<String, BTreeMap<String, Value>>,
    }

    impl MockExecutor {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn failing(mut self, services: &[&str]) -> Self {
            self.failing.extend(services.iter().map(|s| s.to_string()));
            self
        }

        pub(crate) fn with_output(mut self, service: &str, name: &str, value: Value) -> Self {
            self.outputs
                .entry(service.to_string())
                .or_default()
                .insert(name.to_string(), value);
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn inputs_of(&self, service: &str) -> BTreeMap<String, Value> {
            self.inputs
                .lock()
                .unwrap()
                .get(service)
                .cloned()
                .unwrap_or_default()
        }

        fn fail_if_requested(&self, service: &str, operation: &str) -> Result<()> {
            if self.failing.contains(service) {
                return Err(Error::Execution {
                    service: service.to_string(),
                    operation: operation.to_string(),
                    message: "mock failure".to_string(),
                });
            }
            Ok(())
        }
    }

    impl Executor for MockExecutor {
        fn apply(
            &self,
            request: &ApplyRequest,
            _cancel: &CancellationToken,
        ) -> Result<ApplyOutcome> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("apply:{}", request.service));
            self.inputs
                .lock()
                .unwrap()
                .insert(request.service.clone(), request.inputs.clone());
            self.fail_if_requested(&request.service, "apply")?;
            Ok(ApplyOutcome {
                outputs: self.outputs.get(&request.service).cloned().unwrap_or_default(),
                resource_ids: vec![format!("mock_resource.{}", request.service)],
            })
        }

        fn destroy(&self, request: &DestroyRequest, _cancel: &CancellationToken) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("destroy:{}", request.service));
            self.fail_if_requested(&request.service, "destroy")
        }
    }

    /// Write `(directory, declaration)` pairs below a fresh workspace and load
    /// its catalog.
    pub(crate) fn workspace_with(services: &[(&str, &str)]) -> (TempDir, Catalog) {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("workspace.envie"), "project:\n  name: app\n").unwrap();
        for (dir, declaration) in services {
            let path = temp.path().join(dir);
            fs::create_dir_all(&path).unwrap();
            fs::write(path.join(".envie"), declaration).unwrap();
        }
        let catalog = Catalog::load(temp.path()).unwrap();
        (temp, catalog)
    }

    struct Harness {
        _temp: TempDir,
        catalog: Catalog,
        ledger: MemoryLedger,
        locks: StateLocks,
        cancel: CancellationToken,
        backend: BackendSettings,
        state_dir: PathBuf,
    }

    fn sequential(keep_going: bool) -> ExecutionOptions {
        ExecutionOptions {
            concurrency: 1,
            keep_going,
        }
    }

    impl Harness {
        fn new(services: &[(&str, &str)]) -> Self {
            let (temp, catalog) = workspace_with(services);
            Self {
                backend: catalog.workspace.backend(),
                state_dir: catalog.workspace.state_dir(),
                _temp: temp,
                catalog,
                ledger: MemoryLedger::new(),
                locks: StateLocks::in_process(),
                cancel: CancellationToken::new(),
            }
        }

        fn ctx<'a>(
            &'a self,
            executor: &'a dyn Executor,
            options: ExecutionOptions,
        ) -> ExecutionContext<'a> {
            ExecutionContext {
                executor,
                ledger: &self.ledger,
                locks: &self.locks,
                cancel: &self.cancel,
                backend: &self.backend,
                state_dir: &self.state_dir,
                options,
            }
        }

        fn run(
            &self,
            merge_request: &str,
            root: &str,
            executor: &dyn Executor,
            options: ExecutionOptions,
        ) -> Result<BTreeMap<String, NodeOutcome>> {
            let graph = discovery::build(&self.catalog, root).unwrap();
            let mr = MergeRequestId::new(merge_request).unwrap();
            let mut resolution =
                resolution::resolve(&graph, &self.catalog, &mr, &self.ledger, &Overrides::new())
                    .unwrap();
            let plan = ordering::plan(&graph, &resolution);
            apply(
                &self.ctx(executor, options),
                &Scope::MergeRequest(mr),
                &graph,
                &self.catalog,
                &plan,
                &mut resolution,
            )
        }

        fn deploy(
            &self,
            root: &str,
            executor: &MockExecutor,
            keep_going: bool,
        ) -> Result<BTreeMap<String, NodeOutcome>> {
            self.run("42", root, executor, sequential(keep_going))
        }

        fn entry(&self, service: &str) -> Option<LedgerEntry> {
            let scope = Scope::MergeRequest(MergeRequestId::new("42").unwrap());
            self.ledger.get(&LedgerKey::new(scope, service)).unwrap()
        }
    }

    const CHAIN: &[(&str, &str)] = &[
        ("networking", "name: networking\n"),
        ("api", "name: api\ndepends: [networking]\n"),
    ];

    #[test]
    fn test_apply_chain_passes_outputs_downstream() {
        let harness = Harness::new(CHAIN);
        let executor =
            MockExecutor::new().with_output("networking", "vpc_id", Value::from("vpc-1"));

        let outcomes = harness.deploy("api", &executor, false).unwrap();

        assert_eq!(executor.calls(), vec!["apply:networking", "apply:api"]);
        assert_eq!(outcomes["networking"], NodeOutcome::Applied);
        assert_eq!(outcomes["api"], NodeOutcome::Applied);

        let inputs = executor.inputs_of("api");
        assert_eq!(inputs["networking_vpc_id"], "vpc-1");
        assert_eq!(inputs["merge_request_id"], "42");

        let networking = harness.entry("networking").unwrap();
        assert_eq!(networking.status, LedgerStatus::Applied);
        assert_eq!(networking.outputs["vpc_id"], "vpc-1");
        assert_eq!(networking.resource_ids, vec!["mock_resource.networking"]);
        assert_eq!(harness.entry("api").unwrap().dependencies, vec!["networking"]);

        let api_dir = harness.catalog.lookup("api").unwrap().directory.clone();
        let descriptor = fs::read_to_string(api_dir.join(".envie-remote-state.tf")).unwrap();
        assert!(descriptor.contains("backend \"local\" {}"));
        assert!(!descriptor.contains("tfstate"));

        let work = backend::work_dir(
            &harness.state_dir,
            "ephemeral/app-42/api/terraform.tfstate",
        );
        let backend_config = fs::read_to_string(work.join("backend.hcl")).unwrap();
        assert!(backend_config.contains("ephemeral/app-42/api/terraform.tfstate"));
        assert!(work.join("inputs.tfvars.json").is_file());
    }

    #[test]
    fn test_failed_dependency_skips_dependents() {
        let harness = Harness::new(CHAIN);
        let executor = MockExecutor::new().failing(&["networking"]);

        let outcomes = harness.deploy("api", &executor, false).unwrap();

        assert_eq!(executor.calls(), vec!["apply:networking"]);
        assert!(matches!(outcomes["networking"], NodeOutcome::Failed(_)));
        assert!(matches!(outcomes["api"], NodeOutcome::Skipped(_)));
        assert!(harness.entry("api").is_none());

        let failed = harness.entry("networking").unwrap();
        assert_eq!(failed.status, LedgerStatus::Failed);
        assert!(failed.message.unwrap().contains("mock failure"));
    }

    const BRANCHES: &[(&str, &str)] = &[
        ("a", "name: a\n"),
        ("b", "name: b\n"),
        ("c", "name: c\ndepends: [b]\n"),
        ("root", "name: root\ndepends: [a, c]\n"),
    ];

    #[test]
    fn test_fail_fast_halts_batch_and_later_batches() {
        let harness = Harness::new(BRANCHES);
        let executor = MockExecutor::new().failing(&["a"]);

        let outcomes = harness.deploy("root", &executor, false).unwrap();

        assert_eq!(executor.calls(), vec!["apply:a"]);
        assert_eq!(
            outcomes["b"],
            NodeOutcome::Skipped("not started after an earlier failure".to_string())
        );
        assert!(matches!(outcomes["c"], NodeOutcome::Skipped(_)));
        assert!(matches!(outcomes["root"], NodeOutcome::Skipped(_)));
    }

    #[test]
    fn test_keep_going_runs_unaffected_branches() {
        let harness = Harness::new(BRANCHES);
        let executor = MockExecutor::new().failing(&["a"]);

        let outcomes = harness.deploy("root", &executor, true).unwrap();

        assert_eq!(executor.calls(), vec!["apply:a", "apply:b", "apply:c"]);
        assert_eq!(outcomes["c"], NodeOutcome::Applied);
        assert_eq!(
            outcomes["root"],
            NodeOutcome::Skipped("dependency 'a' failed".to_string())
        );
    }

    #[test]
    fn test_cancelled_run_starts_nothing() {
        let harness = Harness::new(CHAIN);
        harness.cancel.cancel();
        let executor = MockExecutor::new();

        let outcomes = harness.deploy("api", &executor, false).unwrap();

        assert!(executor.calls().is_empty());
        assert!(outcomes.values().all(|o| matches!(o, NodeOutcome::Skipped(_))));
        assert!(harness.ledger.list(None).unwrap().is_empty());
    }

    struct BrokenLedger;

    impl LedgerStore for BrokenLedger {
        fn record(&self, _entry: LedgerEntry) -> Result<()> {
            Err(Error::ledger("broken", "disk full"))
        }
        fn update(&self, _key: &LedgerKey, _status: LedgerStatus) -> Result<()> {
            Err(Error::ledger("broken", "disk full"))
        }
        fn get(&self, _key: &LedgerKey) -> Result<Option<LedgerEntry>> {
            Ok(None)
        }
        fn list(&self, _scope: Option<&Scope>) -> Result<Vec<LedgerEntry>> {
            Ok(vec![])
        }
        fn remove(&self, _key: &LedgerKey) -> Result<bool> {
            Ok(false)
        }
        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    #[test]
    fn test_ledger_failure_is_fatal_before_apply() {
        let harness = Harness::new(CHAIN);
        let executor = MockExecutor::new();
        let graph = discovery::build(&harness.catalog, "api").unwrap();
        let mr = MergeRequestId::new("42").unwrap();
        let mut resolution = resolution::resolve(
            &graph,
            &harness.catalog,
            &mr,
            &BrokenLedger,
            &Overrides::new(),
        )
        .unwrap();
        let plan = ordering::plan(&graph, &resolution);
        let ctx = ExecutionContext {
            ledger: &BrokenLedger,
            ..harness.ctx(&executor, sequential(false))
        };

        let err = apply(
            &ctx,
            &Scope::MergeRequest(mr),
            &graph,
            &harness.catalog,
            &plan,
            &mut resolution,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Ledger { .. }));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn test_destroy_reverse_order_and_failure_propagation() {
        let harness = Harness::new(BRANCHES);
        let executor = MockExecutor::new();
        harness.deploy("root", &executor, false).unwrap();

        let scope = Scope::MergeRequest(MergeRequestId::new("42").unwrap());
        let entries: Vec<LedgerEntry> = harness.ledger.list(Some(&scope)).unwrap();
        let plan = ordering::reverse_plan(&ordering::plan_from_entries(&entries));
        assert_eq!(plan.to_string(), "[root] -> [c] -> [a, b]");
        let by_name: BTreeMap<String, LedgerEntry> = entries
            .into_iter()
            .map(|e| (e.service_name.clone(), e))
            .collect();

        let teardown = MockExecutor::new().failing(&["c"]);
        let ctx = harness.ctx(&teardown, sequential(true));
        let outcomes = destroy(&ctx, &plan, &by_name).unwrap();

        assert_eq!(
            teardown.calls(),
            vec!["destroy:root", "destroy:c", "destroy:a"]
        );
        assert_eq!(outcomes["root"], NodeOutcome::Destroyed);
        assert_eq!(outcomes["a"], NodeOutcome::Destroyed);
        assert_eq!(
            outcomes["b"],
            NodeOutcome::Skipped("dependent 'c' failed".to_string())
        );
        assert!(harness.entry("root").is_none());
        assert_eq!(harness.entry("c").unwrap().status, LedgerStatus::Failed);
        assert_eq!(harness.entry("b").unwrap().status, LedgerStatus::Applied);

        let work_of = |service: &str| {
            backend::work_dir(
                &harness.state_dir,
                &format!("ephemeral/app-42/{}/terraform.tfstate", service),
            )
        };
        assert!(!work_of("root").exists());
        assert!(work_of("c").join("inputs.tfvars.json").is_file());
    }

    /// Executor that pauses, then checks the generated files still describe
    /// the environment it was asked to apply
    struct WiringCheckExecutor {
        delay: Duration,
    }

    impl Executor for WiringCheckExecutor {
        fn apply(
            &self,
            request: &ApplyRequest,
            _cancel: &CancellationToken,
        ) -> Result<ApplyOutcome> {
            std::thread::sleep(self.delay);
            let backend_config =
                fs::read_to_string(request.work_dir.join(defaults::BACKEND_CONFIG_FILE))?;
            let inputs: BTreeMap<String, Value> = serde_json::from_str(&fs::read_to_string(
                request.work_dir.join(defaults::INPUTS_FILE),
            )?)?;
            let descriptor =
                fs::read_to_string(request.directory.join(defaults::REMOTE_STATE_FILE))?;

            if !backend_config.contains(&request.state_key)
                || inputs != request.inputs
                || descriptor.contains("tfstate")
            {
                return Err(Error::Execution {
                    service: request.service.clone(),
                    operation: "apply".to_string(),
                    message: format!("wired to foreign state: {} {:?}", backend_config, inputs),
                });
            }
            Ok(ApplyOutcome::default())
        }

        fn destroy(&self, _request: &DestroyRequest, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_concurrent_merge_requests_keep_their_own_wiring() {
        let harness = Harness::new(CHAIN);
        let executor = WiringCheckExecutor {
            delay: Duration::from_millis(50),
        };

        let (first, second) = std::thread::scope(|s| {
            let first = s.spawn(|| harness.run("1", "networking", &executor, sequential(false)));
            let second = s.spawn(|| harness.run("2", "networking", &executor, sequential(false)));
            (first.join().unwrap(), second.join().unwrap())
        });

        assert_eq!(first.unwrap()["networking"], NodeOutcome::Applied);
        assert_eq!(second.unwrap()["networking"], NodeOutcome::Applied);

        for mr in ["1", "2"] {
            let work = backend::work_dir(
                &harness.state_dir,
                &format!("ephemeral/app-{}/networking/terraform.tfstate", mr),
            );
            let inputs = fs::read_to_string(work.join("inputs.tfvars.json")).unwrap();
            assert!(inputs.contains(&format!("\"merge_request_id\": \"{}\"", mr)));
        }
    }

    /// Executor that takes `delay` per node and records start and end events.
    /// Failing nodes fail as soon as they start.
    struct TimedExecutor {
        delay: Duration,
        failing: BTreeSet<String>,
        events: Mutex<Vec<String>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl TimedExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                failing: BTreeSet::new(),
                events: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, services: &[&str]) -> Self {
            self.failing.extend(services.iter().map(|s| s.to_string()));
            self
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn started(&self) -> Vec<String> {
            self.events()
                .iter()
                .filter_map(|e| e.strip_prefix("start:").map(String::from))
                .collect()
        }

        fn max_active(&self) -> usize {
            self.max_active.load(Ordering::SeqCst)
        }
    }

    impl Executor for TimedExecutor {
        fn apply(
            &self,
            request: &ApplyRequest,
            _cancel: &CancellationToken,
        ) -> Result<ApplyOutcome> {
            let service = &request.service;
            self.events.lock().unwrap().push(format!("start:{}", service));
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);

            let failed = self.failing.contains(service);
            if !failed {
                std::thread::sleep(self.delay);
            }

            self.active.fetch_sub(1, Ordering::SeqCst);
            self.events.lock().unwrap().push(format!("end:{}", service));
            if failed {
                return Err(Error::Execution {
                    service: service.clone(),
                    operation: "apply".to_string(),
                    message: "timed failure".to_string(),
                });
            }
            Ok(ApplyOutcome::default())
        }

        fn destroy(&self, _request: &DestroyRequest, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }
    }

    const WIDE: &[(&str, &str)] = &[
        ("a", "name: a\n"),
        ("b", "name: b\n"),
        ("c", "name: c\n"),
        ("d", "name: d\n"),
        ("root", "name: root\ndepends: [a, b, c, d]\n"),
    ];

    #[test]
    fn test_batch_runs_in_parallel_and_next_batch_waits() {
        let harness = Harness::new(WIDE);
        let executor = TimedExecutor::new(Duration::from_millis(50));
        let options = ExecutionOptions {
            concurrency: 4,
            keep_going: false,
        };

        let outcomes = harness.run("42", "root", &executor, options).unwrap();

        assert!(outcomes.values().all(|o| *o == NodeOutcome::Applied));
        assert!(executor.max_active() >= 2, "batch nodes never overlapped");
        assert!(executor.max_active() <= 4);

        let events = executor.events();
        let position = |event: &str| events.iter().position(|e| e == event).unwrap();
        let root_start = position("start:root");
        for service in ["a", "b", "c", "d"] {
            assert!(position(&format!("end:{}", service)) < root_start);
        }
    }

    #[test]
    fn test_fail_fast_with_parallel_batch_skips_unstarted_siblings() {
        let harness = Harness::new(WIDE);
        let executor = TimedExecutor::new(Duration::from_millis(50)).failing(&["a"]);
        let options = ExecutionOptions {
            concurrency: 2,
            keep_going: false,
        };

        let outcomes = harness.run("42", "root", &executor, options).unwrap();

        assert!(matches!(outcomes["a"], NodeOutcome::Failed(_)));
        let started = executor.started();
        assert!(started.len() < 4, "all siblings started: {:?}", started);
        assert!(executor.max_active() <= 2);

        let mut skipped = 0;
        for service in ["b", "c", "d"] {
            if started.iter().any(|s| s == service) {
                assert_eq!(outcomes[service], NodeOutcome::Applied);
            } else {
                assert_eq!(
                    outcomes[service],
                    NodeOutcome::Skipped("not started after an earlier failure".to_string())
                );
                assert!(harness.entry(service).is_none());
                skipped += 1;
            }
        }
        assert!(skipped >= 1);
        assert!(matches!(outcomes["root"], NodeOutcome::Skipped(_)));
        assert!(!started.iter().any(|s| s == "root"));
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(NodeOutcome::Applied.to_string(), "applied");
        assert_eq!(
            NodeOutcome::Skipped("dependency 'a' failed".to_string()).to_string(),
            "skipped: dependency 'a' failed"
        );
        assert!(NodeOutcome::Bound.is_success());
        assert!(!NodeOutcome::Failed("x".to_string()).is_success());
        assert_eq!(
            serde_json::to_value(NodeOutcome::Failed("boom".to_string())).unwrap(),
            serde_json::json!({"status": "failed", "detail": "boom"})
        );
    }
}
