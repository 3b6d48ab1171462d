//! # Service Registry
//!
//! Loads every service declaration of a workspace into an immutable
//! [`Catalog`]. The catalog is built once per process and passed by reference
//! through graph building and resolution; nothing mutates it afterwards.
//!
//! Service directories are found in one of two ways:
//!
//! - **Explicit**: `workspace.envie` lists `services: [{path}]`. Paths may be
//!   glob patterns (`services/*`).
//! - **Auto-discovery**: otherwise every directory below the workspace root
//!   (bounded depth, hidden and `.terraform` directories skipped) that contains
//!   a `.envie` file is a service.
//!
//! Loading fails if any declared dependency names a service that does not
//! exist, so later phases can assume every edge has a target.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::{self, BackendSettings, EnvironmentKind, ServiceDeclaration, WorkspaceConfig};
use crate::defaults;
use crate::error::{Error, Result};

/// A deployable unit, as declared in its `.envie` file
#[derive(Debug, Clone, PartialEq)]
pub struct Service {
    pub name: String,
    pub description: String,
    /// Absolute path of the directory holding the `.envie` file
    pub directory: PathBuf,
    /// Dependency names in declared order, without duplicates
    pub dependencies: Vec<String>,
    /// Per-dependency overrides requested by this service
    pub mixing_policy: BTreeMap<String, EnvironmentKind>,
    /// Policy this service asks for when used as a dependency
    pub default_policy: Option<EnvironmentKind>,
}

impl Service {
    /// Build a service from its parsed declaration
    pub fn from_declaration(declaration: ServiceDeclaration, directory: PathBuf) -> Result<Self> {
        let mut dependencies = Vec::new();
        let mut seen = BTreeSet::new();
        let mut mixing_policy = BTreeMap::new();

        for dependency in &declaration.depends {
            let name = dependency.service_name()?;
            if let Some(kind) = dependency.environment() {
                mixing_policy.entry(name.clone()).or_insert(kind);
            }
            if seen.insert(name.clone()) {
                dependencies.push(name);
            }
        }

        Ok(Self {
            name: declaration.name,
            description: declaration.description,
            directory,
            dependencies,
            mixing_policy,
            default_policy: declaration.environment,
        })
    }

    /// The override this service requests for `dependency`, if any
    pub fn policy_for(&self, dependency: &str) -> Option<EnvironmentKind> {
        self.mixing_policy.get(dependency).copied()
    }
}

/// Workspace-level settings with defaults applied
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub config: WorkspaceConfig,
}

impl Workspace {
    /// Load `workspace.envie` from `root` if present
    pub fn load(root: &Path) -> Result<Self> {
        let root = canonical(root);
        let path = root.join(defaults::WORKSPACE_FILE);
        let config = if path.is_file() {
            config::workspace_from_file(&path)?
        } else {
            WorkspaceConfig::default()
        };
        Ok(Self { root, config })
    }

    /// Project name, used to namespace ephemeral state keys.
    ///
    /// Without a `project` section the workspace directory name is used, with
    /// characters that are not allowed in state keys replaced by `-`.
    pub fn project_name(&self) -> String {
        if let Some(project) = &self.config.project {
            return project.name.clone();
        }
        self.root
            .file_name()
            .map(|name| sanitize_project_name(&name.to_string_lossy()))
            .filter(|name| config::is_valid_project_name(name))
            .unwrap_or_else(|| "envie".to_string())
    }

    pub fn ledger_path(&self) -> PathBuf {
        match &self.config.ledger {
            Some(path) => self.root.join(path),
            None => defaults::default_ledger_path(&self.root),
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        match &self.config.state_dir {
            Some(path) => self.root.join(path),
            None => defaults::default_state_dir(&self.root),
        }
    }

    /// Backend for generated descriptors; a local backend under the state
    /// directory when none is configured
    pub fn backend(&self) -> BackendSettings {
        self.config.backend.clone().unwrap_or_else(|| BackendSettings {
            backend_type: defaults::DEFAULT_BACKEND.to_string(),
            config: BTreeMap::new(),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.config
            .concurrency
            .unwrap_or(defaults::DEFAULT_CONCURRENCY)
    }

    pub fn engine_binary(&self) -> String {
        self.config
            .engine
            .as_ref()
            .map(|engine| engine.binary.clone())
            .unwrap_or_else(|| defaults::DEFAULT_ENGINE.to_string())
    }
}

/// Immutable catalog of every service in a workspace
#[derive(Debug, Clone)]
pub struct Catalog {
    pub workspace: Workspace,
    services: BTreeMap<String, Service>,
}

impl Catalog {
    /// Load all service declarations below `root`.
    ///
    /// Fails with [`Error::Discovery`] when a dependency names a service that
    /// was not found, and with [`Error::ConfigParse`] on duplicate names.
    pub fn load(root: &Path) -> Result<Self> {
        let workspace = Workspace::load(root)?;
        let directories = if workspace.config.services.is_empty() {
            auto_discover(&workspace.root)
        } else {
            explicit_services(&workspace)?
        };

        let mut services = Vec::new();
        for directory in directories {
            let declaration =
                config::declaration_from_file(&directory.join(defaults::DECLARATION_FILE))?;
            debug!(
                "Discovered service '{}' in {}",
                declaration.name,
                directory.display()
            );
            services.push(Service::from_declaration(declaration, directory)?);
        }

        Self::from_services(workspace, services)
    }

    /// Build a catalog from already constructed services, validating names
    /// and dependency targets
    pub fn from_services(workspace: Workspace, services: Vec<Service>) -> Result<Self> {
        let mut by_name: BTreeMap<String, Service> = BTreeMap::new();
        for service in services {
            if let Some(existing) = by_name.get(&service.name) {
                return Err(Error::ConfigParse {
                    message: format!(
                        "service '{}' is declared twice ({} and {})",
                        service.name,
                        existing.directory.display(),
                        service.directory.display()
                    ),
                    hint: Some("service names must be unique within a workspace".to_string()),
                });
            }
            by_name.insert(service.name.clone(), service);
        }

        for service in by_name.values() {
            for dependency in &service.dependencies {
                if !by_name.contains_key(dependency) {
                    return Err(Error::Discovery {
                        service: service.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        Ok(Self {
            workspace,
            services: by_name,
        })
    }

    /// Look up a service by name
    pub fn lookup(&self, name: &str) -> Result<&Service> {
        self.services.get(name).ok_or_else(|| Error::NotFound {
            name: name.to_string(),
            available: self.services.keys().cloned().collect(),
        })
    }

    /// Identify the service owning `cwd` by walking upward to the nearest
    /// declaration file, stopping at the workspace root.
    pub fn discover_owning_service(&self, cwd: &Path) -> Result<&Service> {
        let cwd = canonical(cwd);
        for dir in cwd.ancestors() {
            if dir.join(defaults::DECLARATION_FILE).is_file() {
                if let Some(service) = self.services.values().find(|s| s.directory == dir) {
                    debug!(
                        "Working directory {} belongs to service '{}'",
                        cwd.display(),
                        service.name
                    );
                    return Ok(service);
                }
                warn!(
                    "{} contains a declaration that is not part of the workspace catalog",
                    dir.display()
                );
                break;
            }
            if dir == self.workspace.root {
                break;
            }
        }

        Err(Error::AmbiguousService {
            path: cwd.display().to_string(),
        })
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Walk upward from `start` to the nearest directory holding
/// `workspace.envie`. Falls back to `start` itself.
pub fn find_workspace_root(start: &Path) -> PathBuf {
    let start = canonical(start);
    start
        .ancestors()
        .find(|dir| dir.join(defaults::WORKSPACE_FILE).is_file())
        .map(Path::to_path_buf)
        .unwrap_or(start)
}

fn explicit_services(workspace: &Workspace) -> Result<Vec<PathBuf>> {
    let mut directories = Vec::new();
    for entry in &workspace.config.services {
        let pattern = workspace.root.join(&entry.path);
        if entry.path.contains(['*', '?', '[']) {
            let pattern = pattern.to_string_lossy().to_string();
            for matched in glob::glob(&pattern)? {
                let matched = matched.map_err(|e| Error::Io(e.into()))?;
                if matched.join(defaults::DECLARATION_FILE).is_file() {
                    directories.push(canonical(&matched));
                }
            }
        } else if pattern.join(defaults::DECLARATION_FILE).is_file() {
            directories.push(canonical(&pattern));
        } else {
            return Err(Error::ConfigParse {
                message: format!(
                    "no {} file found in {}",
                    defaults::DECLARATION_FILE,
                    pattern.display()
                ),
                hint: Some(format!(
                    "remove '{}' from {} or add a declaration there",
                    entry.path,
                    defaults::WORKSPACE_FILE
                )),
            });
        }
    }
    directories.sort();
    directories.dedup();
    Ok(directories)
}

fn auto_discover(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .max_depth(defaults::DISCOVERY_MAX_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_skipped_dir(entry))
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file() && entry.file_name() == defaults::DECLARATION_FILE
        })
        .filter_map(|entry| entry.path().parent().map(canonical))
        .collect()
}

fn is_skipped_dir(entry: &DirEntry) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || name == "node_modules" || name == "target"
}

fn sanitize_project_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
