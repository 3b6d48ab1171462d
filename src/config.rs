//! # Declaration and Workspace Configuration
//!
//! This module defines the data structures behind the two YAML files envie
//! reads, plus the parsing logic for them.
//!
//! ## Service declarations (`.envie`)
//!
//! Every deployable service directory contains a `.envie` file:
//!
//! ```yaml
//! name: api
//! description: API Gateway and Lambda functions
//! environment: ephemeral        # default policy when used as a dependency
//! depends:
//!   - networking                # plain name
//!   - ../cache                  # relative path, last component is the name
//!   - name: database            # mapping with a mixing override
//!     environment: stable
//! ```
//!
//! ## Workspace file (`workspace.envie`)
//!
//! Optional, at the workspace root. It names the project, lists service
//! directories (globs allowed) and configures the state backend and engine:
//!
//! ```yaml
//! version: "1"
//! project:
//!   name: myapp
//! services:
//!   - path: services/*
//! backend:
//!   type: s3
//!   config:
//!     bucket: terraform-state
//!     region: eu-west-1
//! concurrency: 4
//! engine:
//!   binary: tofu
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("valid service name regex")
});

/// Merge request ids and project names; both end up as state key components.
static KEY_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid state key component regex")
});

/// Whether a node gets its own merge-request-scoped instance or binds to the
/// shared, long-lived one.
///
/// Used both as the resolved kind of an environment and as the mixing policy a
/// service declares for its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum EnvironmentKind {
    Ephemeral,
    Stable,
}

impl EnvironmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentKind::Ephemeral => "ephemeral",
            EnvironmentKind::Stable => "stable",
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvironmentKind {
    type Err = Error;

    /// Accepts `ephemeral` and `stable`. The older `stable.<name>` form is
    /// read as `stable`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ephemeral" => Ok(EnvironmentKind::Ephemeral),
            "stable" => Ok(EnvironmentKind::Stable),
            other if other.starts_with("stable.") => Ok(EnvironmentKind::Stable),
            other => Err(Error::ConfigParse {
                message: format!("unknown environment '{}'", other),
                hint: Some("use 'ephemeral' or 'stable'".to_string()),
            }),
        }
    }
}

impl TryFrom<String> for EnvironmentKind {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Identifier of the merge request an ephemeral environment belongs to.
///
/// Validated on construction because it becomes part of state keys and
/// directory-like backend paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MergeRequestId(String);

impl MergeRequestId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if KEY_COMPONENT.is_match(&id) {
            Ok(Self(id))
        } else {
            Err(Error::InvalidMergeRequest { id })
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MergeRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MergeRequestId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<MergeRequestId> for String {
    fn from(id: MergeRequestId) -> Self {
        id.0
    }
}

impl FromStr for MergeRequestId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Mixing override given for one run, written `service=kind`.
///
/// `service:kind` is accepted too, as is the older `stable.<name>` spelling
/// of the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentOverride {
    pub service: String,
    pub kind: EnvironmentKind,
}

impl FromStr for EnvironmentOverride {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (service, kind) = s.split_once(['=', ':']).ok_or_else(|| Error::ConfigParse {
            message: format!("invalid environment override '{}'", s),
            hint: Some("write <service>=<ephemeral|stable>".to_string()),
        })?;
        let service = service.trim();
        if !SERVICE_NAME.is_match(service) {
            return Err(Error::config(format!(
                "invalid service name '{}' in environment override",
                service
            )));
        }
        Ok(Self {
            service: service.to_string(),
            kind: kind.parse()?,
        })
    }
}

/// A single entry of a service's `depends` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    /// `- networking` or `- ../networking`
    Name(String),
    /// `- name: database` with an optional `environment` override
    Detailed {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        path: Option<String>,
        #[serde(default)]
        environment: Option<EnvironmentKind>,
    },
}

impl DependencyRef {
    /// The service name this reference points at.
    ///
    /// Path references (`../database`, `services/database/`) resolve to their
    /// last path component.
    pub fn service_name(&self) -> Result<String> {
        let raw = match self {
            DependencyRef::Name(name) => name.as_str(),
            DependencyRef::Detailed {
                name: Some(name), ..
            } => name.as_str(),
            DependencyRef::Detailed {
                name: None,
                path: Some(path),
                ..
            } => path.as_str(),
            DependencyRef::Detailed {
                name: None,
                path: None,
                ..
            } => {
                return Err(Error::ConfigParse {
                    message: "dependency entry has neither 'name' nor 'path'".to_string(),
                    hint: Some("write '- name: <service>'".to_string()),
                })
            }
        };

        let name = raw
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .trim();

        if !SERVICE_NAME.is_match(name) {
            return Err(Error::config(format!(
                "invalid dependency reference '{}'",
                raw
            )));
        }
        Ok(name.to_string())
    }

    /// The requester's mixing override for this dependency, if any.
    pub fn environment(&self) -> Option<EnvironmentKind> {
        match self {
            DependencyRef::Name(_) => None,
            DependencyRef::Detailed { environment, .. } => *environment,
        }
    }
}

/// Contents of a `.envie` service declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Policy this service asks for when another service depends on it.
    #[serde(default)]
    pub environment: Option<EnvironmentKind>,

    #[serde(default)]
    pub depends: Vec<DependencyRef>,
}

/// Project metadata from the workspace file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Explicit service location in the workspace file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePath {
    pub path: String,
}

/// Remote state backend used for every generated descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(rename = "type")]
    pub backend_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Infrastructure engine invocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub binary: String,
}

/// Contents of `workspace.envie`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub project: Option<ProjectInfo>,

    #[serde(default)]
    pub services: Vec<ServicePath>,

    #[serde(default)]
    pub backend: Option<BackendSettings>,

    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub engine: Option<EngineSettings>,

    /// Ledger file, relative to the workspace root
    #[serde(default)]
    pub ledger: Option<PathBuf>,

    /// Directory for local state and lock files, relative to the workspace root
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// Parse a `.envie` service declaration from a YAML string
pub fn parse_declaration(yaml: &str) -> Result<ServiceDeclaration> {
    let declaration: ServiceDeclaration =
        serde_yaml::from_str(yaml).map_err(|e| Error::ConfigParse {
            message: format!("failed to parse service declaration: {}", e),
            hint: None,
        })?;

    if !SERVICE_NAME.is_match(&declaration.name) {
        return Err(Error::ConfigParse {
            message: format!("invalid service name '{}'", declaration.name),
            hint: Some(
                "service names start with a letter or digit and contain only letters, digits, '-' and '_'"
                    .to_string(),
            ),
        });
    }

    for dependency in &declaration.depends {
        let name = dependency.service_name()?;
        if name == declaration.name {
            return Err(Error::CycleDetected {
                cycle: format!("{} -> {}", name, name),
            });
        }
    }

    Ok(declaration)
}

/// Load a `.envie` service declaration from disk
pub fn declaration_from_file(path: &Path) -> Result<ServiceDeclaration> {
    let content = std::fs::read_to_string(path)?;
    parse_declaration(&content).map_err(|e| match e {
        Error::ConfigParse { message, hint } => Error::ConfigParse {
            message: format!("{}: {}", path.display(), message),
            hint,
        },
        other => other,
    })
}

/// Whether `name` can be used as the project part of a state key
pub fn is_valid_project_name(name: &str) -> bool {
    KEY_COMPONENT.is_match(name)
}

/// Parse a `workspace.envie` file from a YAML string
pub fn parse_workspace(yaml: &str) -> Result<WorkspaceConfig> {
    if yaml.trim().is_empty() {
        return Ok(WorkspaceConfig::default());
    }

    let config: WorkspaceConfig = serde_yaml::from_str(yaml).map_err(|e| Error::ConfigParse {
        message: format!("failed to parse workspace config: {}", e),
        hint: None,
    })?;

    if let Some(project) = &config.project {
        if !is_valid_project_name(&project.name) {
            return Err(Error::ConfigParse {
                message: format!("invalid project name '{}'", project.name),
                hint: Some(
                    "project names start with a letter or digit and contain only letters, digits, '.', '_' and '-'"
                        .to_string(),
                ),
            });
        }
    }

    if config.concurrency == Some(0) {
        return Err(Error::ConfigParse {
            message: "concurrency must be at least 1".to_string(),
            hint: None,
        });
    }

    Ok(config)
}

/// Load a `workspace.envie` file from disk
pub fn workspace_from_file(path: &Path) -> Result<WorkspaceConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_workspace(&content)
}
