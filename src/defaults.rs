//! Default values for envie configuration.
//!
//! This module provides centralized default values and file names used across
//! the library and commands, ensuring consistency and avoiding duplication.

use std::path::{Path, PathBuf};

/// Service declaration file name
pub const DECLARATION_FILE: &str = ".envie";

/// Workspace configuration file name
pub const WORKSPACE_FILE: &str = "workspace.envie";

/// Backend block generated into a service directory. It only names the
/// backend type, so every environment of the service shares the same content.
pub const REMOTE_STATE_FILE: &str = ".envie-remote-state.tf";

/// Directory below the state directory holding one work directory per state key
pub const WORK_DIR: &str = "work";

/// Backend settings of one state key, passed to `init -backend-config`
pub const BACKEND_CONFIG_FILE: &str = "backend.hcl";

/// Input variables of one state key, passed with `-var-file`
pub const INPUTS_FILE: &str = "inputs.tfvars.json";

/// Engine data directory of one state key, exported as `TF_DATA_DIR`
pub const DATA_DIR: &str = ".terraform";

/// Directory (relative to the workspace root) holding the ledger, local state
/// and lock files
pub const STATE_DIR: &str = ".envie-state";

/// Default number of nodes applied concurrently within one batch
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default infrastructure engine binary
pub const DEFAULT_ENGINE: &str = "terraform";

/// Default backend type when the workspace does not configure one
pub const DEFAULT_BACKEND: &str = "local";

/// How deep auto-discovery descends below the workspace root
pub const DISCOVERY_MAX_DEPTH: usize = 4;

/// Returns the default ledger path for a workspace.
///
/// This can be overridden by the `ledger` key in `workspace.envie`, the
/// `--ledger` CLI flag or the `ENVIE_LEDGER` environment variable.
pub fn default_ledger_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(STATE_DIR).join("ledger.json")
}

/// Returns the default state directory for a workspace.
pub fn default_state_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(STATE_DIR)
}
