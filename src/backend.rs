//! Files generated for the engine before it runs.
//!
//! The service directory only receives `.envie-remote-state.tf`, a backend
//! block naming the backend type. Its content is the same for every
//! environment of the service, so concurrent runs never disagree about it.
//!
//! Everything specific to one environment lives in a work directory below the
//! state directory, one per state key:
//!
//! - `backend.hcl`: backend settings including the state key, passed to
//!   `init -backend-config`
//! - `inputs.tfvars.json`: composed input variables, passed with `-var-file`
//! - `.terraform/`: the engine data directory, exported as `TF_DATA_DIR`
//!
//! Work directories are kept after an apply so teardown can reuse the inputs,
//! and removed once the environment is destroyed.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::debug;
use serde_json::Value;

use crate::config::BackendSettings;
use crate::defaults;
use crate::error::Result;
use crate::phases::ResolvedEnvironment;

/// Render the backend block written into a service directory
pub fn render_descriptor(backend_type: &str) -> String {
    format!(
        "# Generated by envie. Do not edit.\nterraform {{\n  backend \"{}\" {{}}\n}}\n",
        escape(backend_type)
    )
}

/// Render the backend settings for one state key.
///
/// The `local` backend has no `key` setting, so the state key becomes a path
/// below `state_dir`. Other backends get `key = "<state_key>"`. Settings are
/// emitted in key order.
pub fn render_backend_config(
    backend: &BackendSettings,
    state_key: &str,
    state_dir: &Path,
) -> String {
    let mut settings: BTreeMap<&str, String> = backend
        .config
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();

    if backend.backend_type == "local" {
        let path = state_dir.join(state_key);
        settings.insert("path", path.to_string_lossy().to_string());
    } else {
        settings.insert("key", state_key.to_string());
    }

    let mut out = String::from("# Generated by envie. Do not edit.\n");
    for (key, value) in settings {
        out.push_str(&format!("{} = \"{}\"\n", key, escape(&value)));
    }
    out
}

/// Work directory of one state key.
///
/// State keys are built from validated components, so the key is used as a
/// relative path. The trailing state file name is dropped.
pub fn work_dir(state_dir: &Path, state_key: &str) -> PathBuf {
    let key = Path::new(state_key);
    let relative = match key.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => key,
    };
    state_dir.join(defaults::WORK_DIR).join(relative)
}

/// Engine variable name for one output of a dependency
pub fn input_name(dependency: &str, output: &str) -> String {
    format!("{}_{}", dependency, output).replace('-', "_")
}

/// Input variables for `environment`: every output of every dependency, plus
/// the node's own identity.
pub fn compose_inputs<'a>(
    environment: &ResolvedEnvironment,
    dependencies: impl IntoIterator<Item = &'a ResolvedEnvironment>,
) -> BTreeMap<String, Value> {
    let mut inputs = BTreeMap::new();
    for dependency in dependencies {
        for (output, value) in &dependency.outputs {
            inputs.insert(input_name(&dependency.service_name, output), value.clone());
        }
    }

    inputs.insert(
        "service_name".to_string(),
        Value::String(environment.service_name.clone()),
    );
    inputs.insert(
        "environment_kind".to_string(),
        Value::String(environment.kind.to_string()),
    );
    inputs.insert(
        "merge_request_id".to_string(),
        environment
            .merge_request_id
            .as_ref()
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null),
    );
    inputs
}

/// Write the backend block into `directory`.
///
/// Left alone when it already has the expected content; otherwise replaced
/// atomically so a concurrent engine run never reads a partial file.
pub fn write_descriptor(directory: &Path, backend: &BackendSettings) -> Result<PathBuf> {
    let path = directory.join(defaults::REMOTE_STATE_FILE);
    let content = render_descriptor(&backend.backend_type);
    if fs::read_to_string(&path).is_ok_and(|existing| existing == content) {
        return Ok(path);
    }

    let mut temp = tempfile::NamedTempFile::new_in(directory)?;
    temp.write_all(content.as_bytes())?;
    temp.persist(&path).map_err(|e| e.error)?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Create the work directory of `state_key` and write its backend settings.
///
/// For the `local` backend the parent directory of the state file is created
/// too. Returns the work directory.
pub fn prepare_work_dir(
    backend: &BackendSettings,
    state_key: &str,
    state_dir: &Path,
) -> Result<PathBuf> {
    let dir = work_dir(state_dir, state_key);
    fs::create_dir_all(&dir)?;
    if backend.backend_type == "local" {
        if let Some(parent) = state_dir.join(state_key).parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let path = dir.join(defaults::BACKEND_CONFIG_FILE);
    fs::write(&path, render_backend_config(backend, state_key, state_dir))?;
    debug!("Wrote {}", path.display());
    Ok(dir)
}

/// Write the input variables file into a work directory
pub fn write_inputs(work_dir: &Path, inputs: &BTreeMap<String, Value>) -> Result<PathBuf> {
    let path = work_dir.join(defaults::INPUTS_FILE);
    fs::write(&path, serde_json::to_string_pretty(inputs)?)?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Remove the work directory of a destroyed environment
pub fn remove_work_dir(work_dir: &Path) -> Result<()> {
    if work_dir.is_dir() {
        fs::remove_dir_all(work_dir)?;
        debug!("Removed {}", work_dir.display());
    }
    Ok(())
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
