//! Boundary to the infrastructure engine.
//!
//! The orchestrator only talks to the [`Executor`] trait. [`TerraformExecutor`]
//! drives the `terraform` CLI (or any compatible binary such as `tofu`) in the
//! service directory. Everything specific to one environment comes from the
//! request's work directory: backend settings through `-backend-config`,
//! inputs through `-var-file` and the engine data directory through
//! `TF_DATA_DIR`. Two environments of one service can therefore run at the
//! same time.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::config::EnvironmentKind;
use crate::defaults;
use crate::error::{Error, Result};

/// Everything the engine needs to apply one node
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyRequest {
    pub service: String,
    pub directory: PathBuf,
    pub state_key: String,
    /// Work directory of the state key, see [`crate::backend`]
    pub work_dir: PathBuf,
    pub kind: EnvironmentKind,
    pub inputs: BTreeMap<String, Value>,
}

/// Everything the engine needs to destroy one node
#[derive(Debug, Clone, PartialEq)]
pub struct DestroyRequest {
    pub service: String,
    pub directory: PathBuf,
    pub state_key: String,
    pub work_dir: PathBuf,
}

/// What a successful apply produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    pub outputs: BTreeMap<String, Value>,
    pub resource_ids: Vec<String>,
}

/// Applies and destroys the infrastructure of a single node.
///
/// Implementations must return promptly with [`Error::Cancelled`] once the
/// token fires.
pub trait Executor: Send + Sync {
    fn apply(&self, request: &ApplyRequest, cancel: &CancellationToken) -> Result<ApplyOutcome>;

    fn destroy(&self, request: &DestroyRequest, cancel: &CancellationToken) -> Result<()>;
}

/// [`Executor`] backed by the terraform CLI
#[derive(Debug, Clone)]
pub struct TerraformExecutor {
    binary: String,
    /// How long a running process may keep going after cancellation
    grace_period: Duration,
    poll_interval: Duration,
}

impl Default for TerraformExecutor {
    fn default() -> Self {
        Self::new(defaults::DEFAULT_ENGINE)
    }
}

impl TerraformExecutor {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            grace_period: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn init(&self, target: &Target<'_>, cancel: &CancellationToken) -> Result<()> {
        let backend_config =
            file_flag(target.work_dir, "-backend-config", defaults::BACKEND_CONFIG_FILE);
        let mut args = vec!["init", "-input=false", "-reconfigure", "-no-color"];
        args.extend(backend_config.as_deref());
        self.run(target, "init", &args, cancel).map(|_| ())
    }

    /// Run one engine command and return its stdout.
    fn run(
        &self,
        target: &Target<'_>,
        operation: &str,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String> {
        let service = target.service;
        cancel.check(&format!("{} {}", operation, service))?;
        debug!(
            "Running '{} {}' in {}",
            self.binary,
            args.join(" "),
            target.directory.display()
        );

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(target.directory)
            .env("TF_DATA_DIR", target.work_dir.join(defaults::DATA_DIR))
            .env("GODEBUG", "asyncpreemptoff=1")
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Execution {
                service: service.to_string(),
                operation: operation.to_string(),
                message: format!("failed to start '{}': {}", self.binary, e),
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = self.wait(&mut child, service, operation, cancel)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if status.success() {
            return Ok(stdout);
        }

        let message = last_lines(&stderr, 20);
        Err(Error::Execution {
            service: service.to_string(),
            operation: operation.to_string(),
            message: if message.is_empty() {
                format!("'{}' exited with {}", self.binary, status)
            } else {
                message
            },
        })
    }

    /// Poll the child until it exits, killing it if cancellation outlasts the
    /// grace period.
    fn wait(
        &self,
        child: &mut Child,
        service: &str,
        operation: &str,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        let mut cancelled_at: Option<Instant> = None;
        loop {
            if let Some(status) = child.try_wait()? {
                if cancelled_at.is_some() {
                    return Err(Error::Cancelled {
                        context: format!("{} {}", operation, service),
                    });
                }
                return Ok(status);
            }

            if cancel.is_cancelled() {
                match cancelled_at {
                    None => {
                        warn!(
                            "Cancellation requested, waiting up to {:?} for {} of '{}' to stop",
                            self.grace_period, operation, service
                        );
                        cancelled_at = Some(Instant::now());
                    }
                    Some(since) if since.elapsed() >= self.grace_period => {
                        warn!("Killing {} of '{}'", operation, service);
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::Cancelled {
                            context: format!("{} {} (killed)", operation, service),
                        });
                    }
                    Some(_) => {}
                }
            }

            thread::sleep(self.poll_interval);
        }
    }
}

/// Directories of one engine run
struct Target<'a> {
    service: &'a str,
    directory: &'a Path,
    work_dir: &'a Path,
}

/// `<flag>=<work_dir>/<file>` when the file exists
fn file_flag(work_dir: &Path, flag: &str, file: &str) -> Option<String> {
    let path = work_dir.join(file);
    path.is_file().then(|| format!("{}={}", flag, path.display()))
}

impl Executor for TerraformExecutor {
    fn apply(&self, request: &ApplyRequest, cancel: &CancellationToken) -> Result<ApplyOutcome> {
        let service = request.service.as_str();
        let target = Target {
            service,
            directory: &request.directory,
            work_dir: &request.work_dir,
        };
        info!("Applying '{}' ({})", service, request.state_key);

        self.init(&target, cancel)?;
        let var_file = file_flag(&request.work_dir, "-var-file", defaults::INPUTS_FILE);
        let mut args = vec!["apply", "-auto-approve", "-input=false", "-no-color"];
        args.extend(var_file.as_deref());
        self.run(&target, "apply", &args, cancel)?;
        let outputs = self.run(&target, "output", &["output", "-json"], cancel)?;
        let resources = self.run(&target, "state list", &["state", "list"], cancel)?;

        Ok(ApplyOutcome {
            outputs: parse_outputs(&outputs).map_err(|e| Error::Execution {
                service: service.to_string(),
                operation: "output".to_string(),
                message: e.to_string(),
            })?,
            resource_ids: parse_state_list(&resources),
        })
    }

    fn destroy(&self, request: &DestroyRequest, cancel: &CancellationToken) -> Result<()> {
        let service = request.service.as_str();
        let target = Target {
            service,
            directory: &request.directory,
            work_dir: &request.work_dir,
        };
        info!("Destroying '{}' ({})", service, request.state_key);

        if !request.directory.is_dir() {
            return Err(Error::Execution {
                service: service.to_string(),
                operation: "destroy".to_string(),
                message: format!(
                    "service directory {} no longer exists",
                    request.directory.display()
                ),
            });
        }

        self.init(&target, cancel)?;
        let var_file = file_flag(&request.work_dir, "-var-file", defaults::INPUTS_FILE);
        let mut args = vec!["destroy", "-auto-approve", "-input=false", "-no-color"];
        args.extend(var_file.as_deref());
        self.run(&target, "destroy", &args, cancel).map(|_| ())
    }
}

/// Parse `terraform output -json` into `name -> value`
pub fn parse_outputs(json: &str) -> Result<BTreeMap<String, Value>> {
    if json.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let raw: BTreeMap<String, Value> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|(name, output)| {
            let value = match output {
                Value::Object(mut fields) => fields.remove("value").unwrap_or(Value::Null),
                other => other,
            };
            (name, value)
        })
        .collect())
}

/// Parse `terraform state list` into resource addresses
pub fn parse_state_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buffer);
        }
        buffer
    })
}

fn last_lines(text: &str, count: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(count);
    lines[start..].join("\n")
}
