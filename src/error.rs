//! # Error Handling
//!
//! This module defines the centralized error type for `envie`. It uses the
//! `thiserror` library to create a single `Error` enum covering every failure
//! mode of the orchestrator, with messages that name the service, merge
//! request or state key involved.
//!
//! ## Key Components
//!
//! - **`Error`**: The main enum. Each variant carries enough context to be
//!   reported to the user without further lookups.
//!
//! - **`ErrorCategory`**: Groups variants into the four classes the
//!   orchestrator reasons about:
//!   - `Configuration`: bad or missing declarations, cycles, ambiguous
//!     auto-discovery. Always fatal and raised before anything is applied.
//!   - `Resolution`: a stable binding that has never been applied.
//!   - `Execution`: the infrastructure engine failed (or was cancelled) for one
//!     node.
//!   - `Ledger`: the state ledger is unavailable. Fatal, since destroy depends
//!     on it.
//!
//! - **`Result<T>`**: A type alias for `std::result::Result<T, Error>`.

use thiserror::Error;

/// Main error type for envie operations
#[derive(Error, Debug)]
pub enum Error {
    /// A declaration or workspace file could not be parsed or is invalid.
    #[error("Configuration parsing error: {message}{}", hint.as_ref().map(|h| format!("\n  hint: {}", h)).unwrap_or_default())]
    ConfigParse {
        message: String,
        /// Optional hint for how to fix the configuration issue
        hint: Option<String>,
    },

    /// A service declares a dependency with no matching service directory.
    #[error("Discovery error: service '{service}' depends on '{dependency}', which is not declared anywhere in the workspace")]
    Discovery { service: String, dependency: String },

    /// A service name was requested that the catalog does not know.
    #[error("Service '{name}' not found (available: {})", if available.is_empty() { "none".to_string() } else { available.join(", ") })]
    NotFound {
        name: String,
        available: Vec<String>,
    },

    /// No owning service could be identified from the working directory.
    #[error("Cannot determine which service to deploy from {path}\n  hint: run from a directory containing a .envie file or name the service explicitly")]
    AmbiguousService { path: String },

    /// A circular dependency was detected between services.
    #[error("Cycle detected in service dependencies: {cycle}")]
    CycleDetected { cycle: String },

    /// A dependency resolved to `stable` but no stable instance was ever applied.
    #[error("Unresolved stable binding: '{service}' (required by '{required_by}') has no applied stable environment\n  hint: run 'envie deploy --stable {service}' first")]
    UnresolvedStableBinding {
        service: String,
        required_by: String,
    },

    /// The infrastructure engine failed for a single node.
    #[error("Execution error for '{service}' during {operation}: {message}")]
    Execution {
        service: String,
        operation: String,
        message: String,
    },

    /// The operation was cancelled or its deadline passed.
    #[error("Operation cancelled: {context}")]
    Cancelled { context: String },

    /// The state ledger could not be read or written.
    #[error("Ledger error ({path}): {message}")]
    Ledger { path: String, message: String },

    /// A merge request identifier that cannot be used in a state key.
    #[error("Invalid merge request id '{id}': only letters, digits, '.', '_' and '-' are allowed")]
    InvalidMergeRequest { id: String },

    /// An error indicating that a mutex or other lock has been poisoned.
    #[error("Lock poisoned: {context}")]
    LockPoisoned { context: String },

    /// An I/O error, wrapped from `std::io::Error`.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A YAML parsing error, wrapped from `serde_yaml::Error`.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A JSON error, wrapped from `serde_json::Error`.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A glob pattern error, wrapped from `glob::PatternError`.
    #[error("Glob pattern error: {0}")]
    Glob(#[from] glob::PatternError),
}

/// Coarse classification of errors, used to decide what is fatal and how the
/// failure is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Resolution,
    Execution,
    Ledger,
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ErrorCategory::Configuration => "configuration error",
            ErrorCategory::Resolution => "environment resolution failed",
            ErrorCategory::Execution => "execution failed",
            ErrorCategory::Ledger => "state ledger unavailable",
            ErrorCategory::Io => "I/O failure",
        })
    }
}

impl Error {
    /// The category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ConfigParse { .. }
            | Error::Discovery { .. }
            | Error::NotFound { .. }
            | Error::AmbiguousService { .. }
            | Error::CycleDetected { .. }
            | Error::InvalidMergeRequest { .. }
            | Error::Yaml(_)
            | Error::Glob(_) => ErrorCategory::Configuration,
            Error::UnresolvedStableBinding { .. } => ErrorCategory::Resolution,
            Error::Execution { .. } | Error::Cancelled { .. } => ErrorCategory::Execution,
            Error::Ledger { .. } | Error::LockPoisoned { .. } | Error::Json(_) => {
                ErrorCategory::Ledger
            }
            Error::Io(_) => ErrorCategory::Io,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::ConfigParse {
            message: message.into(),
            hint: None,
        }
    }

    pub(crate) fn ledger(path: impl Into<String>, message: impl ToString) -> Self {
        Error::Ledger {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// A convenient type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;
