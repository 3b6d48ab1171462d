//! # envie
//!
//! Per-merge-request ephemeral infrastructure environments, composed with
//! shared stable ones. A service declares its dependencies in a `.envie`
//! file; deploying it for a merge request brings up an isolated copy of the
//! service and every dependency that is not pinned to a stable environment,
//! wiring them together through input variables derived from each
//! dependency's outputs.
//!
//! ## Quick Example
//!
//! ```
//! use envie::config::{self, EnvironmentKind};
//!
//! let declaration = config::parse_declaration(
//!     r#"
//! name: api
//! depends:
//!   - networking
//!   - name: database
//!     environment: stable
//! "#,
//! )
//! .unwrap();
//!
//! assert_eq!(declaration.name, "api");
//! assert_eq!(declaration.depends.len(), 2);
//! assert_eq!(
//!     declaration.depends[1].environment(),
//!     Some(EnvironmentKind::Stable)
//! );
//! ```
//!
//! ## Core Concepts
//!
//! - **Registry (`registry`)**: loads every declaration of a workspace into an
//!   immutable catalog.
//! - **Phases (`phases`)**: dependency graph, environment resolution, batch
//!   planning and parallel execution, tied together by the orchestrator.
//! - **Ledger (`ledger`)**: durable record of every environment applied, the
//!   sole source of truth for teardown.
//! - **Executor (`executor`)**: the boundary to the infrastructure engine;
//!   `TerraformExecutor` drives the `terraform` (or compatible) binary.
//! - **Backend (`backend`)**: remote-state descriptors and input variable
//!   files generated into each service directory.
//!
//! ## Execution Flow
//!
//! 1. **Discovery**: build the dependency graph reachable from the requested
//!    service and reject cycles.
//! 2. **Resolution**: decide per node whether it runs ephemeral or binds to a
//!    stable environment, and derive its state key.
//! 3. **Ordering**: group the nodes to apply into dependency-ordered batches.
//! 4. **Execution**: apply batch by batch on a bounded worker pool, recording
//!    every node in the ledger before and after it runs.

pub mod backend;
pub mod cancel;
pub mod config;
pub mod defaults;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod lock;
pub mod output;
pub mod phases;
pub mod registry;
