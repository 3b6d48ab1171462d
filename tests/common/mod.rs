//! Shared test utilities for the CLI end-to-end tests.
//!
//! ## Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::prelude::*;
//!
//! #[test]
//! fn test_example() {
//!     let fixture = TestFixture::new().with_scenario();
//!     fixture.command().arg("ls").assert().success();
//! }
//! ```

use assert_fs::prelude::*;
use std::path::{Path, PathBuf};

/// Re-export commonly used test dependencies for convenience.
pub mod prelude {
    #[allow(unused_imports)]
    pub use assert_cmd::cargo::cargo_bin_cmd;
    #[allow(unused_imports)]
    pub use assert_fs::prelude::*;
    pub use predicates::prelude::*;

    #[allow(unused_imports)]
    pub use super::declarations;
    pub use super::TestFixture;
}

/// Declaration snippets for the networking / database / api workspace.
#[allow(dead_code)]
pub mod declarations {
    pub const WORKSPACE: &str = r#"
version: "1"
project:
  name: shop
"#;

    pub const NETWORKING: &str = r#"
name: networking
description: VPC and subnets
"#;

    pub const DATABASE: &str = r#"
name: database
depends:
  - networking
"#;

    pub const API: &str = r#"
name: api
depends:
  - networking
  - name: database
    environment: stable
"#;

    /// `api` with every dependency ephemeral
    pub const API_EPHEMERAL: &str = r#"
name: api
depends:
  - networking
  - database
"#;

    pub const INVALID_YAML: &str = "name: [unclosed";
}

/// A temporary workspace populated with `.envie` declarations.
pub struct TestFixture {
    temp_dir: assert_fs::TempDir,
}

#[allow(dead_code)]
impl TestFixture {
    /// Create a new test fixture with an empty temporary directory.
    pub fn new() -> Self {
        Self {
            temp_dir: assert_fs::TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Add `workspace.envie` with the given content.
    pub fn with_workspace(self, content: &str) -> Self {
        self.with_file("workspace.envie", content)
    }

    /// Add a service declaration in `dir`.
    pub fn with_service(self, dir: &str, declaration: &str) -> Self {
        self.with_file(&format!("{}/.envie", dir), declaration)
    }

    /// networking, database and api, with api pinning database to stable.
    pub fn with_scenario(self) -> Self {
        self.with_workspace(declarations::WORKSPACE)
            .with_service("services/networking", declarations::NETWORKING)
            .with_service("services/database", declarations::DATABASE)
            .with_service("services/api", declarations::API)
    }

    /// The scenario services without any stable pin.
    pub fn with_ephemeral_scenario(self) -> Self {
        self.with_workspace(declarations::WORKSPACE)
            .with_service("services/networking", declarations::NETWORKING)
            .with_service("services/database", declarations::DATABASE)
            .with_service("services/api", declarations::API_EPHEMERAL)
    }

    /// Add a file with the given path and content.
    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.temp_dir
            .child(path)
            .write_str(content)
            .expect("Failed to write file");
        self
    }

    /// Install a fake engine script and return its path.
    ///
    /// `body` is a POSIX shell snippet; `$1` is the engine subcommand and the
    /// working directory is the service directory.
    #[cfg(unix)]
    pub fn with_fake_engine(&self, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self.temp_dir.path().join("fake-terraform");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write fake engine");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("make fake engine executable");
        path
    }

    /// Get the path to the temporary directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.path().join(".envie-state").join("ledger.json")
    }

    /// Create a child path in the temp directory.
    pub fn child(&self, path: &str) -> assert_fs::fixture::ChildPath {
        self.temp_dir.child(path)
    }

    /// Create a command running in this fixture's directory with colours off.
    pub fn command(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("envie");
        cmd.current_dir(self.path())
            .env_remove("ENVIE_WORKSPACE")
            .env_remove("ENVIE_LEDGER")
            .env_remove("ENVIE_ENGINE")
            .env_remove("RUST_LOG")
            .arg("--color")
            .arg("never");
        cmd
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Fake engine that succeeds and reports one output per service
#[allow(dead_code)]
pub const SUCCEEDING_ENGINE: &str = r#"
service=$(basename "$PWD")
case "$1" in
  output) echo "{\"id\": {\"value\": \"$service-id\", \"type\": \"string\"}}" ;;
  state) echo "null_resource.$service" ;;
esac
exit 0
"#;

/// Fake engine whose apply fails for `networking`
#[allow(dead_code)]
pub const FAILING_NETWORKING_ENGINE: &str = r#"
service=$(basename "$PWD")
if [ "$1" = "apply" ] && [ "$service" = "networking" ]; then
  echo "Error: quota exceeded" >&2
  exit 1
fi
case "$1" in
  output) echo "{}" ;;
esac
exit 0
"#;
