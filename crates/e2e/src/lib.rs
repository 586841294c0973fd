//! Harvester Acceptance Test Harness
//!
//! Drives the real `terraform` CLI against a live Harvester cluster with the
//! locally built provider wired in through `dev_overrides`, then checks the
//! cluster side with `kubectl`.
//!
//! Scenarios in `tests/` are `#[ignore]`d: they need a cluster reachable
//! through `KUBECONFIG` and the `terraform` and `kubectl` binaries.

pub mod error;
pub mod kubectl;
pub mod terraform;

use std::path::PathBuf;
use std::process::Command;

use uuid::Uuid;

pub use error::{E2eError, E2eResult};
pub use kubectl::Kubectl;
pub use terraform::{TerraformRun, Workspace};

/// Provider source address used in generated configurations
pub const PROVIDER_SOURCE: &str = "harvester/harvester";

/// Binary name Terraform expects inside the override directory
pub const PROVIDER_BINARY: &str = "terraform-provider-harvester";

pub fn in_path(bin: &str) -> bool {
    Command::new("sh")
        .arg("-lc")
        .arg(format!("command -v {bin} >/dev/null 2>&1"))
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Directory holding the built provider binary. `HARVESTER_PROVIDER_DIR`
/// overrides the default of the workspace `target/debug`.
pub fn provider_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("HARVESTER_PROVIDER_DIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("target")
        .join("debug")
}

/// Check everything a scenario needs, returning why it cannot run.
pub fn preflight() -> E2eResult<PathBuf> {
    for tool in ["terraform", "kubectl"] {
        if !in_path(tool) {
            return Err(E2eError::ToolNotFound(tool.to_string()));
        }
    }
    let dir = provider_dir();
    let binary = dir.join(PROVIDER_BINARY);
    if !binary.exists() {
        return Err(E2eError::ProviderNotBuilt(binary.display().to_string()));
    }
    Ok(dir)
}

/// Log to stderr at `HARVESTER_E2E_LOG` (default `info`). Safe to call from
/// every test.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("HARVESTER_E2E_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Unique resource name for one test run
pub fn unique_name(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_path() {
        assert!(in_path("sh"));
        assert!(!in_path("definitely-not-a-real-binary-name"));
    }

    #[test]
    fn test_unique_name_is_dns_safe() {
        let name = unique_name("tf-acc");
        assert!(name.starts_with("tf-acc-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert_eq!(name.len(), "tf-acc-".len() + 8);
    }

    #[test]
    fn test_unique_names_differ() {
        assert_ne!(unique_name("tf-acc"), unique_name("tf-acc"));
    }
}
