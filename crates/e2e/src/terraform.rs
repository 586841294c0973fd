//! Scratch Terraform working directories wired to the local provider build

use std::fs;
use std::path::Path;
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;
use tracing::{info, warn};

use crate::error::{E2eError, E2eResult};
use crate::PROVIDER_SOURCE;

/// Output of one terraform invocation
#[derive(Debug, Clone)]
pub struct TerraformRun {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl TerraformRun {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Diagnostics are printed to stderr, wrapped at the terminal width.
    /// Collapse whitespace so a message split over lines still matches.
    pub fn error_contains(&self, needle: &str) -> bool {
        let flat: String = self.stderr.split_whitespace().collect::<Vec<_>>().join(" ");
        flat.contains(needle)
    }
}

pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// New working directory using the provider binary in `provider_dir`
    pub fn new(provider_dir: &Path) -> E2eResult<Self> {
        let dir = tempfile::Builder::new().prefix("harvester-acc-").tempdir()?;
        fs::write(
            dir.path().join("terraform.rc"),
            cli_config(provider_dir),
        )?;
        fs::write(dir.path().join("provider.tf"), provider_config())?;
        info!("Terraform workspace at {}", dir.path().display());
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Replace the scenario configuration
    pub fn write_config(&self, hcl: &str) -> E2eResult<()> {
        fs::write(self.path().join("main.tf"), hcl)?;
        Ok(())
    }

    pub fn run(&self, args: &[&str]) -> E2eResult<TerraformRun> {
        info!("terraform {}", args.join(" "));
        let output = Command::new("terraform")
            .args(args)
            .current_dir(self.path())
            .env("TF_CLI_CONFIG_FILE", self.path().join("terraform.rc"))
            .env("TF_IN_AUTOMATION", "1")
            .output()?;
        Ok(TerraformRun {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_ok(&self, args: &[&str]) -> E2eResult<TerraformRun> {
        let run = self.run(args)?;
        if !run.success() {
            return Err(E2eError::CommandFailed {
                command: format!("terraform {}", args.join(" ")),
                code: run.code,
                stderr: run.stderr,
            });
        }
        Ok(run)
    }

    pub fn apply(&self) -> E2eResult<TerraformRun> {
        self.run_ok(&["apply", "-auto-approve", "-input=false", "-no-color"])
    }

    /// Apply that is expected to fail; returns the run for inspection
    pub fn apply_expect_error(&self) -> E2eResult<TerraformRun> {
        let run = self.run(&["apply", "-auto-approve", "-input=false", "-no-color"])?;
        if run.success() {
            return Err(E2eError::CommandFailed {
                command: "terraform apply".into(),
                code: 0,
                stderr: "expected apply to fail".into(),
            });
        }
        Ok(run)
    }

    /// `terraform plan -detailed-exitcode` reports no changes
    pub fn plan_is_empty(&self) -> E2eResult<bool> {
        let run = self.run(&["plan", "-detailed-exitcode", "-input=false", "-no-color"])?;
        match run.code {
            0 => Ok(true),
            2 => Ok(false),
            code => Err(E2eError::CommandFailed {
                command: "terraform plan".into(),
                code,
                stderr: run.stderr,
            }),
        }
    }

    pub fn destroy(&self) -> E2eResult<TerraformRun> {
        self.run_ok(&["destroy", "-auto-approve", "-input=false", "-no-color"])
    }

    /// Attribute of a resource in state, by address such as `harvester_volume.test`
    pub fn state_attribute(&self, address: &str, attribute: &str) -> E2eResult<Option<Value>> {
        let run = self.run_ok(&["show", "-json"])?;
        let show: Value = serde_json::from_str(&run.stdout)?;
        Ok(find_resource(&show, address).and_then(|r| r.get("values")?.get(attribute).cloned()))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.path().join("terraform.tfstate").exists() {
            return;
        }
        match self.run(&["destroy", "-auto-approve", "-input=false", "-no-color"]) {
            Ok(run) if run.success() => {}
            Ok(run) => warn!("cleanup destroy failed: {}", run.stderr),
            Err(e) => warn!("cleanup destroy failed: {}", e),
        }
    }
}

fn cli_config(provider_dir: &Path) -> String {
    format!(
        "provider_installation {{\n  dev_overrides {{\n    \"{}\" = \"{}\"\n  }}\n  direct {{}}\n}}\n",
        PROVIDER_SOURCE,
        provider_dir.display()
    )
}

fn provider_config() -> String {
    format!(
        "terraform {{\n  required_providers {{\n    harvester = {{\n      source = \"{}\"\n    }}\n  }}\n}}\n\nprovider \"harvester\" {{}}\n",
        PROVIDER_SOURCE
    )
}

fn find_resource<'a>(show: &'a Value, address: &str) -> Option<&'a Value> {
    show.get("values")?
        .get("root_module")?
        .get("resources")?
        .as_array()?
        .iter()
        .find(|r| r.get("address").and_then(Value::as_str) == Some(address))
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_config_points_at_build() {
        let config = cli_config(Path::new("/work/target/debug"));
        assert!(config.contains("\"harvester/harvester\" = \"/work/target/debug\""));
        assert!(config.contains("direct {}"));
    }

    #[test]
    fn test_find_resource() {
        let show = json!({
            "values": {"root_module": {"resources": [
                {"address": "harvester_volume.test", "values": {"size": "10Gi"}},
                {"address": "harvester_image.ubuntu", "values": {}},
            ]}}
        });
        let volume = find_resource(&show, "harvester_volume.test").unwrap();
        assert_eq!(volume["values"]["size"], "10Gi");
        assert!(find_resource(&show, "harvester_network.vlan").is_none());
    }

    #[test]
    fn test_error_contains_ignores_wrapping() {
        let run = TerraformRun {
            code: 1,
            stdout: String::new(),
            stderr: "Error: expected vlan_id to be in the range (0 -\n  4094), got 4095".into(),
        };
        assert!(run.error_contains("range (0 - 4094)"));
    }

    #[test]
    fn test_workspace_layout() {
        let ws = Workspace::new(Path::new("/tmp/provider")).unwrap();
        assert!(ws.path().join("terraform.rc").exists());
        ws.write_config("resource \"harvester_setting\" \"x\" {}").unwrap();
        assert!(ws.path().join("main.tf").exists());
    }
}
