//! Cluster-side checks through `kubectl`

use std::process::Command;

use serde_json::Value;
use tracing::debug;

use crate::error::{E2eError, E2eResult};

pub struct Kubectl {
    kubeconfig: Option<String>,
}

impl Kubectl {
    /// Uses `KUBECONFIG` from the environment when set
    pub fn new() -> Self {
        Self {
            kubeconfig: std::env::var("KUBECONFIG").ok().filter(|k| !k.is_empty()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("kubectl");
        if let Some(path) = &self.kubeconfig {
            cmd.arg("--kubeconfig").arg(path);
        }
        cmd
    }

    /// The object as JSON, or `None` when the API server reports NotFound.
    /// An empty `namespace` addresses a cluster-scoped kind.
    pub fn get(&self, kind: &str, namespace: &str, name: &str) -> E2eResult<Option<Value>> {
        let mut cmd = self.command();
        cmd.arg("get").arg(kind).arg(name).arg("-o").arg("json");
        if !namespace.is_empty() {
            cmd.arg("-n").arg(namespace);
        }
        debug!("kubectl get {} {}/{}", kind, namespace, name);
        let output = cmd.output()?;
        if output.status.success() {
            return Ok(Some(serde_json::from_slice(&output.stdout)?));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if stderr.contains("NotFound") || stderr.contains("not found") {
            return Ok(None);
        }
        Err(E2eError::CommandFailed {
            command: format!("kubectl get {} {}", kind, name),
            code: output.status.code().unwrap_or(-1),
            stderr,
        })
    }
}

impl Default for Kubectl {
    fn default() -> Self {
        Self::new()
    }
}

/// Follow a dotted path through a JSON object
pub fn field<'a>(object: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(object, |v, key| v.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field() {
        let object = json!({
            "spec": {"template": {"spec": {"domain": {"memory": {"guest": "2Gi"}}}}}
        });
        assert_eq!(
            field(&object, "spec.template.spec.domain.memory.guest"),
            Some(&json!("2Gi"))
        );
        assert!(field(&object, "spec.missing").is_none());
    }
}
