//! Provider configuration

use std::path::PathBuf;

use harvester_common::{Error, Result};
use serde::Deserialize;

use crate::schema::{Attribute, Block, Schema};
use crate::state::{to_json, Value};

/// The `provider "harvester"` block
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub kubecontext: Option<String>,
    #[serde(default)]
    pub bootstrap: Option<bool>,
}

impl ProviderConfig {
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_value(to_json(value))?)
    }

    pub fn is_bootstrap(&self) -> bool {
        self.bootstrap.unwrap_or(false)
    }

    pub fn context(&self) -> Option<String> {
        self.kubecontext.clone().filter(|c| !c.is_empty())
    }

    /// Kubeconfig path: the `kubeconfig` attribute, then `KUBECONFIG`, then
    /// `~/.kube/config`.
    pub fn resolve_kubeconfig(&self) -> Result<PathBuf> {
        let env = std::env::var("KUBECONFIG").ok();
        resolve_kubeconfig_from(self.kubeconfig.as_deref(), env.as_deref())
    }
}

fn resolve_kubeconfig_from(explicit: Option<&str>, env: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return expand_home(path);
    }
    // KUBECONFIG may list several files; the first one is used.
    if let Some(first) = env.and_then(|v| v.split(':').find(|p| !p.is_empty())) {
        return expand_home(first);
    }
    dirs::home_dir()
        .map(|home| home.join(".kube").join("config"))
        .ok_or_else(|| {
            Error::InvalidConfig("cannot determine home directory for kubeconfig".into())
        })
}

/// Expand a leading `~/`.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .ok_or_else(|| Error::InvalidConfig(format!("cannot expand {}", path))),
        None => Ok(PathBuf::from(path)),
    }
}

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attribute(
                Attribute::string("kubeconfig")
                    .optional()
                    .description(
                        "kubeconfig file path, users can use the KUBECONFIG environment \
                         variable instead",
                    ),
            )
            .attribute(
                Attribute::string("kubecontext")
                    .optional()
                    .description("name of the kubernetes context to use"),
            )
            .attribute(
                Attribute::bool("bootstrap")
                    .optional()
                    .description("bootstrap harvester server, it will reset password"),
            ),
    )
}
