//! Setting (harvesterhci.io/v1beta1)
//!
//! Settings carry `value` at the top level instead of under a spec.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use serde::{Deserialize, Serialize};

use crate::impl_resource;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Setting {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customized: Option<bool>,
}

impl_resource!(Setting, "harvesterhci.io", "v1beta1", "Setting", "settings", ClusterResourceScope);

impl Setting {
    pub fn new(name: &str) -> Self {
        Self {
            api_version: "harvesterhci.io/v1beta1".to_string(),
            kind: "Setting".to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::Resource;

    #[test]
    fn test_setting_resource_metadata() {
        assert_eq!(Setting::api_version(&()), "harvesterhci.io/v1beta1");
        assert_eq!(Setting::plural(&()), "settings");
        let json = serde_json::to_value(Setting::new("ntp-servers")).unwrap();
        assert_eq!(json["kind"], "Setting");
        assert!(json.get("value").is_none());
    }
}
