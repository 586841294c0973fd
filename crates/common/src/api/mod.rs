//! Harvester, KubeVirt and related API types
//!
//! Only the fields the provider reads or writes are modelled. Objects the
//! provider replaces wholesale keep unknown fields in `extra` maps so a
//! round trip through the provider does not drop server-side settings.

pub mod backup;
pub mod image;
pub mod keypair;
pub mod kubevirt;
pub mod loadbalancer;
pub mod network;
pub mod pcidevice;
pub mod setting;

use serde::{Deserialize, Serialize};

/// Implement `kube::Resource` for a type that has no `spec` and therefore
/// cannot use the `CustomResource` derive.
#[macro_export]
macro_rules! impl_resource {
    ($ty:ty, $group:literal, $version:literal, $kind:literal, $plural:literal, $scope:ty) => {
        impl kube::Resource for $ty {
            type DynamicType = ();
            type Scope = $scope;

            fn kind(_: &()) -> std::borrow::Cow<'_, str> {
                $kind.into()
            }

            fn group(_: &()) -> std::borrow::Cow<'_, str> {
                $group.into()
            }

            fn version(_: &()) -> std::borrow::Cow<'_, str> {
                $version.into()
            }

            fn plural(_: &()) -> std::borrow::Cow<'_, str> {
                $plural.into()
            }

            fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &self.metadata
            }

            fn meta_mut(
                &mut self,
            ) -> &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

/// Serializes as `{}`; used for KubeVirt's marker objects such as `bridge: {}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Empty {}

/// Status condition shared by the Harvester CRDs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn is_true(&self) -> bool {
        self.status.eq_ignore_ascii_case("true")
    }

    pub fn is_false(&self) -> bool {
        self.status.eq_ignore_ascii_case("false")
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}

/// Find a condition by type.
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_parsing() {
        let json = r#"[{"type": "Imported", "status": "True", "lastUpdateTime": "2024-01-01T00:00:00Z"}]"#;
        let conditions: Vec<Condition> = serde_json::from_str(json).unwrap();
        let imported = find_condition(&conditions, "Imported").unwrap();
        assert!(imported.is_true());
        assert_eq!(imported.message(), "");
        assert!(find_condition(&conditions, "Initialized").is_none());
    }

    #[test]
    fn test_empty_marker() {
        assert_eq!(serde_json::to_string(&Empty {}).unwrap(), "{}");
    }
}
