//! VirtualMachineImage (harvesterhci.io/v1beta1)

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::Condition;

pub const IMAGE_SOURCE_DOWNLOAD: &str = "download";
pub const IMAGE_SOURCE_UPLOAD: &str = "upload";
pub const IMAGE_SOURCE_EXPORT_FROM_VOLUME: &str = "export-from-volume";

pub const CONDITION_IMAGE_IMPORTED: &str = "Imported";
pub const CONDITION_IMAGE_INITIALIZED: &str = "Initialized";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "harvesterhci.io",
    version = "v1beta1",
    kind = "VirtualMachineImage",
    plural = "virtualmachineimages",
    namespaced,
    status = "VirtualMachineImageStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImageSpec {
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage_class_parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineImageStatus {
    #[serde(default)]
    pub progress: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub virtual_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
