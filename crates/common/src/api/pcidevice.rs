//! PCIDevice and PCIDeviceClaim (devices.harvesterhci.io/v1beta1)

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::impl_resource;

/// Discovered PCI device; read-only for the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PCIDevice {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PCIDeviceStatus>,
}

impl_resource!(
    PCIDevice,
    "devices.harvesterhci.io",
    "v1beta1",
    "PCIDevice",
    "pcidevices",
    ClusterResourceScope
);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PCIDeviceStatus {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kernel_driver_in_use: String,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "devices.harvesterhci.io",
    version = "v1beta1",
    kind = "PCIDeviceClaim",
    plural = "pcideviceclaims",
    status = "PCIDeviceClaimStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PCIDeviceClaimSpec {
    pub address: String,
    pub node_name: String,
    pub user_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PCIDeviceClaimStatus {
    #[serde(default)]
    pub kernel_driver_to_unbind: String,
    #[serde(default)]
    pub passthrough_enabled: bool,
}

/// Name Harvester gives the PCIDevice (and its claim) for a node/address pair:
/// the node name joined to the address with `:` and `.` stripped.
pub fn pci_device_claim_name(node_name: &str, address: &str) -> String {
    let compact: String = address.chars().filter(|c| *c != ':' && *c != '.').collect();
    format!("{}-{}", node_name, compact)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_name() {
        assert_eq!(
            pci_device_claim_name("harvester-node-0", "0000:04:00.0"),
            "harvester-node-0-000004000"
        );
    }

    #[test]
    fn test_device_status_parsing() {
        let json = r#"{"apiVersion": "devices.harvesterhci.io/v1beta1", "kind": "PCIDevice",
            "metadata": {"name": "node1-000004000"},
            "status": {"address": "0000:04:00.0", "nodeName": "node1", "resourceName": "nvidia.com/GP104GL"}}"#;
        let device: PCIDevice = serde_json::from_str(json).unwrap();
        assert_eq!(device.status.unwrap().resource_name, "nvidia.com/GP104GL");
    }
}
