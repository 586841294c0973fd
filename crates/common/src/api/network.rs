//! Networking types: NetworkAttachmentDefinition (k8s.cni.cncf.io/v1),
//! ClusterNetwork and VlanConfig (network.harvesterhci.io/v1beta1)

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ClusterResourceScope;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::Condition;
use crate::impl_resource;

pub const ROUTE_MODE_AUTO: &str = "auto";
pub const ROUTE_MODE_MANUAL: &str = "manual";

pub const BOND_MODE_ACTIVE_BACKUP: &str = "active-backup";
pub const BOND_MODES: &[&str] = &[
    "balance-rr",
    "active-backup",
    "balance-xor",
    "broadcast",
    "802.3ad",
    "balance-tlb",
    "balance-alb",
];

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "k8s.cni.cncf.io",
    version = "v1",
    kind = "NetworkAttachmentDefinition",
    plural = "network-attachment-definitions",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachmentDefinitionSpec {
    #[serde(default)]
    pub config: String,
}

/// Bridge CNI configuration stored in the NAD's `spec.config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub bridge: String,
    pub promisc_mode: bool,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default)]
    pub ipam: serde_json::Map<String, serde_json::Value>,
}

impl BridgeConfig {
    pub fn new(name: &str, cluster_network: &str, vlan: u16) -> Self {
        Self {
            cni_version: "0.3.1".to_string(),
            name: name.to_string(),
            type_: "bridge".to_string(),
            bridge: format!("{}-br", cluster_network),
            promisc_mode: true,
            vlan,
            ipam: serde_json::Map::new(),
        }
    }
}

/// Route settings kept in the `network.harvesterhci.io/route` annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(default)]
    pub mode: String,
    #[serde(default, rename = "serverIPAddr", skip_serializing_if = "String::is_empty")]
    pub server_ip_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cidr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub connectivity: String,
}

/// ClusterNetwork has no spec; it is identified by name only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetwork {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ClusterNetworkStatus>,
}

impl_resource!(
    ClusterNetwork,
    "network.harvesterhci.io",
    "v1beta1",
    "ClusterNetwork",
    "clusternetworks",
    ClusterResourceScope
);

impl ClusterNetwork {
    pub fn new(name: &str) -> Self {
        Self {
            api_version: "network.harvesterhci.io/v1beta1".to_string(),
            kind: "ClusterNetwork".to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "network.harvesterhci.io",
    version = "v1beta1",
    kind = "VlanConfig",
    plural = "vlanconfigs",
    status = "VlanConfigStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VlanConfigSpec {
    pub cluster_network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    pub uplink: Uplink,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uplink {
    #[serde(default)]
    pub nics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_attributes: Option<LinkAttributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bond_options: Option<BondOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<i64>,
    #[serde(default, rename = "txQLen", skip_serializing_if = "Option::is_none")]
    pub tx_q_len: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware_addr: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BondOptions {
    #[serde(default)]
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miimon: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VlanConfigStatus {
    #[serde(default)]
    pub matched_nodes: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
