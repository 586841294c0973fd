//! Resource Implementations
//!
//! Every Terraform resource type pairs a schema with a handler implementing
//! [`Resource`]. Handlers receive the typed API handles they need when they
//! are built; nothing is looked up at call time.

pub mod backup;
pub mod bootstrap;
pub mod cloudinit_secret;
pub mod clusternetwork;
pub mod image;
pub mod ippool;
pub mod keypair;
pub mod loadbalancer;
pub mod network;
pub mod pci_device;
pub mod setting;
pub mod storageclass;
pub mod virtualmachine;
pub mod vlanconfig;
pub mod volume;

use async_trait::async_trait;
use harvester_common::constants::*;
use harvester_common::{build_id, id_parts, Error, Result};

use crate::client::HarvesterClient;
use crate::schema::Schema;
use crate::state::{get_string_attr, make_state, string_value, Value};

/// CRUD handler for one resource type
#[async_trait]
pub trait Resource: Send + Sync {
    /// Create the object and return its state
    async fn create(&self, planned: &Value) -> Result<Value>;

    /// Current state, or `None` when the object is gone
    async fn read(&self, state: &Value) -> Result<Option<Value>>;

    /// Update in place and return the new state
    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value>;

    /// Delete the object; deleting something already gone succeeds
    async fn delete(&self, prior: &Value) -> Result<()>;

    /// State for `terraform import`
    async fn import(&self, id: &str) -> Result<Option<Value>> {
        self.read(&make_state(vec![("id", string_value(id))])).await
    }
}

/// Managed resource types, in registration order
pub const RESOURCE_TYPES: &[&str] = &[
    RESOURCE_TYPE_BOOTSTRAP,
    RESOURCE_TYPE_IMAGE,
    RESOURCE_TYPE_SSH_KEY,
    RESOURCE_TYPE_NETWORK,
    RESOURCE_TYPE_VIRTUAL_MACHINE,
    RESOURCE_TYPE_VOLUME,
    RESOURCE_TYPE_CLUSTER_NETWORK,
    RESOURCE_TYPE_VLAN_CONFIG,
    RESOURCE_TYPE_SETTING,
    RESOURCE_TYPE_STORAGE_CLASS,
    RESOURCE_TYPE_IP_POOL,
    RESOURCE_TYPE_LOAD_BALANCER,
    RESOURCE_TYPE_CLOUDINIT_SECRET,
    RESOURCE_TYPE_SCHEDULE_BACKUP,
    RESOURCE_TYPE_VOLUME_BACKUP,
    RESOURCE_TYPE_PCI_DEVICE,
];

/// Resource types that also have a data source of the same name
pub const DATA_SOURCE_TYPES: &[&str] = &[
    RESOURCE_TYPE_IMAGE,
    RESOURCE_TYPE_SSH_KEY,
    RESOURCE_TYPE_NETWORK,
    RESOURCE_TYPE_CLUSTER_NETWORK,
    RESOURCE_TYPE_VLAN_CONFIG,
    RESOURCE_TYPE_SETTING,
    RESOURCE_TYPE_STORAGE_CLASS,
    RESOURCE_TYPE_IP_POOL,
    RESOURCE_TYPE_LOAD_BALANCER,
    RESOURCE_TYPE_CLOUDINIT_SECRET,
    RESOURCE_TYPE_SCHEDULE_BACKUP,
    RESOURCE_TYPE_VOLUME,
    RESOURCE_TYPE_VIRTUAL_MACHINE,
];

pub fn resource_schema(type_name: &str) -> Option<Schema> {
    let schema = match type_name {
        RESOURCE_TYPE_BOOTSTRAP => bootstrap::schema(),
        RESOURCE_TYPE_IMAGE => image::schema(),
        RESOURCE_TYPE_SSH_KEY => keypair::schema(),
        RESOURCE_TYPE_NETWORK => network::schema(),
        RESOURCE_TYPE_VIRTUAL_MACHINE => virtualmachine::schema(),
        RESOURCE_TYPE_VOLUME => volume::schema(),
        RESOURCE_TYPE_CLUSTER_NETWORK => clusternetwork::schema(),
        RESOURCE_TYPE_VLAN_CONFIG => vlanconfig::schema(),
        RESOURCE_TYPE_SETTING => setting::schema(),
        RESOURCE_TYPE_STORAGE_CLASS => storageclass::schema(),
        RESOURCE_TYPE_IP_POOL => ippool::schema(),
        RESOURCE_TYPE_LOAD_BALANCER => loadbalancer::schema(),
        RESOURCE_TYPE_CLOUDINIT_SECRET => cloudinit_secret::schema(),
        RESOURCE_TYPE_SCHEDULE_BACKUP => backup::schedule_backup_schema(),
        RESOURCE_TYPE_VOLUME_BACKUP => backup::volume_backup_schema(),
        RESOURCE_TYPE_PCI_DEVICE => pci_device::schema(),
        _ => return None,
    };
    Some(schema)
}

pub fn data_source_schema(type_name: &str) -> Option<Schema> {
    if !DATA_SOURCE_TYPES.contains(&type_name) {
        return None;
    }
    resource_schema(type_name).map(|s| s.data_source())
}

/// Build the handler for a cluster-backed resource type.
pub fn resource_for(type_name: &str, client: &HarvesterClient) -> Option<Box<dyn Resource>> {
    let resource: Box<dyn Resource> = match type_name {
        RESOURCE_TYPE_IMAGE => Box::new(image::ImageResource::new(client.namespaced())),
        RESOURCE_TYPE_SSH_KEY => Box::new(keypair::KeyPairResource::new(client.namespaced())),
        RESOURCE_TYPE_NETWORK => Box::new(network::NetworkResource::new(client.namespaced())),
        RESOURCE_TYPE_VIRTUAL_MACHINE => Box::new(virtualmachine::VirtualMachineResource::new(
            client.namespaced(),
            client.namespaced(),
            client.namespaced(),
            client.namespaced(),
            client.namespaced(),
        )),
        RESOURCE_TYPE_VOLUME => Box::new(volume::VolumeResource::new(
            client.namespaced(),
            client.namespaced(),
        )),
        RESOURCE_TYPE_CLUSTER_NETWORK => {
            Box::new(clusternetwork::ClusterNetworkResource::new(client.cluster()))
        }
        RESOURCE_TYPE_VLAN_CONFIG => {
            Box::new(vlanconfig::VlanConfigResource::new(client.cluster()))
        }
        RESOURCE_TYPE_SETTING => Box::new(setting::SettingResource::new(client.cluster())),
        RESOURCE_TYPE_STORAGE_CLASS => {
            Box::new(storageclass::StorageClassResource::new(client.cluster()))
        }
        RESOURCE_TYPE_IP_POOL => Box::new(ippool::IPPoolResource::new(client.cluster())),
        RESOURCE_TYPE_LOAD_BALANCER => {
            Box::new(loadbalancer::LoadBalancerResource::new(client.namespaced()))
        }
        RESOURCE_TYPE_CLOUDINIT_SECRET => {
            Box::new(cloudinit_secret::CloudInitSecretResource::new(client.namespaced()))
        }
        RESOURCE_TYPE_SCHEDULE_BACKUP => {
            Box::new(backup::ScheduleBackupResource::new(client.namespaced()))
        }
        RESOURCE_TYPE_VOLUME_BACKUP => {
            Box::new(backup::VolumeBackupResource::new(client.namespaced()))
        }
        RESOURCE_TYPE_PCI_DEVICE => Box::new(pci_device::PCIDeviceResource::new(
            client.cluster(),
            client.cluster(),
            client.namespaced(),
        )),
        _ => return None,
    };
    Some(resource)
}

/// Read a data source through its resource handler: the lookup keys form
/// the ID and a missing object is an error rather than a tombstone.
pub async fn read_data_source(
    resource: &dyn Resource,
    type_name: &str,
    schema: &Schema,
    config: &Value,
) -> Result<Value> {
    let name = get_string_attr(config, "name");
    let namespace = if schema.block.find_attribute("namespace").is_some() {
        match get_string_attr(config, "namespace") {
            ns if ns.is_empty() => DEFAULT_NAMESPACE.to_string(),
            ns => ns,
        }
    } else {
        String::new()
    };
    let id = build_id(&namespace, &name);
    resource
        .read(&make_state(vec![("id", string_value(&id))]))
        .await?
        .ok_or_else(|| Error::not_found(type_name, id))
}

/// `(namespace, name)` from the `id` attribute
pub fn object_id(state: &Value) -> Result<(String, String)> {
    id_parts(&get_string_attr(state, "id"))
}

/// `(namespace, name)` of the object a planned state describes
pub fn planned_id(planned: &Value, namespaced: bool) -> (String, String) {
    let namespace = if namespaced {
        match get_string_attr(planned, "namespace") {
            ns if ns.is_empty() => DEFAULT_NAMESPACE.to_string(),
            ns => ns,
        }
    } else {
        String::new()
    };
    (namespace, get_string_attr(planned, "name"))
}
