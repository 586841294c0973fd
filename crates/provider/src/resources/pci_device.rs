//! harvester_pci_device: PCIDeviceClaims plus the VM host devices using them
//!
//! The resource is keyed by the virtual machine: its ID is
//! `namespace/vm_name`. Each address is claimed for passthrough on the node,
//! then attached to the VM as a host device. Changes reach the guest on its
//! next restart.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::kubevirt::{HostDevice, VirtualMachine};
use harvester_common::api::pcidevice::*;
use harvester_common::constants::{
    CREATOR_TERRAFORM, DEFAULT_NAMESPACE, LABEL_CREATOR, RESOURCE_TYPE_PCI_DEVICE, STATE_ACTIVE,
    STATE_IN_PROGRESS,
};
use harvester_common::{Error, Result};
use tracing::{debug, info, warn};

use super::{object_id, Resource};
use crate::client::ObjectApi;
use crate::importer::Importer;
use crate::poll::{wait_for_state, Timeouts};
use crate::schema::{Attribute, Block, Schema};
use crate::state::{get_string_attr, get_string_list_attr, string_list_value, string_value, Value};
use crate::validators;

const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attribute(Attribute::string("id").computed())
            .attribute(
                Attribute::string("namespace")
                    .default(string_value(DEFAULT_NAMESPACE))
                    .force_new()
                    .validate(validators::dns1123()),
            )
            .attribute(
                Attribute::string("vm_name")
                    .required()
                    .force_new()
                    .validate(validators::dns1123()),
            )
            .attribute(
                Attribute::string("node_name")
                    .required()
                    .force_new()
                    .validate(validators::not_empty()),
            )
            .attribute(
                Attribute::string_list("pci_addresses")
                    .required()
                    .validate(validators::not_empty())
                    .description("PCI addresses such as `0000:04:00.0`"),
            )
            .attribute(Attribute::string("state").computed())
            .attribute(Attribute::string("message").computed()),
    )
}

pub fn build_claim(node_name: &str, address: &str) -> PCIDeviceClaim {
    let mut claim = PCIDeviceClaim::new(
        &pci_device_claim_name(node_name, address),
        PCIDeviceClaimSpec {
            address: address.to_string(),
            node_name: node_name.to_string(),
            user_name: CREATOR_TERRAFORM.to_string(),
        },
    );
    claim.metadata.labels = Some(BTreeMap::from([(
        LABEL_CREATOR.to_string(),
        CREATOR_TERRAFORM.to_string(),
    )]));
    claim
}

/// Attach host devices for `devices` (claim name, resource name), replacing
/// entries with the same name, and pin the VM to the node that owns them.
pub fn attach(vm: &mut VirtualMachine, node_name: &str, devices: &[(String, String)]) {
    let template = &mut vm.spec.template.spec;
    let host_devices = &mut template.domain.devices.host_devices;
    for (claim_name, resource_name) in devices {
        host_devices.retain(|d| &d.name != claim_name);
        host_devices.push(HostDevice {
            name: claim_name.clone(),
            device_name: resource_name.clone(),
        });
    }
    template
        .node_selector
        .insert(LABEL_HOSTNAME.to_string(), node_name.to_string());
}

/// Drop the host devices named in `claim_names`.
pub fn detach(vm: &mut VirtualMachine, claim_names: &[String]) {
    vm.spec
        .template
        .spec
        .domain
        .devices
        .host_devices
        .retain(|d| !claim_names.contains(&d.name));
}

pub fn to_state(vm: &VirtualMachine, claims: &[PCIDeviceClaim]) -> Value {
    let namespace = vm.metadata.namespace.clone().unwrap_or_default();
    let vm_name = vm.metadata.name.clone().unwrap_or_default();
    let mut importer = Importer::new(RESOURCE_TYPE_PCI_DEVICE, &namespace, &vm_name);

    let node_name = claims
        .first()
        .map(|c| c.spec.node_name.clone())
        .unwrap_or_default();
    let pending: Vec<&str> = claims
        .iter()
        .filter(|c| !c.status.as_ref().is_some_and(|s| s.passthrough_enabled))
        .map(|c| c.spec.address.as_str())
        .collect();
    let (state, message) = if pending.is_empty() {
        (STATE_ACTIVE, String::new())
    } else {
        (
            STATE_IN_PROGRESS,
            format!("passthrough not yet enabled for {}", pending.join(", ")),
        )
    };

    importer
        .set("vm_name", string_value(&vm_name))
        .set("node_name", string_value(node_name))
        .set(
            "pci_addresses",
            string_list_value(claims.iter().map(|c| c.spec.address.clone())),
        )
        .set_state(state, &message);
    importer.into_state()
}

pub struct PCIDeviceResource {
    claims: Arc<dyn ObjectApi<PCIDeviceClaim>>,
    devices: Arc<dyn ObjectApi<PCIDevice>>,
    vms: Arc<dyn ObjectApi<VirtualMachine>>,
    timeouts: Timeouts,
}

impl PCIDeviceResource {
    pub fn new(
        claims: Arc<dyn ObjectApi<PCIDeviceClaim>>,
        devices: Arc<dyn ObjectApi<PCIDevice>>,
        vms: Arc<dyn ObjectApi<VirtualMachine>>,
    ) -> Self {
        Self {
            claims,
            devices,
            vms,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn get_vm(&self, namespace: &str, vm_name: &str) -> Result<VirtualMachine> {
        self.vms
            .get(namespace, vm_name)
            .await?
            .ok_or_else(|| Error::not_found("VirtualMachine", format!("{}/{}", namespace, vm_name)))
    }

    /// Claim every address and wait for passthrough. Returns
    /// `(claim name, resource name)` per address.
    async fn claim(&self, node_name: &str, addresses: &[String]) -> Result<Vec<(String, String)>> {
        let mut devices = Vec::with_capacity(addresses.len());
        for address in addresses {
            let claim_name = pci_device_claim_name(node_name, address);
            let device = self
                .devices
                .get("", &claim_name)
                .await?
                .ok_or_else(|| Error::not_found("PCIDevice", &claim_name))?;
            let resource_name = device.status.unwrap_or_default().resource_name;

            if self.claims.get("", &claim_name).await?.is_none() {
                info!("Claiming PCI device {} on {}", address, node_name);
                self.claims.create("", &build_claim(node_name, address)).await?;
            }

            let wait = self
                .timeouts
                .wait(
                    format!("PCI device {} to be enabled for passthrough", claim_name),
                    self.timeouts.create,
                )
                .pending(&[STATE_IN_PROGRESS])
                .target(&[STATE_ACTIVE]);
            let claims = &self.claims;
            let name = claim_name.as_str();
            wait_for_state(&wait, || async move {
                let enabled = claims
                    .get("", name)
                    .await?
                    .and_then(|c| c.status)
                    .is_some_and(|s| s.passthrough_enabled);
                let state = if enabled { STATE_ACTIVE } else { STATE_IN_PROGRESS };
                Ok(((), state.to_string()))
            })
            .await?;
            devices.push((claim_name, resource_name));
        }
        Ok(devices)
    }

    async fn release(&self, claim_names: &[String]) -> Result<()> {
        for name in claim_names {
            if !self.claims.delete("", name).await? {
                debug!("PCI device claim {} already released", name);
            }
        }
        Ok(())
    }

    /// Claims attached to the VM, in host device order
    async fn attached_claims(&self, vm: &VirtualMachine) -> Result<Vec<PCIDeviceClaim>> {
        let mut claims = Vec::new();
        for device in &vm.spec.template.spec.domain.devices.host_devices {
            if let Some(claim) = self.claims.get("", &device.name).await? {
                claims.push(claim);
            }
        }
        Ok(claims)
    }
}

fn claim_names(node_name: &str, addresses: &[String]) -> Vec<String> {
    addresses
        .iter()
        .map(|a| pci_device_claim_name(node_name, a))
        .collect()
}

#[async_trait]
impl Resource for PCIDeviceResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let namespace = match get_string_attr(planned, "namespace") {
            ns if ns.is_empty() => DEFAULT_NAMESPACE.to_string(),
            ns => ns,
        };
        let vm_name = get_string_attr(planned, "vm_name");
        let node_name = get_string_attr(planned, "node_name");
        let addresses = get_string_list_attr(planned, "pci_addresses");
        if addresses.is_empty() {
            return Err(Error::Validation("pci_addresses must not be empty".into()));
        }
        info!("Attaching PCI devices to {}/{}", namespace, vm_name);

        let mut vm = self.get_vm(&namespace, &vm_name).await?;
        let devices = self.claim(&node_name, &addresses).await?;
        attach(&mut vm, &node_name, &devices);
        let updated = self.vms.replace(&namespace, &vm_name, &vm).await?;
        Ok(to_state(&updated, &self.attached_claims(&updated).await?))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, vm_name) = object_id(state)?;
        let Some(vm) = self.vms.get(&namespace, &vm_name).await? else {
            return Ok(None);
        };
        let claims = self.attached_claims(&vm).await?;
        if claims.is_empty() {
            return Ok(None);
        }
        Ok(Some(to_state(&vm, &claims)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, vm_name) = object_id(prior)?;
        info!("Updating PCI devices of {}/{}", namespace, vm_name);
        let node_name = get_string_attr(planned, "node_name");
        let before = get_string_list_attr(prior, "pci_addresses");
        let after = get_string_list_attr(planned, "pci_addresses");

        let removed: Vec<String> = before.iter().filter(|a| !after.contains(a)).cloned().collect();
        let removed = claim_names(&node_name, &removed);

        let mut vm = self.get_vm(&namespace, &vm_name).await?;
        detach(&mut vm, &removed);
        let devices = self.claim(&node_name, &after).await?;
        attach(&mut vm, &node_name, &devices);
        let updated = self.vms.replace(&namespace, &vm_name, &vm).await?;
        self.release(&removed).await?;
        Ok(to_state(&updated, &self.attached_claims(&updated).await?))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, vm_name) = object_id(prior)?;
        info!("Detaching PCI devices from {}/{}", namespace, vm_name);
        let names = claim_names(
            &get_string_attr(prior, "node_name"),
            &get_string_list_attr(prior, "pci_addresses"),
        );

        match self.vms.get(&namespace, &vm_name).await? {
            Some(mut vm) => {
                detach(&mut vm, &names);
                self.vms.replace(&namespace, &vm_name, &vm).await?;
            }
            None => warn!("virtual machine {}/{} already deleted", namespace, vm_name),
        }
        self.release(&names).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use crate::state::make_state;
    use harvester_common::api::kubevirt::VirtualMachineSpec;

    fn device(node: &str, address: &str, resource: &str) -> PCIDevice {
        PCIDevice {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(pci_device_claim_name(node, address)),
                ..Default::default()
            },
            status: Some(PCIDeviceStatus {
                address: address.into(),
                node_name: node.into(),
                resource_name: resource.into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new("gpu-worker", VirtualMachineSpec::default());
        vm.metadata.namespace = Some("default".into());
        vm
    }

    struct Fixture {
        claims: Arc<MemoryApi<PCIDeviceClaim>>,
        vms: Arc<MemoryApi<VirtualMachine>>,
        resource: PCIDeviceResource,
    }

    fn fixture() -> Fixture {
        // Stands in for the device controller binding vfio-pci.
        let claims = MemoryApi::<PCIDeviceClaim>::new()
            .on_write(|c| {
                c.status = Some(PCIDeviceClaimStatus {
                    kernel_driver_to_unbind: "nvidia".into(),
                    passthrough_enabled: true,
                });
            })
            .arc();
        let devices = MemoryApi::<PCIDevice>::new().arc();
        devices.insert(device("node-1", "0000:04:00.0", "nvidia.com/GA102"));
        devices.insert(device("node-1", "0000:04:00.1", "nvidia.com/GA102_AUDIO"));
        let vms = MemoryApi::<VirtualMachine>::new().arc();
        vms.insert(vm());
        let resource = PCIDeviceResource::new(claims.clone(), devices, vms.clone())
            .with_timeouts(Timeouts::fast());
        Fixture { claims, vms, resource }
    }

    fn planned(addresses: &[&str]) -> Value {
        make_state(vec![
            ("namespace", string_value("default")),
            ("vm_name", string_value("gpu-worker")),
            ("node_name", string_value("node-1")),
            ("pci_addresses", string_list_value(addresses.iter().copied())),
        ])
    }

    #[test]
    fn test_attach_replaces_same_name() {
        let mut vm = vm();
        let devices = vec![("node-1-000004000".to_string(), "nvidia.com/GA102".to_string())];
        attach(&mut vm, "node-1", &devices);
        attach(&mut vm, "node-1", &devices);
        let template = &vm.spec.template.spec;
        assert_eq!(template.domain.devices.host_devices.len(), 1);
        assert_eq!(template.node_selector[LABEL_HOSTNAME], "node-1");

        detach(&mut vm, &["node-1-000004000".to_string()]);
        assert!(vm.spec.template.spec.domain.devices.host_devices.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let f = fixture();
        let state = f.resource.create(&planned(&["0000:04:00.0"])).await.unwrap();
        assert_eq!(get_string_attr(&state, "id"), "default/gpu-worker");
        assert_eq!(get_string_attr(&state, "state"), STATE_ACTIVE);
        assert_eq!(state.get("pci_addresses"), Some(&string_list_value(["0000:04:00.0"])));

        let stored = f.claims.stored("", "node-1-000004000").unwrap();
        assert_eq!(stored.spec.user_name, CREATOR_TERRAFORM);
        let vm = f.vms.stored("default", "gpu-worker").unwrap();
        assert_eq!(
            vm.spec.template.spec.domain.devices.host_devices[0].device_name,
            "nvidia.com/GA102"
        );

        let changed = planned(&["0000:04:00.1"]);
        let state = f.resource.update(&state, &changed).await.unwrap();
        assert_eq!(state.get("pci_addresses"), Some(&string_list_value(["0000:04:00.1"])));
        assert!(f.claims.stored("", "node-1-000004000").is_none());

        f.resource.delete(&state).await.unwrap();
        assert_eq!(f.claims.len(), 0);
        assert!(f.resource.read(&state).await.unwrap().is_none());
        f.resource.delete(&state).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let f = fixture();
        let err = f
            .resource
            .create(&planned(&["0000:09:00.0"]))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(f.claims.len(), 0);
    }

    #[tokio::test]
    async fn test_missing_vm_rejected() {
        let f = fixture();
        let mut data = planned(&["0000:04:00.0"]);
        data.set("vm_name", string_value("absent"));
        assert!(f.resource.create(&data).await.unwrap_err().is_not_found());
    }
}
