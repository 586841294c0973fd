//! harvester_virtualmachine: KubeVirt VirtualMachine
//!
//! Disks backed by new volumes are declared through the
//! `harvesterhci.io/volumeClaimTemplates` annotation and Harvester creates
//! the claims. The running VirtualMachineInstance supplies the node name and
//! interface addresses.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use harvester_common::api::image::VirtualMachineImage;
use harvester_common::api::keypair::KeyPair;
use harvester_common::api::kubevirt::*;
use harvester_common::api::Empty;
use harvester_common::cloudinit::{check_keypairs_in_user_data, KeyPairRef};
use harvester_common::constants::*;
use harvester_common::net::is_link_local;
use harvester_common::{namespaced_name, namespaced_name_parts, Error, Result};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Secret, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use super::cloudinit_secret::SECRET_KEY_USER_DATA;
use super::volume::{image_storage_class, ACCESS_MODES, DEFAULT_VOLUME_SIZE, VOLUME_MODES};
use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_int, as_string, as_string_list, as_string_map, construct, metadata_processors, new_meta,
    reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::poll::{wait_for_state, Timeouts};
use crate::schema::{namespaced_attributes, Attribute, Block, NestedBlock, Schema};
use crate::state::{
    bool_value, get_bool_attr, get_int_attr, get_list_attr, get_string_attr,
    get_string_list_attr, int_value, list_value, make_state, optional_string_value,
    string_list_value, string_map_value, string_value, Value,
};
use crate::validators;

pub const DEFAULT_MEMORY: &str = "1Gi";

pub const DISK_TYPE_DISK: &str = "disk";
pub const DISK_TYPE_CD_ROM: &str = "cd-rom";
pub const DISK_BUSES: &[&str] = &["virtio", "sata", "scsi"];

pub const INTERFACE_TYPE_BRIDGE: &str = "bridge";
pub const INTERFACE_TYPE_MASQUERADE: &str = "masquerade";
pub const INTERFACE_MODELS: &[&str] =
    &["virtio", "e1000", "e1000e", "ne2k_pci", "pcnet", "rtl8139"];

pub const CLOUDINIT_TYPE_NO_CLOUD: &str = "noCloud";
pub const CLOUDINIT_TYPE_CONFIG_DRIVE: &str = "configDrive";

const INPUT_TYPES: &[&str] = &["tablet"];
const INPUT_BUSES: &[&str] = &["usb", "virtio"];

/// State of a VM whose run strategy keeps it stopped
const STATE_OFF: &str = "Off";

fn network_interface_block() -> Block {
    Block::new()
        .attribute(
            Attribute::string("name")
                .required()
                .validate(validators::dns1123()),
        )
        .attribute(
            Attribute::string("type")
                .optional()
                .computed()
                .validate(validators::string_in_slice(&[
                    INTERFACE_TYPE_BRIDGE,
                    INTERFACE_TYPE_MASQUERADE,
                ])),
        )
        .attribute(
            Attribute::string("model")
                .default(string_value("virtio"))
                .validate(validators::string_in_slice(INTERFACE_MODELS)),
        )
        .attribute(Attribute::string("mac_address").optional().computed())
        .attribute(
            Attribute::string("network_name")
                .optional()
                .validate(validators::namespaced_name())
                .description("VLAN network as `namespace/name`; empty attaches the pod network"),
        )
        .attribute(
            Attribute::bool("wait_for_lease")
                .default(bool_value(false))
                .description("Wait until the guest agent reports an address for this interface"),
        )
        .attribute(Attribute::string("ip_address").computed())
        .attribute(Attribute::string("interface_name").computed())
}

fn disk_block() -> Block {
    Block::new()
        .attribute(
            Attribute::string("name")
                .required()
                .validate(validators::dns1123()),
        )
        .attribute(
            Attribute::string("type")
                .default(string_value(DISK_TYPE_DISK))
                .validate(validators::string_in_slice(&[DISK_TYPE_DISK, DISK_TYPE_CD_ROM])),
        )
        .attribute(
            Attribute::string("size")
                .default(string_value(DEFAULT_VOLUME_SIZE))
                .validate(validators::quantity()),
        )
        .attribute(
            Attribute::string("bus")
                .default(string_value("virtio"))
                .validate(validators::string_in_slice(DISK_BUSES)),
        )
        .attribute(
            Attribute::number("boot_order")
                .optional()
                .validate(validators::int_at_least(0)),
        )
        .attribute(
            Attribute::string("image")
                .optional()
                .validate(validators::namespaced_name()),
        )
        .attribute(Attribute::string("existing_volume_name").optional())
        .attribute(Attribute::string("container_image_name").optional())
        .attribute(Attribute::string("storage_class_name").optional().computed())
        .attribute(
            Attribute::string("volume_mode")
                .default(string_value("Block"))
                .validate(validators::string_in_slice(VOLUME_MODES)),
        )
        .attribute(
            Attribute::string("access_mode")
                .default(string_value("ReadWriteMany"))
                .validate(validators::string_in_slice(ACCESS_MODES)),
        )
        .attribute(Attribute::string("volume_name").optional().computed())
        .attribute(
            Attribute::bool("auto_delete")
                .default(bool_value(true))
                .description("Delete the backing volume together with the virtual machine"),
        )
        .attribute(Attribute::bool("hot_plug").default(bool_value(false)))
}

fn cloudinit_block() -> Block {
    Block::new()
        .attribute(
            Attribute::string("type")
                .default(string_value(CLOUDINIT_TYPE_NO_CLOUD))
                .validate(validators::string_in_slice(&[
                    CLOUDINIT_TYPE_NO_CLOUD,
                    CLOUDINIT_TYPE_CONFIG_DRIVE,
                ])),
        )
        .attribute(
            Attribute::string("user_data")
                .optional()
                .conflicts_with(&["user_data_base64", "user_data_secret_name"]),
        )
        .attribute(
            Attribute::string("user_data_base64")
                .optional()
                .conflicts_with(&["user_data", "user_data_secret_name"])
                .validate(validators::base64()),
        )
        .attribute(
            Attribute::string("user_data_secret_name")
                .optional()
                .conflicts_with(&["user_data", "user_data_base64"]),
        )
        .attribute(
            Attribute::string("network_data")
                .optional()
                .conflicts_with(&["network_data_base64", "network_data_secret_name"]),
        )
        .attribute(
            Attribute::string("network_data_base64")
                .optional()
                .conflicts_with(&["network_data", "network_data_secret_name"])
                .validate(validators::base64()),
        )
        .attribute(
            Attribute::string("network_data_secret_name")
                .optional()
                .conflicts_with(&["network_data", "network_data_base64"]),
        )
}

fn input_block() -> Block {
    Block::new()
        .attribute(Attribute::string("name").required())
        .attribute(
            Attribute::string("type")
                .default(string_value("tablet"))
                .validate(validators::string_in_slice(INPUT_TYPES)),
        )
        .attribute(
            Attribute::string("bus")
                .default(string_value("usb"))
                .validate(validators::string_in_slice(INPUT_BUSES)),
        )
}

/// At most one volume source per disk
fn check_disk_sources(config: &Value) -> std::result::Result<(), String> {
    for disk in get_list_attr(config, "disk") {
        let sources = ["image", "existing_volume_name", "container_image_name"]
            .into_iter()
            .filter(|key| !get_string_attr(disk, key).is_empty())
            .collect::<Vec<_>>();
        if sources.len() > 1 {
            return Err(format!(
                "disk {} sets more than one source: {}",
                get_string_attr(disk, "name"),
                sources.join(", ")
            ));
        }
    }
    Ok(())
}

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::number("cpu")
                    .default(int_value(1))
                    .validate(validators::int_at_least(1)),
            )
            .attribute(
                Attribute::string("memory")
                    .default(string_value(DEFAULT_MEMORY))
                    .validate(validators::quantity()),
            )
            .attribute(Attribute::string("hostname").optional().computed())
            .attribute(Attribute::string("machine_type").optional().computed())
            .attribute(
                Attribute::string("run_strategy")
                    .default(string_value(RUN_STRATEGY_RERUN_ON_FAILURE))
                    .validate(validators::string_in_slice(RUN_STRATEGIES)),
            )
            .attribute(Attribute::bool("efi").default(bool_value(false)))
            .attribute(
                Attribute::bool("secure_boot")
                    .default(bool_value(false))
                    .description("Requires `efi`"),
            )
            .attribute(Attribute::string_map("node_selector").optional())
            .attribute(
                Attribute::string_list("ssh_keys")
                    .optional()
                    .validate(validators::namespaced_name())
                    .description(
                        "Key pairs whose public keys must appear in the cloud-init user data",
                    ),
            )
            .attribute(
                Attribute::bool("restart_after_update")
                    .default(bool_value(false))
                    .description("Restart a running virtual machine so updates take effect"),
            )
            .attribute(Attribute::string("node_name").computed())
            .block(
                NestedBlock::list("network_interface", network_interface_block()).min_items(1),
            )
            .block(NestedBlock::list("disk", disk_block()).min_items(1))
            .block(NestedBlock::list("cloudinit", cloudinit_block()).max_items(1))
            .block(NestedBlock::list("input", input_block()))
            .block(
                NestedBlock::list(
                    "tpm",
                    Block::new().attribute(Attribute::string("name").optional()),
                )
                .max_items(1),
            )
            .check(Arc::new(|config| {
                if get_bool_attr(config, "secure_boot", false)
                    && !get_bool_attr(config, "efi", false)
                {
                    return Err("secure_boot requires efi to be enabled".into());
                }
                Ok(())
            }))
            .check(Arc::new(check_disk_sources)),
    )
}

/// Working copy of a VM under construction, plus the claim templates its
/// disks request and the storage class of every referenced image.
struct VmBuilder {
    vm: VirtualMachine,
    claim_templates: Vec<PersistentVolumeClaim>,
    image_classes: BTreeMap<String, String>,
}

impl VmBuilder {
    fn name(&self) -> String {
        self.vm.metadata.name.clone().unwrap_or_default()
    }

    fn namespace(&self) -> String {
        self.vm.metadata.namespace.clone().unwrap_or_default()
    }

    fn template(&mut self) -> &mut VirtualMachineInstanceSpec {
        &mut self.vm.spec.template.spec
    }

    fn limits(&mut self) -> &mut BTreeMap<String, Quantity> {
        &mut self
            .template()
            .domain
            .resources
            .get_or_insert_with(Default::default)
            .limits
    }

    fn efi(&mut self) -> &mut Efi {
        self.template()
            .domain
            .firmware
            .get_or_insert_with(Default::default)
            .bootloader
            .get_or_insert_with(Default::default)
            .efi
            .get_or_insert_with(Default::default)
    }
}

fn parse_interface(b: &mut VmBuilder, v: &Value) -> Result<()> {
    let name = get_string_attr(v, "name");
    let network_name = get_string_attr(v, "network_name");
    let iface_type = match get_string_attr(v, "type") {
        t if !t.is_empty() => t,
        _ if network_name.is_empty() => INTERFACE_TYPE_MASQUERADE.to_string(),
        _ => INTERFACE_TYPE_BRIDGE.to_string(),
    };

    let mut iface = Interface {
        name: name.clone(),
        model: Some(get_string_attr(v, "model")).filter(|m| !m.is_empty()),
        mac_address: Some(get_string_attr(v, "mac_address")).filter(|m| !m.is_empty()),
        ..Default::default()
    };
    if iface_type == INTERFACE_TYPE_BRIDGE {
        iface.bridge = Some(Empty {});
    } else {
        iface.masquerade = Some(Empty {});
    }

    let mut network = Network {
        name,
        ..Default::default()
    };
    if network_name.is_empty() {
        network.pod = Some(Empty {});
    } else {
        network.multus = Some(MultusNetwork {
            network_name: namespaced_name(&network_name, &b.namespace())?,
        });
    }

    let template = b.template();
    template.domain.devices.interfaces.push(iface);
    template.networks.push(network);
    Ok(())
}

fn claim_template(b: &VmBuilder, claim_name: &str, v: &Value) -> Result<PersistentVolumeClaim> {
    let mut annotations = BTreeMap::new();
    let mut storage_class = get_string_attr(v, "storage_class_name");
    let image = get_string_attr(v, "image");
    if !image.is_empty() {
        let (image_ns, image_name) = namespaced_name_parts(&image, &b.namespace())?;
        let image_id = format!("{}/{}", image_ns, image_name);
        if storage_class.is_empty() {
            storage_class = b
                .image_classes
                .get(&image_id)
                .cloned()
                .unwrap_or_else(|| format!("longhorn-{}", image_name));
        }
        annotations.insert(ANNOTATION_IMAGE_ID.to_string(), image_id);
    }

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name.to_string()),
            annotations: Some(annotations).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![get_string_attr(v, "access_mode")]),
            volume_mode: Some(get_string_attr(v, "volume_mode")),
            storage_class_name: Some(storage_class).filter(|s| !s.is_empty()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(get_string_attr(v, "size")),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn parse_disk(b: &mut VmBuilder, v: &Value) -> Result<()> {
    let name = get_string_attr(v, "name");
    let target = DiskTarget {
        bus: Some(get_string_attr(v, "bus")).filter(|s| !s.is_empty()),
    };
    let mut disk = Disk {
        name: name.clone(),
        boot_order: Some(get_int_attr(v, "boot_order", 0)).filter(|n| *n > 0),
        ..Default::default()
    };
    if get_string_attr(v, "type") == DISK_TYPE_CD_ROM {
        disk.cdrom = Some(target);
    } else {
        disk.disk = Some(target);
    }

    let mut volume = Volume {
        name,
        ..Default::default()
    };
    let container_image = get_string_attr(v, "container_image_name");
    let existing = get_string_attr(v, "existing_volume_name");
    if !container_image.is_empty() {
        volume.container_disk = Some(ContainerDiskSource {
            image: container_image,
        });
    } else if !existing.is_empty() {
        volume.persistent_volume_claim = Some(PersistentVolumeClaimSource {
            claim_name: existing,
            hotpluggable: get_bool_attr(v, "hot_plug", false).then_some(true),
        });
    } else {
        let claim_name = match get_string_attr(v, "volume_name") {
            n if n.is_empty() => format!("{}-{}", b.name(), disk.name),
            n => n,
        };
        let template = claim_template(b, &claim_name, v)?;
        b.claim_templates.push(template);
        volume.persistent_volume_claim = Some(PersistentVolumeClaimSource {
            claim_name,
            hotpluggable: None,
        });
    }

    let template = b.template();
    template.domain.devices.disks.push(disk);
    template.volumes.push(volume);
    Ok(())
}

fn parse_cloudinit(b: &mut VmBuilder, v: &Value) -> Result<()> {
    let text = |key: &str| Some(get_string_attr(v, key)).filter(|s| !s.is_empty());
    let secret = |key: &str| text(key).map(|name| LocalObjectReference { name });
    let source = CloudInitSource {
        user_data: text("user_data"),
        user_data_base64: text("user_data_base64"),
        secret_ref: secret("user_data_secret_name"),
        network_data: text("network_data"),
        network_data_base64: text("network_data_base64"),
        network_data_secret_ref: secret("network_data_secret_name"),
    };

    let mut volume = Volume {
        name: CLOUD_INIT_DISK_NAME.to_string(),
        ..Default::default()
    };
    if get_string_attr(v, "type") == CLOUDINIT_TYPE_CONFIG_DRIVE {
        volume.cloud_init_config_drive = Some(source);
    } else {
        volume.cloud_init_no_cloud = Some(source);
    }

    let template = b.template();
    template.domain.devices.disks.push(Disk {
        name: CLOUD_INIT_DISK_NAME.to_string(),
        disk: Some(DiskTarget {
            bus: Some("virtio".to_string()),
        }),
        ..Default::default()
    });
    template.volumes.push(volume);
    Ok(())
}

fn processors<'a>() -> Vec<Processor<'a, VmBuilder>> {
    vec![
        Processor::new("cpu", |b: &mut VmBuilder, v| {
            let cores = as_int(v);
            b.template().domain.cpu = Some(Cpu {
                cores,
                sockets: 1,
                threads: 1,
            });
            b.limits().insert("cpu".into(), Quantity(cores.to_string()));
            Ok(())
        }),
        Processor::new("memory", |b: &mut VmBuilder, v| {
            b.limits().insert("memory".into(), Quantity(as_string(v)));
            Ok(())
        }),
        Processor::new("hostname", |b: &mut VmBuilder, v| {
            b.template().hostname = Some(as_string(v));
            Ok(())
        }),
        Processor::new("machine_type", |b: &mut VmBuilder, v| {
            b.template().domain.machine = Some(Machine { type_: as_string(v) });
            Ok(())
        }),
        Processor::new("run_strategy", |b: &mut VmBuilder, v| {
            b.vm.spec.running = None;
            b.vm.spec.run_strategy = Some(as_string(v));
            Ok(())
        }),
        Processor::new("efi", |b: &mut VmBuilder, _| {
            b.efi();
            Ok(())
        }),
        Processor::new("secure_boot", |b: &mut VmBuilder, _| {
            b.efi().secure_boot = Some(true);
            // Secure boot needs SMM in the guest.
            b.template()
                .domain
                .features
                .get_or_insert_with(Default::default)
                .smm = Some(FeatureState {
                enabled: Some(true),
            });
            Ok(())
        }),
        Processor::new("node_selector", |b: &mut VmBuilder, v| {
            b.template().node_selector = as_string_map(v);
            Ok(())
        }),
        Processor::new("ssh_keys", |b: &mut VmBuilder, v| {
            let namespace = b.namespace();
            let names = as_string_list(v)
                .iter()
                .map(|key| namespaced_name(key, &namespace))
                .collect::<Result<Vec<_>>>()?;
            b.vm.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_SSH_NAMES.into(), serde_json::to_string(&names)?);
            Ok(())
        }),
        Processor::new("network_interface", parse_interface)
            .required()
            .each(),
        Processor::new("disk", parse_disk).required().each(),
        Processor::new("cloudinit", parse_cloudinit).each(),
        Processor::new("input", |b: &mut VmBuilder, v| {
            b.template().domain.devices.inputs.push(Input {
                name: get_string_attr(v, "name"),
                type_: get_string_attr(v, "type"),
                bus: Some(get_string_attr(v, "bus")).filter(|s| !s.is_empty()),
            });
            Ok(())
        })
        .each(),
        Processor::new("tpm", |b: &mut VmBuilder, _| {
            b.template().domain.devices.tpm = Some(Empty {});
            Ok(())
        }),
    ]
}

fn finish(mut b: VmBuilder) -> Result<VirtualMachine> {
    let name = b.name();
    if b.template().domain.devices.interfaces.is_empty() {
        return Err(Error::Validation("network_interface is required".into()));
    }
    if b.template().domain.devices.disks.is_empty() {
        return Err(Error::Validation("disk is required".into()));
    }
    if b.template().hostname.is_none() {
        b.template().hostname = Some(name.clone());
    }

    let annotations = b.vm.metadata.annotations.get_or_insert_with(BTreeMap::new);
    if b.claim_templates.is_empty() {
        annotations.remove(ANNOTATION_VOLUME_CLAIM_TEMPLATES);
    } else {
        annotations.insert(
            ANNOTATION_VOLUME_CLAIM_TEMPLATES.into(),
            serde_json::to_string(&b.claim_templates)?,
        );
    }

    b.vm.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_CREATOR.into(), CREATOR_TERRAFORM.into());
    b.vm.spec
        .template
        .metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(LABEL_VM_NAME.into(), name);
    Ok(b.vm)
}

/// Build a new VM. `image_classes` maps each referenced image ID to the
/// storage class of its volumes.
pub fn build(data: &Value, image_classes: BTreeMap<String, String>) -> Result<VirtualMachine> {
    let mut vm = VirtualMachine::new(&get_string_attr(data, "name"), VirtualMachineSpec::default());
    vm.metadata = new_meta(data);
    construct(&mut vm, data, &metadata_processors())?;

    let mut builder = VmBuilder {
        vm,
        claim_templates: Vec::new(),
        image_classes,
    };
    construct(&mut builder, data, &processors())?;
    finish(builder)
}

/// Rebuild the managed parts of `current`. Host devices and fields the
/// provider does not manage are left alone.
pub fn update(
    current: &VirtualMachine,
    data: &Value,
    image_classes: BTreeMap<String, String>,
) -> Result<VirtualMachine> {
    let mut vm = current.clone();
    reset_managed_metadata(&mut vm.metadata);
    if let Some(annotations) = vm.metadata.annotations.as_mut() {
        annotations.remove(ANNOTATION_SSH_NAMES);
    }

    let template = &mut vm.spec.template.spec;
    template.hostname = None;
    template.node_selector.clear();
    template.networks.clear();
    template.volumes.clear();
    let domain = &mut template.domain;
    domain.cpu = None;
    domain.machine = None;
    if let Some(resources) = domain.resources.as_mut() {
        resources.limits.remove("cpu");
        resources.limits.remove("memory");
    }
    if let Some(firmware) = domain.firmware.as_mut() {
        firmware.bootloader = None;
    }
    if let Some(features) = domain.features.as_mut() {
        features.smm = None;
    }
    domain.devices.disks.clear();
    domain.devices.interfaces.clear();
    domain.devices.inputs.clear();
    domain.devices.tpm = None;

    construct(&mut vm, data, &metadata_processors())?;
    let mut builder = VmBuilder {
        vm,
        claim_templates: Vec::new(),
        image_classes,
    };
    construct(&mut builder, data, &processors())?;
    finish(builder)
}

fn claim_templates(vm: &VirtualMachine) -> Vec<PersistentVolumeClaim> {
    vm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_VOLUME_CLAIM_TEMPLATES))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn ssh_names(vm: &VirtualMachine) -> Vec<String> {
    vm.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_SSH_NAMES))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// First routable address the guest reports on an interface
fn lease_address(iface: &VmiNetworkInterface) -> Option<String> {
    iface
        .ip_address
        .iter()
        .chain(iface.ip_addresses.iter())
        .find(|ip| !ip.is_empty() && !is_link_local(ip))
        .cloned()
}

/// Item of a prior list block with the given name
fn prior_item<'v>(prior: &'v Value, block: &str, name: &str) -> Option<&'v Value> {
    get_list_attr(prior, block)
        .iter()
        .find(|item| get_string_attr(item, "name") == name)
}

/// Keep the configured spelling of a reference that resolves to `actual`.
fn configured_reference(configured: String, actual: &str, namespace: &str) -> String {
    match namespaced_name(&configured, namespace) {
        Ok(resolved) if !configured.is_empty() && resolved == actual => configured,
        _ => actual.to_string(),
    }
}

fn interfaces_state(
    vm: &VirtualMachine,
    vmi: Option<&VirtualMachineInstance>,
    prior: &Value,
) -> Vec<Value> {
    let namespace = vm.metadata.namespace.clone().unwrap_or_default();
    let template = &vm.spec.template.spec;
    let statuses = vmi
        .and_then(|vmi| vmi.status.as_ref())
        .map(|s| s.interfaces.as_slice())
        .unwrap_or(&[]);

    template
        .domain
        .devices
        .interfaces
        .iter()
        .map(|iface| {
            let prior = prior_item(prior, "network_interface", &iface.name);
            let status = statuses.iter().find(|s| s.name == iface.name);
            let network_name = template
                .networks
                .iter()
                .find(|n| n.name == iface.name)
                .and_then(|n| n.multus.as_ref())
                .map(|m| {
                    configured_reference(
                        prior.map(|p| get_string_attr(p, "network_name")).unwrap_or_default(),
                        &m.network_name,
                        &namespace,
                    )
                });
            let iface_type = if iface.bridge.is_some() {
                INTERFACE_TYPE_BRIDGE
            } else {
                INTERFACE_TYPE_MASQUERADE
            };
            let mac = iface
                .mac_address
                .clone()
                .or_else(|| status.and_then(|s| s.mac.clone()));

            make_state(vec![
                ("name", string_value(&iface.name)),
                ("type", string_value(iface_type)),
                ("model", optional_string_value(iface.model.clone())),
                ("mac_address", optional_string_value(mac)),
                ("network_name", optional_string_value(network_name)),
                (
                    "wait_for_lease",
                    bool_value(
                        prior
                            .map(|p| get_bool_attr(p, "wait_for_lease", false))
                            .unwrap_or(false),
                    ),
                ),
                (
                    "ip_address",
                    string_value(status.and_then(lease_address).unwrap_or_default()),
                ),
                (
                    "interface_name",
                    string_value(
                        status
                            .and_then(|s| s.interface_name.clone())
                            .unwrap_or_default(),
                    ),
                ),
            ])
        })
        .collect()
}

fn disks_state(vm: &VirtualMachine, prior: &Value) -> Vec<Value> {
    let namespace = vm.metadata.namespace.clone().unwrap_or_default();
    let template = &vm.spec.template.spec;
    let claims = claim_templates(vm);

    template
        .domain
        .devices
        .disks
        .iter()
        .filter(|d| d.name != CLOUD_INIT_DISK_NAME)
        .map(|disk| {
            let prior = prior_item(prior, "disk", &disk.name);
            let volume = template.volumes.iter().find(|v| v.name == disk.name);
            let (disk_type, target) = match (&disk.cdrom, &disk.disk) {
                (Some(t), _) => (DISK_TYPE_CD_ROM, t.clone()),
                (None, t) => (DISK_TYPE_DISK, t.clone().unwrap_or_default()),
            };

            let mut item = make_state(vec![
                ("name", string_value(&disk.name)),
                ("type", string_value(disk_type)),
                ("bus", optional_string_value(target.bus)),
                (
                    "boot_order",
                    disk.boot_order.map(int_value).unwrap_or(Value::Null),
                ),
                (
                    "auto_delete",
                    bool_value(
                        prior
                            .map(|p| get_bool_attr(p, "auto_delete", true))
                            .unwrap_or(true),
                    ),
                ),
                ("hot_plug", bool_value(false)),
                ("size", Value::Null),
                ("image", Value::Null),
                ("existing_volume_name", Value::Null),
                ("container_image_name", Value::Null),
                ("storage_class_name", Value::Null),
                ("volume_mode", Value::Null),
                ("access_mode", Value::Null),
                ("volume_name", Value::Null),
            ]);

            if let Some(container) = volume.and_then(|v| v.container_disk.as_ref()) {
                item.set("container_image_name", string_value(&container.image));
            }
            if let Some(pvc) = volume.and_then(|v| v.persistent_volume_claim.as_ref()) {
                item.set("volume_name", string_value(&pvc.claim_name));
                match claims
                    .iter()
                    .find(|c| c.metadata.name.as_deref() == Some(pvc.claim_name.as_str()))
                {
                    Some(claim) => {
                        let spec = claim.spec.clone().unwrap_or_default();
                        item.set("size", string_value(super::volume::size(claim)));
                        item.set(
                            "storage_class_name",
                            optional_string_value(spec.storage_class_name),
                        );
                        item.set("volume_mode", optional_string_value(spec.volume_mode));
                        item.set(
                            "access_mode",
                            optional_string_value(
                                spec.access_modes.unwrap_or_default().into_iter().next(),
                            ),
                        );
                        if let Some(image) = claim
                            .metadata
                            .annotations
                            .as_ref()
                            .and_then(|a| a.get(ANNOTATION_IMAGE_ID))
                        {
                            let configured =
                                prior.map(|p| get_string_attr(p, "image")).unwrap_or_default();
                            item.set(
                                "image",
                                string_value(configured_reference(configured, image, &namespace)),
                            );
                        }
                    }
                    None => {
                        item.set("existing_volume_name", string_value(&pvc.claim_name));
                        item.set("hot_plug", bool_value(pvc.hotpluggable.unwrap_or(false)));
                    }
                }
            }
            item
        })
        .collect()
}

fn cloudinit_state(vm: &VirtualMachine) -> Vec<Value> {
    let template = &vm.spec.template.spec;
    let Some(volume) = template.volumes.iter().find(|v| v.name == CLOUD_INIT_DISK_NAME) else {
        return Vec::new();
    };
    let sources = (&volume.cloud_init_config_drive, &volume.cloud_init_no_cloud);
    let (cloudinit_type, source) = match sources {
        (Some(s), _) => (CLOUDINIT_TYPE_CONFIG_DRIVE, s.clone()),
        (None, Some(s)) => (CLOUDINIT_TYPE_NO_CLOUD, s.clone()),
        (None, None) => return Vec::new(),
    };
    vec![make_state(vec![
        ("type", string_value(cloudinit_type)),
        ("user_data", optional_string_value(source.user_data)),
        ("user_data_base64", optional_string_value(source.user_data_base64)),
        (
            "user_data_secret_name",
            optional_string_value(source.secret_ref.map(|r| r.name)),
        ),
        ("network_data", optional_string_value(source.network_data)),
        ("network_data_base64", optional_string_value(source.network_data_base64)),
        (
            "network_data_secret_name",
            optional_string_value(source.network_data_secret_ref.map(|r| r.name)),
        ),
    ])]
}

fn vm_state(vm: &VirtualMachine) -> (String, String) {
    let status = vm.status.clone().unwrap_or_default();
    let message = status.printable_status.clone().unwrap_or_default();
    if let Some(failure) = status
        .conditions
        .iter()
        .find(|c| c.type_ == "Failure" && c.is_true())
    {
        return (STATE_FAILED.into(), failure.message.clone().unwrap_or(message));
    }
    if status.ready {
        return (STATE_ACTIVE.into(), message);
    }
    if vm.spec.run_strategy.as_deref() == Some(RUN_STRATEGY_HALTED) {
        return (STATE_OFF.into(), message);
    }
    (STATE_IN_PROGRESS.into(), message)
}

/// `prior` supplies the settings that exist only in configuration:
/// `wait_for_lease`, `auto_delete` and `restart_after_update`.
pub fn to_state(vm: &VirtualMachine, vmi: Option<&VirtualMachineInstance>, prior: &Value) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_VIRTUAL_MACHINE, &vm.metadata);
    let template = &vm.spec.template.spec;
    let domain = &template.domain;
    let limits = domain
        .resources
        .as_ref()
        .map(|r| r.limits.clone())
        .unwrap_or_default();
    let memory = limits
        .get("memory")
        .map(|q| q.0.clone())
        .or_else(|| domain.memory.as_ref().and_then(|m| m.guest.as_ref()).map(|q| q.0.clone()));
    let efi = domain
        .firmware
        .as_ref()
        .and_then(|f| f.bootloader.as_ref())
        .and_then(|b| b.efi.as_ref());
    let node_selector = if template.node_selector.is_empty() {
        Value::Null
    } else {
        string_map_value(&template.node_selector)
    };
    let ssh_keys = match ssh_names(vm) {
        names if names.is_empty() => Value::Null,
        names => {
            let namespace = vm.metadata.namespace.clone().unwrap_or_default();
            let configured = get_string_list_attr(prior, "ssh_keys");
            string_list_value(names.iter().enumerate().map(|(i, actual)| {
                let wanted = configured.get(i).cloned().unwrap_or_default();
                configured_reference(wanted, actual, &namespace)
            }))
        }
    };
    let node_name = vmi
        .and_then(|vmi| vmi.status.as_ref())
        .and_then(|s| s.node_name.clone())
        .unwrap_or_default();
    let (state, message) = vm_state(vm);

    importer
        .set("cpu", int_value(domain.cpu.as_ref().map(|c| c.cores).unwrap_or(1)))
        .set("memory", optional_string_value(memory))
        .set("hostname", optional_string_value(template.hostname.clone()))
        .set(
            "machine_type",
            optional_string_value(domain.machine.as_ref().map(|m| m.type_.clone())),
        )
        .set(
            "run_strategy",
            string_value(
                vm.spec
                    .run_strategy
                    .clone()
                    .unwrap_or_else(|| RUN_STRATEGY_RERUN_ON_FAILURE.into()),
            ),
        )
        .set("efi", bool_value(efi.is_some()))
        .set(
            "secure_boot",
            bool_value(efi.and_then(|e| e.secure_boot).unwrap_or(false)),
        )
        .set("node_selector", node_selector)
        .set("ssh_keys", ssh_keys)
        .set(
            "restart_after_update",
            bool_value(get_bool_attr(prior, "restart_after_update", false)),
        )
        .set("node_name", string_value(node_name))
        .set("network_interface", list_value(interfaces_state(vm, vmi, prior)))
        .set("disk", list_value(disks_state(vm, prior)))
        .set("cloudinit", list_value(cloudinit_state(vm)))
        .set(
            "input",
            list_value(
                domain
                    .devices
                    .inputs
                    .iter()
                    .map(|input| {
                        make_state(vec![
                            ("name", string_value(&input.name)),
                            ("type", string_value(&input.type_)),
                            ("bus", optional_string_value(input.bus.clone())),
                        ])
                    })
                    .collect(),
            ),
        )
        .set(
            "tpm",
            list_value(
                domain
                    .devices
                    .tpm
                    .iter()
                    .map(|_| {
                        let name = get_list_attr(prior, "tpm")
                            .first()
                            .map(|t| get_string_attr(t, "name"));
                        let name = name.filter(|n| !n.is_empty());
                        make_state(vec![("name", optional_string_value(name))])
                    })
                    .collect(),
            ),
        )
        .set_state(&state, &message);
    importer.into_state()
}

pub struct VirtualMachineResource {
    vms: Arc<dyn ObjectApi<VirtualMachine>>,
    vmis: Arc<dyn ObjectApi<VirtualMachineInstance>>,
    images: Arc<dyn ObjectApi<VirtualMachineImage>>,
    keypairs: Arc<dyn ObjectApi<KeyPair>>,
    secrets: Arc<dyn ObjectApi<Secret>>,
    timeouts: Timeouts,
}

impl VirtualMachineResource {
    pub fn new(
        vms: Arc<dyn ObjectApi<VirtualMachine>>,
        vmis: Arc<dyn ObjectApi<VirtualMachineInstance>>,
        images: Arc<dyn ObjectApi<VirtualMachineImage>>,
        keypairs: Arc<dyn ObjectApi<KeyPair>>,
        secrets: Arc<dyn ObjectApi<Secret>>,
    ) -> Self {
        Self {
            vms,
            vmis,
            images,
            keypairs,
            secrets,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Storage class of every image the disks reference
    async fn image_classes(
        &self,
        namespace: &str,
        data: &Value,
    ) -> Result<BTreeMap<String, String>> {
        let mut classes = BTreeMap::new();
        for disk in get_list_attr(data, "disk") {
            let image = get_string_attr(disk, "image");
            if image.is_empty() {
                continue;
            }
            let (image_ns, image_name) = namespaced_name_parts(&image, namespace)?;
            let id = format!("{}/{}", image_ns, image_name);
            if classes.contains_key(&id) {
                continue;
            }
            let found = self
                .images
                .get(&image_ns, &image_name)
                .await?
                .ok_or_else(|| Error::not_found("VirtualMachineImage", &id))?;
            classes.insert(id, image_storage_class(&found));
        }
        Ok(classes)
    }

    /// Cloud-init user data as the guest will see it
    async fn user_data(&self, namespace: &str, data: &Value) -> Result<String> {
        let Some(cloudinit) = get_list_attr(data, "cloudinit").first() else {
            return Ok(String::new());
        };
        let encoded = get_string_attr(cloudinit, "user_data_base64");
        if !encoded.is_empty() {
            let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        let secret_name = get_string_attr(cloudinit, "user_data_secret_name");
        if !secret_name.is_empty() {
            let secret = self
                .secrets
                .get(namespace, &secret_name)
                .await?
                .ok_or_else(|| {
                    Error::not_found("Secret", format!("{}/{}", namespace, secret_name))
                })?;
            let bytes = secret
                .data
                .as_ref()
                .and_then(|d| d.get(SECRET_KEY_USER_DATA))
                .map(|b| b.0.clone())
                .unwrap_or_default();
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        Ok(get_string_attr(cloudinit, "user_data"))
    }

    /// Every key pair in `ssh_keys` must be authorized by the user data.
    async fn check_ssh_keys(&self, namespace: &str, data: &Value) -> Result<()> {
        let keys = get_string_list_attr(data, "ssh_keys");
        if keys.is_empty() {
            return Ok(());
        }
        let mut refs = Vec::with_capacity(keys.len());
        for key in keys {
            let (key_ns, key_name) = namespaced_name_parts(&key, namespace)?;
            let id = format!("{}/{}", key_ns, key_name);
            let keypair = self
                .keypairs
                .get(&key_ns, &key_name)
                .await?
                .ok_or_else(|| Error::not_found("KeyPair", &id))?;
            refs.push(KeyPairRef {
                namespaced_name: id,
                public_key: keypair.spec.public_key,
            });
        }
        let user_data = self.user_data(namespace, data).await?;
        check_keypairs_in_user_data(&user_data, &refs)
    }

    /// Wait until every interface with `wait_for_lease` reports a routable
    /// address, then return the instance.
    /// Wait for a DHCP lease on every interface with `wait_for_lease`.
    /// `replaced` is the UID of an instance being restarted away; its
    /// addresses are stale and do not count.
    async fn wait_for_leases(
        &self,
        namespace: &str,
        name: &str,
        data: &Value,
        replaced: Option<&str>,
    ) -> Result<Option<VirtualMachineInstance>> {
        let waiting: BTreeSet<String> = get_list_attr(data, "network_interface")
            .iter()
            .filter(|i| get_bool_attr(i, "wait_for_lease", false))
            .map(|i| get_string_attr(i, "name"))
            .collect();
        if waiting.is_empty() {
            return self.vmis.get(namespace, name).await;
        }

        let wait = self
            .timeouts
            .wait(
                format!("virtual machine {}/{} to get an IP address", namespace, name),
                self.timeouts.create,
            )
            .pending(&[STATE_IN_PROGRESS])
            .target(&[STATE_ACTIVE]);
        let vmis = &self.vmis;
        let waiting = &waiting;
        wait_for_state(&wait, || async move {
            let vmi = vmis
                .get(namespace, name)
                .await?
                .filter(|vmi| replaced.is_none() || vmi.metadata.uid.as_deref() != replaced);
            let leased = vmi
                .as_ref()
                .and_then(|vmi| vmi.status.as_ref())
                .map(|status| {
                    waiting.iter().all(|iface| {
                        status
                            .interfaces
                            .iter()
                            .any(|s| &s.name == iface && lease_address(s).is_some())
                    })
                })
                .unwrap_or(false);
            let state = if leased { STATE_ACTIVE } else { STATE_IN_PROGRESS };
            Ok((vmi, state.to_string()))
        })
        .await
    }
}

#[async_trait]
impl Resource for VirtualMachineResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating virtual machine {}/{}", namespace, name);

        let vm = build(planned, self.image_classes(&namespace, planned).await?)?;
        self.check_ssh_keys(&namespace, planned).await?;
        let created = self.vms.create(&namespace, &vm).await?;
        let vmi = self.wait_for_leases(&namespace, &name, planned, None).await?;
        Ok(to_state(&created, vmi.as_ref(), planned))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        let Some(vm) = self.vms.get(&namespace, &name).await? else {
            return Ok(None);
        };
        let vmi = self.vmis.get(&namespace, &name).await?;
        Ok(Some(to_state(&vm, vmi.as_ref(), state)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating virtual machine {}/{}", namespace, name);
        let current = self.vms.get(&namespace, &name).await?.ok_or_else(|| {
            Error::not_found("VirtualMachine", format!("{}/{}", namespace, name))
        })?;

        let vm = update(&current, planned, self.image_classes(&namespace, planned).await?)?;
        self.check_ssh_keys(&namespace, planned).await?;
        let updated = self.vms.replace(&namespace, &name, &vm).await?;

        // The controller starts a fresh instance from the new template.
        let mut replaced = None;
        if get_bool_attr(planned, "restart_after_update", false)
            && updated.spec.run_strategy.as_deref() != Some(RUN_STRATEGY_HALTED)
        {
            if let Some(vmi) = self.vmis.get(&namespace, &name).await? {
                if self.vmis.delete(&namespace, &name).await? {
                    debug!("restarting virtual machine {}/{}", namespace, name);
                    replaced = vmi.metadata.uid;
                }
            }
        }

        let vmi = self
            .wait_for_leases(&namespace, &name, planned, replaced.as_deref())
            .await?;
        Ok(to_state(&updated, vmi.as_ref(), planned))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting virtual machine {}/{}", namespace, name);
        let Some(mut vm) = self.vms.get(&namespace, &name).await? else {
            warn!("virtual machine {}/{} already deleted", namespace, name);
            return Ok(());
        };

        // Harvester removes the claims listed here along with the VM.
        let removed: Vec<String> = vm
            .spec
            .template
            .spec
            .volumes
            .iter()
            .filter_map(|v| {
                let claim = v.persistent_volume_claim.as_ref()?;
                let auto_delete = prior_item(prior, "disk", &v.name)
                    .map(|d| get_bool_attr(d, "auto_delete", true))
                    .unwrap_or(true);
                auto_delete.then(|| claim.claim_name.clone())
            })
            .collect();
        if !removed.is_empty() {
            vm.metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_REMOVED_PVCS.into(), removed.join(","));
            self.vms.replace(&namespace, &name, &vm).await?;
        }

        if !self.vms.delete(&namespace, &name).await? {
            return Ok(());
        }
        let wait = self
            .timeouts
            .wait(
                format!("virtual machine {}/{} to be removed", namespace, name),
                self.timeouts.delete,
            )
            .pending(&[STATE_REMOVING])
            .target(&[STATE_REMOVED]);
        let vms = &self.vms;
        let (namespace, name) = (namespace.as_str(), name.as_str());
        wait_for_state(&wait, || async move {
            let state = match vms.get(namespace, name).await? {
                Some(_) => STATE_REMOVING,
                None => STATE_REMOVED,
            };
            Ok(((), state.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use harvester_common::api::keypair::KeyPairSpec;
    use k8s_openapi::ByteString;
    use parking_lot::Mutex;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOp alice@laptop";

    fn interface(name: &str, network: &str) -> Value {
        make_state(vec![
            ("name", string_value(name)),
            ("model", string_value("virtio")),
            ("network_name", string_value(network)),
            ("wait_for_lease", bool_value(false)),
        ])
    }

    fn disk(name: &str, image: &str) -> Value {
        make_state(vec![
            ("name", string_value(name)),
            ("type", string_value(DISK_TYPE_DISK)),
            ("size", string_value("20Gi")),
            ("bus", string_value("virtio")),
            ("boot_order", int_value(1)),
            ("image", string_value(image)),
            ("volume_mode", string_value("Block")),
            ("access_mode", string_value("ReadWriteMany")),
            ("auto_delete", bool_value(true)),
            ("hot_plug", bool_value(false)),
        ])
    }

    fn planned() -> Value {
        make_state(vec![
            ("name", string_value("web")),
            ("namespace", string_value("default")),
            ("cpu", int_value(2)),
            ("memory", string_value("1Gi")),
            ("run_strategy", string_value(RUN_STRATEGY_RERUN_ON_FAILURE)),
            ("efi", bool_value(false)),
            ("secure_boot", bool_value(false)),
            (
                "network_interface",
                list_value(vec![interface("nic-1", "default/vlan10")]),
            ),
            ("disk", list_value(vec![disk("rootdisk", "default/ubuntu")])),
            (
                "cloudinit",
                list_value(vec![make_state(vec![
                    ("type", string_value(CLOUDINIT_TYPE_NO_CLOUD)),
                    ("user_data", string_value("#cloud-config\npassword: secret\n")),
                ])]),
            ),
        ])
    }

    fn image_classes() -> BTreeMap<String, String> {
        BTreeMap::from([("default/ubuntu".to_string(), "longhorn-ubuntu-sc".to_string())])
    }

    fn keypair() -> KeyPair {
        let mut keypair = KeyPair::new("alice", KeyPairSpec {
            public_key: KEY.into(),
        });
        keypair.metadata.namespace = Some("default".into());
        keypair
    }

    fn image() -> VirtualMachineImage {
        let mut image = VirtualMachineImage::new("ubuntu", Default::default());
        image.metadata.namespace = Some("default".into());
        image
    }

    struct Fixture {
        vms: Arc<MemoryApi<VirtualMachine>>,
        vmis: Arc<MemoryApi<VirtualMachineInstance>>,
        resource: VirtualMachineResource,
    }

    fn fixture(vms: MemoryApi<VirtualMachine>) -> Fixture {
        fixture_with(vms, MemoryApi::new())
    }

    fn fixture_with(
        vms: MemoryApi<VirtualMachine>,
        vmis: MemoryApi<VirtualMachineInstance>,
    ) -> Fixture {
        let vms = vms.arc();
        let vmis = vmis.arc();
        let images = MemoryApi::<VirtualMachineImage>::new().arc();
        images.insert(image());
        let keypairs = MemoryApi::<KeyPair>::new().arc();
        keypairs.insert(keypair());
        let secrets = MemoryApi::<Secret>::new().arc();
        let mut secret = Secret::default();
        secret.metadata.name = Some("web-cloudinit".into());
        secret.metadata.namespace = Some("default".into());
        secret.data = Some(BTreeMap::from([(
            SECRET_KEY_USER_DATA.to_string(),
            ByteString(format!("ssh_authorized_keys:\n  - {}\n", KEY).into_bytes()),
        )]));
        secrets.insert(secret);

        let resource = VirtualMachineResource::new(
            vms.clone(),
            vmis.clone(),
            images,
            keypairs,
            secrets,
        )
        .with_timeouts(Timeouts::fast());
        Fixture { vms, vmis, resource }
    }

    fn running_vmi(addresses: &[&str]) -> VirtualMachineInstance {
        let mut vmi = VirtualMachineInstance::new("web", Default::default());
        vmi.metadata.namespace = Some("default".into());
        vmi.status = Some(VirtualMachineInstanceStatus {
            phase: Some(VMI_PHASE_RUNNING.into()),
            node_name: Some("node-1".into()),
            interfaces: vec![VmiNetworkInterface {
                name: "nic-1".into(),
                ip_addresses: addresses.iter().map(|a| a.to_string()).collect(),
                interface_name: Some("enp1s0".into()),
                ..Default::default()
            }],
        });
        vmi
    }

    #[test]
    fn test_build_round_trip() {
        let vm = build(&planned(), image_classes()).unwrap();
        let template = &vm.spec.template.spec;
        assert_eq!(template.domain.cpu.as_ref().unwrap().cores, 2);
        assert_eq!(template.hostname.as_deref(), Some("web"));
        assert_eq!(
            template.networks[0].multus.as_ref().unwrap().network_name,
            "default/vlan10"
        );
        assert!(template.domain.devices.interfaces[0].bridge.is_some());
        assert_eq!(template.volumes.len(), 2);
        assert_eq!(
            vm.spec.template.metadata.labels.as_ref().unwrap()[LABEL_VM_NAME],
            "web"
        );

        let state = to_state(&vm, None, &planned());
        for key in ["name", "namespace", "cpu", "memory", "run_strategy", "efi", "secure_boot"] {
            assert_eq!(state.get(key), planned().get(key), "{}", key);
        }
        let cloudinit = &get_list_attr(&state, "cloudinit")[0];
        assert_eq!(
            get_string_attr(cloudinit, "user_data"),
            "#cloud-config\npassword: secret\n"
        );
        assert!(cloudinit.get("user_data_secret_name").unwrap().is_null());
        let nic = &get_list_attr(&state, "network_interface")[0];
        assert_eq!(get_string_attr(nic, "network_name"), "default/vlan10");
        assert_eq!(get_string_attr(nic, "type"), INTERFACE_TYPE_BRIDGE);

        let root = &get_list_attr(&state, "disk")[0];
        let keys = [
            "name",
            "type",
            "size",
            "bus",
            "boot_order",
            "image",
            "volume_mode",
            "access_mode",
        ];
        for key in keys {
            assert_eq!(root.get(key), disk("rootdisk", "default/ubuntu").get(key), "{}", key);
        }
        assert_eq!(get_string_attr(root, "volume_name"), "web-rootdisk");
        assert_eq!(get_string_attr(root, "storage_class_name"), "longhorn-ubuntu-sc");
    }

    #[test]
    fn test_claim_templates_annotation() {
        let vm = build(&planned(), image_classes()).unwrap();
        let claims = claim_templates(&vm);
        assert_eq!(claims.len(), 1);
        let claim = &claims[0];
        assert_eq!(claim.metadata.name.as_deref(), Some("web-rootdisk"));
        assert_eq!(
            claim.metadata.annotations.as_ref().unwrap()[ANNOTATION_IMAGE_ID],
            "default/ubuntu"
        );
        assert_eq!(super::super::volume::size(claim), "20Gi");
    }

    #[test]
    fn test_pod_network_and_container_disk() {
        let mut data = planned();
        data.set("network_interface", list_value(vec![interface("default", "")]));
        let mut cd = disk("installer", "");
        cd.set("type", string_value(DISK_TYPE_CD_ROM));
        cd.set("container_image_name", string_value("quay.io/containerdisks/fedora:39"));
        data.set("disk", list_value(vec![cd]));

        let vm = build(&data, BTreeMap::new()).unwrap();
        let template = &vm.spec.template.spec;
        assert!(template.networks[0].pod.is_some());
        assert!(template.domain.devices.interfaces[0].masquerade.is_some());
        assert!(template.domain.devices.disks[0].cdrom.is_some());
        assert!(claim_templates(&vm).is_empty());

        let state = to_state(&vm, None, &data);
        let installer = &get_list_attr(&state, "disk")[0];
        assert_eq!(
            get_string_attr(installer, "container_image_name"),
            "quay.io/containerdisks/fedora:39"
        );
        assert!(installer.get("size").unwrap().is_null());
    }

    #[test]
    fn test_efi_and_secure_boot() {
        let mut data = planned();
        data.set("secure_boot", bool_value(true));
        let diags = schema().block.validate(&data);
        assert!(diags.iter().any(|d| d.detail.contains("secure_boot requires efi")
            || d.summary.contains("secure_boot requires efi")));

        data.set("efi", bool_value(true));
        let vm = build(&data, image_classes()).unwrap();
        let domain = &vm.spec.template.spec.domain;
        assert_eq!(domain.features.as_ref().unwrap().smm.as_ref().unwrap().enabled, Some(true));
        let state = to_state(&vm, None, &data);
        assert_eq!(state.get("efi"), Some(&bool_value(true)));
        assert_eq!(state.get("secure_boot"), Some(&bool_value(true)));
    }

    #[test]
    fn test_disk_with_two_sources_rejected() {
        let mut data = planned();
        let mut both = disk("rootdisk", "default/ubuntu");
        both.set("existing_volume_name", string_value("data"));
        data.set("disk", list_value(vec![both]));
        assert!(!schema().block.validate(&data).is_empty());
    }

    #[tokio::test]
    async fn test_ssh_key_must_be_in_user_data() {
        let f = fixture(MemoryApi::new());
        let mut data = planned();
        data.set("ssh_keys", string_list_value(["alice"]));
        let err = f.resource.create(&data).await.unwrap_err();
        assert!(matches!(
            err,
            Error::KeyPairsNotInUserData(ref names) if names == &vec!["default/alice".to_string()]
        ));
        assert_eq!(f.vms.len(), 0);

        data.set(
            "cloudinit",
            list_value(vec![make_state(vec![
                ("type", string_value(CLOUDINIT_TYPE_NO_CLOUD)),
                ("user_data_secret_name", string_value("web-cloudinit")),
            ])]),
        );
        let state = f.resource.create(&data).await.unwrap();
        assert_eq!(state.get("ssh_keys"), Some(&string_list_value(["alice"])));
        let stored = f.vms.stored("default", "web").unwrap();
        assert_eq!(
            stored.metadata.annotations.unwrap()[ANNOTATION_SSH_NAMES],
            r#"["default/alice"]"#
        );
    }

    #[tokio::test]
    async fn test_memory_update_reflected_in_state() {
        let f = fixture(MemoryApi::new());
        let prior = f.resource.create(&planned()).await.unwrap();
        assert_eq!(get_string_attr(&prior, "memory"), "1Gi");

        let mut changed = prior.clone();
        changed.set("memory", string_value("2Gi"));
        let state = f.resource.update(&prior, &changed).await.unwrap();
        assert_eq!(get_string_attr(&state, "memory"), "2Gi");
        let read = f.resource.read(&state).await.unwrap().unwrap();
        assert_eq!(get_string_attr(&read, "memory"), "2Gi");
    }

    #[tokio::test]
    async fn test_update_replaces_disks_and_keeps_host_devices() {
        let f = fixture(MemoryApi::new());
        let prior = f.resource.create(&planned()).await.unwrap();
        let mut stored = f.vms.stored("default", "web").unwrap();
        stored.spec.template.spec.domain.devices.host_devices.push(HostDevice {
            name: "node-1-000001000".into(),
            device_name: "nvidia.com/GA102".into(),
        });
        f.vms.insert(stored);

        let mut changed = prior.clone();
        let mut data_disk = disk("data", "");
        data_disk.set("existing_volume_name", string_value("shared"));
        data_disk.set("hot_plug", bool_value(true));
        changed.set("disk", list_value(vec![data_disk]));
        changed.set("cloudinit", list_value(vec![]));
        let state = f.resource.update(&prior, &changed).await.unwrap();

        let stored = f.vms.stored("default", "web").unwrap();
        let template = &stored.spec.template.spec;
        assert_eq!(template.volumes.len(), 1);
        assert_eq!(template.domain.devices.disks[0].name, "data");
        assert_eq!(template.domain.devices.host_devices.len(), 1);
        assert!(claim_templates(&stored).is_empty());

        let data = &get_list_attr(&state, "disk")[0];
        assert_eq!(get_string_attr(data, "existing_volume_name"), "shared");
        assert_eq!(data.get("hot_plug"), Some(&bool_value(true)));
        assert!(get_list_attr(&state, "cloudinit").is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_lease_skips_link_local() {
        let f = fixture(MemoryApi::new());
        f.vmis.insert(running_vmi(&["fe80::5054:ff:fe12:3456", "10.0.0.15"]));
        let mut data = planned();
        let mut nic = interface("nic-1", "default/vlan10");
        nic.set("wait_for_lease", bool_value(true));
        data.set("network_interface", list_value(vec![nic]));

        let state = f.resource.create(&data).await.unwrap();
        assert_eq!(get_string_attr(&state, "node_name"), "node-1");
        let nic = &get_list_attr(&state, "network_interface")[0];
        assert_eq!(get_string_attr(nic, "ip_address"), "10.0.0.15");
        assert_eq!(get_string_attr(nic, "interface_name"), "enp1s0");
        assert_eq!(nic.get("wait_for_lease"), Some(&bool_value(true)));
    }

    #[tokio::test]
    async fn test_wait_for_lease_times_out() {
        let f = fixture(MemoryApi::new());
        f.vmis.insert(running_vmi(&["169.254.10.1"]));
        let mut data = planned();
        let mut nic = interface("nic-1", "default/vlan10");
        nic.set("wait_for_lease", bool_value(true));
        data.set("network_interface", list_value(vec![nic]));

        let err = f.resource.create(&data).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_image_rejected() {
        let f = fixture(MemoryApi::new());
        let mut data = planned();
        data.set("disk", list_value(vec![disk("rootdisk", "default/debian")]));
        assert!(f.resource.create(&data).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_delete_marks_auto_delete_volumes() {
        let removed = Arc::new(Mutex::new(None::<String>));
        let seen = removed.clone();
        let f = fixture(MemoryApi::new().on_write(move |vm: &mut VirtualMachine| {
            if let Some(value) = vm
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_REMOVED_PVCS))
            {
                *seen.lock() = Some(value.clone());
            }
        }));

        let mut data = planned();
        let mut kept = disk("data", "");
        kept.set("auto_delete", bool_value(false));
        data.set(
            "disk",
            list_value(vec![disk("rootdisk", "default/ubuntu"), kept]),
        );
        let state = f.resource.create(&data).await.unwrap();

        f.resource.delete(&state).await.unwrap();
        assert_eq!(removed.lock().as_deref(), Some("web-rootdisk"));
        assert_eq!(f.vms.len(), 0);
        assert!(f.resource.read(&state).await.unwrap().is_none());
        f.resource.delete(&state).await.unwrap();
    }

    fn leasing(data: &Value) -> Value {
        let mut data = data.clone();
        let mut nic = interface("nic-1", "default/vlan10");
        nic.set("wait_for_lease", bool_value(true));
        data.set("network_interface", list_value(vec![nic]));
        data
    }

    #[tokio::test]
    async fn test_restart_waits_for_new_instance_lease() {
        // The old instance stays visible for a while after it is deleted.
        let vmis = MemoryApi::new().linger(2).on_delete(|_: &VirtualMachineInstance| {
            let mut vmi = running_vmi(&["10.0.0.20"]);
            vmi.metadata.uid = Some("vmi-2".into());
            vmi
        });
        let f = fixture_with(MemoryApi::new(), vmis);
        let mut old = running_vmi(&["10.0.0.15"]);
        old.metadata.uid = Some("vmi-1".into());
        f.vmis.insert(old);

        let data = leasing(&planned());
        let state = f.resource.create(&data).await.unwrap();
        let nic = &get_list_attr(&state, "network_interface")[0];
        assert_eq!(get_string_attr(nic, "ip_address"), "10.0.0.15");

        let mut changed = data.clone();
        changed.set("memory", string_value("2Gi"));
        changed.set("restart_after_update", bool_value(true));
        let state = f.resource.update(&state, &changed).await.unwrap();
        let nic = &get_list_attr(&state, "network_interface")[0];
        assert_eq!(get_string_attr(nic, "ip_address"), "10.0.0.20");
        assert_eq!(f.vmis.terminating(), 0);
        assert_eq!(
            f.vmis.stored("default", "web").unwrap().metadata.uid.as_deref(),
            Some("vmi-2")
        );
    }

    #[tokio::test]
    async fn test_delete_waits_until_gone() {
        let f = fixture(MemoryApi::new().linger(3));
        let state = f.resource.create(&planned()).await.unwrap();

        f.resource.delete(&state).await.unwrap();
        assert_eq!(f.vms.terminating(), 0);
        assert!(f.resource.read(&state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_times_out_while_terminating() {
        let f = fixture(MemoryApi::new().linger(usize::MAX));
        let state = f.resource.create(&planned()).await.unwrap();

        let err = f.resource.delete(&state).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }), "{}", err);
        assert_eq!(f.vms.terminating(), 1);
    }
}
