//! Well-known names shared between the API types and the provider

pub const DEFAULT_NAMESPACE: &str = "default";

// Terraform resource type names
pub const RESOURCE_TYPE_BOOTSTRAP: &str = "harvester_bootstrap";
pub const RESOURCE_TYPE_IMAGE: &str = "harvester_image";
pub const RESOURCE_TYPE_SSH_KEY: &str = "harvester_ssh_key";
pub const RESOURCE_TYPE_NETWORK: &str = "harvester_network";
pub const RESOURCE_TYPE_VIRTUAL_MACHINE: &str = "harvester_virtualmachine";
pub const RESOURCE_TYPE_VOLUME: &str = "harvester_volume";
pub const RESOURCE_TYPE_CLUSTER_NETWORK: &str = "harvester_clusternetwork";
pub const RESOURCE_TYPE_VLAN_CONFIG: &str = "harvester_vlanconfig";
pub const RESOURCE_TYPE_SETTING: &str = "harvester_setting";
pub const RESOURCE_TYPE_STORAGE_CLASS: &str = "harvester_storageclass";
pub const RESOURCE_TYPE_IP_POOL: &str = "harvester_ippool";
pub const RESOURCE_TYPE_LOAD_BALANCER: &str = "harvester_loadbalancer";
pub const RESOURCE_TYPE_CLOUDINIT_SECRET: &str = "harvester_cloudinit_secret";
pub const RESOURCE_TYPE_SCHEDULE_BACKUP: &str = "harvester_schedule_backup";
pub const RESOURCE_TYPE_VOLUME_BACKUP: &str = "harvester_volume_backup";
pub const RESOURCE_TYPE_PCI_DEVICE: &str = "harvester_pci_device";

// Labels and annotations
pub const LABEL_TAG_PREFIX: &str = "tag.harvesterhci.io/";
pub const ANNOTATION_DESCRIPTION: &str = "field.cattle.io/description";
pub const LABEL_CREATOR: &str = "harvesterhci.io/creator";
pub const CREATOR_TERRAFORM: &str = "terraform-provider-harvester";
pub const LABEL_VM_NAME: &str = "harvesterhci.io/vmName";
pub const ANNOTATION_IMAGE_ID: &str = "harvesterhci.io/imageId";
pub const ANNOTATION_STORAGE_CLASS_NAME: &str = "harvesterhci.io/storageClassName";
pub const ANNOTATION_SSH_NAMES: &str = "harvesterhci.io/sshNames";
pub const ANNOTATION_VOLUME_CLAIM_TEMPLATES: &str = "harvesterhci.io/volumeClaimTemplates";
pub const ANNOTATION_REMOVED_PVCS: &str = "harvesterhci.io/removedPersistentVolumeClaims";
pub const ANNOTATION_OWNED_BY: &str = "harvesterhci.io/owned-by";
pub const ANNOTATION_NETWORK_ROUTE: &str = "network.harvesterhci.io/route";
pub const LABEL_CLUSTER_NETWORK: &str = "network.harvesterhci.io/clusternetwork";
pub const LABEL_NETWORK_TYPE: &str = "network.harvesterhci.io/type";
pub const NETWORK_TYPE_VLAN: &str = "L2VlanNetwork";
pub const ANNOTATION_IS_DEFAULT_STORAGE_CLASS: &str = "storageclass.kubernetes.io/is-default-class";
pub const ANNOTATION_RESERVED_STORAGE_CLASS: &str = "harvesterhci.io/is-reserved-storageclass";

// Defaults
pub const MANAGEMENT_CLUSTER_NETWORK: &str = "mgmt";
pub const LONGHORN_PROVISIONER: &str = "driver.longhorn.io";
pub const CLOUD_INIT_DISK_NAME: &str = "cloudinitdisk";

// Condition-derived states
pub const STATE_ACTIVE: &str = "Active";
pub const STATE_FAILED: &str = "Failed";
pub const STATE_IN_PROGRESS: &str = "In-Progress";
pub const STATE_REMOVED: &str = "Removed";
pub const STATE_REMOVING: &str = "Removing";
