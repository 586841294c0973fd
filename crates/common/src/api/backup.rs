//! ScheduleVMBackup (harvesterhci.io/v1beta1)

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::Condition;

pub const BACKUP_TYPE_BACKUP: &str = "backup";
pub const BACKUP_TYPE_SNAPSHOT: &str = "snapshot";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "harvesterhci.io",
    version = "v1beta1",
    kind = "ScheduleVMBackup",
    plural = "schedulevmbackups",
    namespaced,
    status = "ScheduleVMBackupStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleVMBackupSpec {
    pub cron: String,
    #[serde(default)]
    pub retain: i64,
    #[serde(default)]
    pub max_failure: i64,
    #[serde(default)]
    pub suspend: bool,
    pub vmbackup: VMBackupTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VMBackupTemplate {
    pub source: TypedLocalObjectReference,
    #[serde(rename = "type", default)]
    pub type_: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedLocalObjectReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleVMBackupStatus {
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub failure: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}
