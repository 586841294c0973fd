//! harvester_schedule_backup and harvester_volume_backup: ScheduleVMBackup
//!
//! Both resources describe a recurring VM backup and share one constructor.
//! A volume backup is keyed by its VM and takes over whatever schedule
//! already exists for that VM.

use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::backup::*;
use harvester_common::constants::{
    RESOURCE_TYPE_SCHEDULE_BACKUP, RESOURCE_TYPE_VOLUME_BACKUP, STATE_ACTIVE, STATE_FAILED,
};
use harvester_common::{id_parts3, Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_int, as_string, construct, metadata_processors, new_meta, reset_managed_metadata,
    Processor,
};
use crate::importer::{state_from_condition, Importer};
use crate::schema::{namespaced_attributes, Attribute, Block, Schema};
use crate::state::{bool_value, get_bool_attr, get_string_attr, int_value, string_value, Value};
use crate::validators;

pub const DEFAULT_RETAIN: i64 = 8;
pub const DEFAULT_MAX_FAILURE: i64 = 4;

const CONDITION_READY: &str = "Ready";
const VM_API_GROUP: &str = "kubevirt.io";
const VM_KIND: &str = "VirtualMachine";

fn backup_attributes() -> Vec<Attribute> {
    vec![
        Attribute::string("vm_name")
            .required()
            .force_new()
            .validate(validators::dns1123())
            .description("Virtual machine in the same namespace"),
        Attribute::string("schedule")
            .required()
            .validate(validators::not_empty())
            .description("Cron expression, e.g. `0 2 * * *`"),
        Attribute::number("retain")
            .default(int_value(DEFAULT_RETAIN))
            .validate(validators::int_between(2, 250)),
        Attribute::number("max_failure")
            .default(int_value(DEFAULT_MAX_FAILURE))
            .validate(validators::int_at_least(2)),
        Attribute::bool("enabled").default(bool_value(true)),
        Attribute::string("type")
            .default(string_value(BACKUP_TYPE_BACKUP))
            .force_new()
            .validate(validators::string_in_slice(&[BACKUP_TYPE_BACKUP, BACKUP_TYPE_SNAPSHOT])),
        Attribute::number("failure").computed(),
    ]
}

pub fn schedule_backup_schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attributes(backup_attributes()),
    )
}

/// The job name is chosen for the user, or taken from an adopted schedule.
pub fn volume_backup_schema() -> Schema {
    let attributes = namespaced_attributes().into_iter().map(|a| {
        if a.name == "name" {
            Attribute::string("name")
                .optional()
                .computed()
                .force_new()
                .validate(validators::dns1123())
                .description("Schedule name; defaults to `<vm_name>-backup`")
        } else {
            a
        }
    });
    Schema::new(
        Block::new()
            .attributes(attributes)
            .attributes(backup_attributes()),
    )
}

fn processors<'a>() -> Vec<Processor<'a, ScheduleVMBackup>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("vm_name", |sb: &mut ScheduleVMBackup, v| {
            sb.spec.vmbackup.source = TypedLocalObjectReference {
                api_group: Some(VM_API_GROUP.to_string()),
                kind: VM_KIND.to_string(),
                name: as_string(v),
            };
            Ok(())
        })
        .required(),
        Processor::new("schedule", |sb: &mut ScheduleVMBackup, v| {
            sb.spec.cron = as_string(v);
            Ok(())
        })
        .required(),
        Processor::new("retain", |sb: &mut ScheduleVMBackup, v| {
            sb.spec.retain = as_int(v);
            Ok(())
        }),
        Processor::new("max_failure", |sb: &mut ScheduleVMBackup, v| {
            sb.spec.max_failure = as_int(v);
            Ok(())
        }),
        Processor::new("type", |sb: &mut ScheduleVMBackup, v| {
            sb.spec.vmbackup.type_ = as_string(v);
            Ok(())
        }),
    ]);
    processors
}

fn apply(sb: &mut ScheduleVMBackup, data: &Value) -> Result<()> {
    sb.spec.retain = DEFAULT_RETAIN;
    sb.spec.max_failure = DEFAULT_MAX_FAILURE;
    if sb.spec.vmbackup.type_.is_empty() {
        sb.spec.vmbackup.type_ = BACKUP_TYPE_BACKUP.to_string();
    }
    construct(sb, data, &processors())?;
    // GetOk would skip `false`
    sb.spec.suspend = !get_bool_attr(data, "enabled", true);
    Ok(())
}

pub fn build(data: &Value) -> Result<ScheduleVMBackup> {
    let mut sb = ScheduleVMBackup {
        metadata: new_meta(data),
        spec: ScheduleVMBackupSpec::default(),
        status: None,
    };
    apply(&mut sb, data)?;
    Ok(sb)
}

pub fn update(current: &ScheduleVMBackup, data: &Value) -> Result<ScheduleVMBackup> {
    let mut sb = current.clone();
    reset_managed_metadata(&mut sb.metadata);
    apply(&mut sb, data)?;
    Ok(sb)
}

fn status_state(sb: &ScheduleVMBackup) -> (String, String) {
    let status = sb.status.clone().unwrap_or_default();
    if status.suspended && !sb.spec.suspend {
        return (
            STATE_FAILED.to_string(),
            format!("suspended after {} consecutive failures", status.failure),
        );
    }
    match state_from_condition(&status.conditions, CONDITION_READY) {
        (state, message) if state == STATE_FAILED => (state, message),
        _ => (STATE_ACTIVE.to_string(), String::new()),
    }
}

fn to_importer(resource_type: &'static str, sb: &ScheduleVMBackup) -> Importer {
    let mut importer = Importer::from_meta(resource_type, &sb.metadata);
    let (state, message) = status_state(sb);
    importer
        .set("vm_name", string_value(&sb.spec.vmbackup.source.name))
        .set("schedule", string_value(&sb.spec.cron))
        .set("retain", int_value(sb.spec.retain))
        .set("max_failure", int_value(sb.spec.max_failure))
        .set("enabled", bool_value(!sb.spec.suspend))
        .set("type", string_value(&sb.spec.vmbackup.type_))
        .set(
            "failure",
            int_value(sb.status.as_ref().map(|s| s.failure).unwrap_or_default()),
        )
        .set_state(&state, &message);
    importer
}

pub fn schedule_backup_state(sb: &ScheduleVMBackup) -> Value {
    to_importer(RESOURCE_TYPE_SCHEDULE_BACKUP, sb).into_state()
}

/// `namespace/vm/job`
pub fn volume_backup_id(sb: &ScheduleVMBackup) -> String {
    format!(
        "{}/{}/{}",
        sb.metadata.namespace.as_deref().unwrap_or_default(),
        sb.spec.vmbackup.source.name,
        sb.metadata.name.as_deref().unwrap_or_default()
    )
}

pub fn volume_backup_state(sb: &ScheduleVMBackup) -> Value {
    let mut importer = to_importer(RESOURCE_TYPE_VOLUME_BACKUP, sb);
    let id = volume_backup_id(sb);
    importer.set("id", string_value(&id));
    importer.id = id;
    importer.into_state()
}

pub struct ScheduleBackupResource {
    schedules: Arc<dyn ObjectApi<ScheduleVMBackup>>,
}

impl ScheduleBackupResource {
    pub fn new(schedules: Arc<dyn ObjectApi<ScheduleVMBackup>>) -> Self {
        Self { schedules }
    }
}

#[async_trait]
impl Resource for ScheduleBackupResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating schedule backup {}/{}", namespace, name);
        let created = self.schedules.create(&namespace, &build(planned)?).await?;
        Ok(schedule_backup_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        Ok(self
            .schedules
            .get(&namespace, &name)
            .await?
            .map(|sb| schedule_backup_state(&sb)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating schedule backup {}/{}", namespace, name);
        let current = self.schedules.get(&namespace, &name).await?.ok_or_else(|| {
            Error::not_found("ScheduleVMBackup", format!("{}/{}", namespace, name))
        })?;
        let updated = self
            .schedules
            .replace(&namespace, &name, &update(&current, planned)?)
            .await?;
        Ok(schedule_backup_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting schedule backup {}/{}", namespace, name);
        if !self.schedules.delete(&namespace, &name).await? {
            warn!("schedule backup {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}

pub struct VolumeBackupResource {
    schedules: Arc<dyn ObjectApi<ScheduleVMBackup>>,
}

impl VolumeBackupResource {
    pub fn new(schedules: Arc<dyn ObjectApi<ScheduleVMBackup>>) -> Self {
        Self { schedules }
    }

    /// Schedule already backing up `vm`, if any
    async fn find_for_vm(&self, namespace: &str, vm: &str) -> Result<Option<ScheduleVMBackup>> {
        Ok(self
            .schedules
            .list(namespace)
            .await?
            .into_iter()
            .find(|sb| {
                sb.spec.vmbackup.source.kind == VM_KIND && sb.spec.vmbackup.source.name == vm
            }))
    }

    /// Look up by `namespace/vm/job`; a schedule that no longer targets the
    /// VM counts as gone.
    async fn get(&self, id: &str) -> Result<Option<ScheduleVMBackup>> {
        let (namespace, vm, job) = id_parts3(id)?;
        Ok(self
            .schedules
            .get(&namespace, &job)
            .await?
            .filter(|sb| sb.spec.vmbackup.source.name == vm))
    }
}

#[async_trait]
impl Resource for VolumeBackupResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, requested) = planned_id(planned, true);
        let vm = get_string_attr(planned, "vm_name");

        if let Some(existing) = self.find_for_vm(&namespace, &vm).await? {
            let job = existing.metadata.name.clone().unwrap_or_default();
            if !requested.is_empty() && requested != job {
                return Err(Error::Validation(format!(
                    "virtual machine {}/{} is already backed up by schedule {}",
                    namespace, vm, job
                )));
            }
            info!("Adopting schedule {}/{} for vm {}", namespace, job, vm);
            let mut data = planned.clone();
            data.set("name", string_value(&job));
            let updated = self
                .schedules
                .replace(&namespace, &job, &update(&existing, &data)?)
                .await?;
            return Ok(volume_backup_state(&updated));
        }

        let job = if requested.is_empty() {
            format!("{}-backup", vm)
        } else {
            requested
        };
        info!("Creating volume backup schedule {}/{} for vm {}", namespace, job, vm);
        let mut data = planned.clone();
        data.set("name", string_value(&job));
        let created = self.schedules.create(&namespace, &build(&data)?).await?;
        Ok(volume_backup_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let id = get_string_attr(state, "id");
        Ok(self.get(&id).await?.map(|sb| volume_backup_state(&sb)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let id = get_string_attr(prior, "id");
        info!("Updating volume backup {}", id);
        let current = self
            .get(&id)
            .await?
            .ok_or_else(|| Error::not_found("ScheduleVMBackup", &id))?;
        let (namespace, _, job) = id_parts3(&id)?;
        let updated = self
            .schedules
            .replace(&namespace, &job, &update(&current, planned)?)
            .await?;
        Ok(volume_backup_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let id = get_string_attr(prior, "id");
        let (namespace, _, job) = id_parts3(&id)?;
        info!("Deleting volume backup {}", id);
        if self.get(&id).await?.is_none() || !self.schedules.delete(&namespace, &job).await? {
            warn!("volume backup {} already deleted", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use crate::state::make_state;

    fn planned() -> Value {
        make_state(vec![
            ("name", string_value("nightly")),
            ("namespace", string_value("default")),
            ("vm_name", string_value("web-1")),
            ("schedule", string_value("0 2 * * *")),
            ("retain", int_value(5)),
            ("max_failure", int_value(3)),
            ("enabled", bool_value(false)),
            ("type", string_value("snapshot")),
        ])
    }

    #[test]
    fn test_round_trip() {
        let sb = build(&planned()).unwrap();
        assert!(sb.spec.suspend);
        assert_eq!(sb.spec.vmbackup.source.api_group.as_deref(), Some("kubevirt.io"));
        let state = schedule_backup_state(&sb);
        for key in ["name", "vm_name", "schedule", "retain", "max_failure", "enabled", "type"] {
            assert_eq!(state.get(key), planned().get(key), "{}", key);
        }
    }

    #[test]
    fn test_defaults() {
        let sb = build(&make_state(vec![
            ("name", string_value("nightly")),
            ("vm_name", string_value("web-1")),
            ("schedule", string_value("0 2 * * *")),
        ]))
        .unwrap();
        assert_eq!(sb.spec.retain, DEFAULT_RETAIN);
        assert_eq!(sb.spec.max_failure, DEFAULT_MAX_FAILURE);
        assert_eq!(sb.spec.vmbackup.type_, BACKUP_TYPE_BACKUP);
        assert!(!sb.spec.suspend);
    }

    #[tokio::test]
    async fn test_schedule_backup_lifecycle() {
        let api = MemoryApi::<ScheduleVMBackup>::new().arc();
        let resource = ScheduleBackupResource::new(api.clone());
        let prior = resource.create(&planned()).await.unwrap();
        assert_eq!(get_string_attr(&prior, "id"), "default/nightly");

        let mut changed = prior.clone();
        changed.set("enabled", bool_value(true));
        changed.set("schedule", string_value("0 3 * * *"));
        let state = resource.update(&prior, &changed).await.unwrap();
        assert_eq!(state.get("enabled"), Some(&bool_value(true)));
        assert!(!api.stored("default", "nightly").unwrap().spec.suspend);

        resource.delete(&state).await.unwrap();
        resource.delete(&state).await.unwrap();
        assert_eq!(api.len(), 0);
    }

    #[tokio::test]
    async fn test_volume_backup_creates_named_schedule() {
        let api = MemoryApi::<ScheduleVMBackup>::new().arc();
        let resource = VolumeBackupResource::new(api.clone());
        let mut data = planned();
        data.set("name", Value::Unknown);
        let state = resource.create(&data).await.unwrap();
        assert_eq!(get_string_attr(&state, "id"), "default/web-1/web-1-backup");
        assert_eq!(get_string_attr(&state, "name"), "web-1-backup");
        assert!(api.stored("default", "web-1-backup").is_some());

        let read = resource.read(&state).await.unwrap().unwrap();
        assert_eq!(read.get("id"), state.get("id"));
    }

    #[tokio::test]
    async fn test_volume_backup_adopts_existing_schedule() {
        let api = MemoryApi::<ScheduleVMBackup>::new().arc();
        api.insert(build(&planned()).unwrap());
        let resource = VolumeBackupResource::new(api.clone());

        let mut data = planned();
        data.set("name", Value::Unknown);
        data.set("retain", int_value(10));
        let state = resource.create(&data).await.unwrap();
        assert_eq!(get_string_attr(&state, "id"), "default/web-1/nightly");
        assert_eq!(api.len(), 1);
        assert_eq!(api.stored("default", "nightly").unwrap().spec.retain, 10);

        data.set("name", string_value("weekly"));
        let err = resource.create(&data).await.unwrap_err();
        assert!(err.to_string().contains("already backed up by schedule nightly"));
    }

    #[tokio::test]
    async fn test_volume_backup_of_other_vm_is_gone() {
        let api = MemoryApi::<ScheduleVMBackup>::new().arc();
        api.insert(build(&planned()).unwrap());
        let resource = VolumeBackupResource::new(api.clone());
        let state = make_state(vec![("id", string_value("default/db-1/nightly"))]);
        assert!(resource.read(&state).await.unwrap().is_none());
        resource.delete(&state).await.unwrap();
        assert_eq!(api.len(), 1);
    }
}
