//! harvester_storageclass: StorageClass

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::constants::{
    ANNOTATION_IS_DEFAULT_STORAGE_CLASS, ANNOTATION_RESERVED_STORAGE_CLASS, LONGHORN_PROVISIONER,
    RESOURCE_TYPE_STORAGE_CLASS, STATE_ACTIVE,
};
use harvester_common::{Error, Result};
use k8s_openapi::api::storage::v1::StorageClass;
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, as_string_map, construct, metadata_processors, reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::schema::{cluster_attributes, Attribute, Block, Schema};
use crate::state::{
    bool_value, get_bool_attr, get_string_attr, string_map_value, string_value, Value,
};
use crate::validators;

pub const RECLAIM_POLICIES: &[&str] = &["Delete", "Retain"];
pub const VOLUME_BINDING_MODES: &[&str] = &["Immediate", "WaitForFirstConsumer"];

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(cluster_attributes())
            .attribute(Attribute::bool("is_default").default(bool_value(false)))
            .attribute(Attribute::bool("allow_volume_expansion").default(bool_value(true)))
            .attribute(
                Attribute::string("reclaim_policy")
                    .default(string_value("Delete"))
                    .force_new()
                    .validate(validators::string_in_slice(RECLAIM_POLICIES)),
            )
            .attribute(
                Attribute::string("volume_binding_mode")
                    .default(string_value("Immediate"))
                    .force_new()
                    .validate(validators::string_in_slice(VOLUME_BINDING_MODES)),
            )
            .attribute(
                Attribute::string("volume_provisioner")
                    .default(string_value(LONGHORN_PROVISIONER))
                    .force_new()
                    .validate(validators::not_empty()),
            )
            .attribute(
                Attribute::string_map("parameters")
                    .required()
                    .force_new()
                    .description(
                        "e.g. numberOfReplicas, staleReplicaTimeout, migratable, diskSelector",
                    ),
            ),
    )
}

fn processors<'a>() -> Vec<Processor<'a, StorageClass>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("reclaim_policy", |sc: &mut StorageClass, v| {
            sc.reclaim_policy = Some(as_string(v));
            Ok(())
        }),
        Processor::new("volume_binding_mode", |sc: &mut StorageClass, v| {
            sc.volume_binding_mode = Some(as_string(v));
            Ok(())
        }),
        Processor::new("volume_provisioner", |sc: &mut StorageClass, v| {
            sc.provisioner = as_string(v);
            Ok(())
        }),
        Processor::new("parameters", |sc: &mut StorageClass, v| {
            sc.parameters = Some(as_string_map(v));
            Ok(())
        })
        .required(),
    ]);
    processors
}

fn set_default_flag(sc: &mut StorageClass, is_default: bool) {
    sc.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(
            ANNOTATION_IS_DEFAULT_STORAGE_CLASS.to_string(),
            is_default.to_string(),
        );
}

fn annotation_is_true(sc: &StorageClass, key: &str) -> bool {
    sc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Booleans are written unconditionally: `false` is a meaningful value here.
fn apply_flags(sc: &mut StorageClass, data: &Value) {
    set_default_flag(sc, get_bool_attr(data, "is_default", false));
    sc.allow_volume_expansion = Some(get_bool_attr(data, "allow_volume_expansion", true));
}

pub fn build(data: &Value) -> Result<StorageClass> {
    let mut sc = StorageClass {
        provisioner: LONGHORN_PROVISIONER.to_string(),
        ..Default::default()
    };
    sc.metadata.name = Some(get_string_attr(data, "name"));
    construct(&mut sc, data, &processors())?;
    apply_flags(&mut sc, data);
    sc.metadata.namespace = None;
    Ok(sc)
}

pub fn update(current: &StorageClass, data: &Value) -> Result<StorageClass> {
    let mut sc = current.clone();
    reset_managed_metadata(&mut sc.metadata);
    construct(&mut sc, data, &processors())?;
    apply_flags(&mut sc, data);
    sc.metadata.namespace = None;
    Ok(sc)
}

pub fn to_state(sc: &StorageClass) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_STORAGE_CLASS, &sc.metadata);
    let parameters = sc.parameters.clone().unwrap_or_default();
    importer
        .set(
            "is_default",
            bool_value(annotation_is_true(sc, ANNOTATION_IS_DEFAULT_STORAGE_CLASS)),
        )
        .set(
            "allow_volume_expansion",
            bool_value(sc.allow_volume_expansion.unwrap_or(false)),
        )
        .set(
            "reclaim_policy",
            string_value(sc.reclaim_policy.clone().unwrap_or_else(|| "Delete".into())),
        )
        .set(
            "volume_binding_mode",
            string_value(
                sc.volume_binding_mode
                    .clone()
                    .unwrap_or_else(|| "Immediate".into()),
            ),
        )
        .set("volume_provisioner", string_value(&sc.provisioner))
        .set("parameters", string_map_value(&parameters))
        .set_state(STATE_ACTIVE, "");
    importer.into_state()
}

pub struct StorageClassResource {
    classes: Arc<dyn ObjectApi<StorageClass>>,
}

impl StorageClassResource {
    pub fn new(classes: Arc<dyn ObjectApi<StorageClass>>) -> Self {
        Self { classes }
    }
}

#[async_trait]
impl Resource for StorageClassResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (_, name) = planned_id(planned, false);
        info!("Creating storage class {}", name);
        let created = self.classes.create("", &build(planned)?).await?;
        Ok(to_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (_, name) = object_id(state)?;
        Ok(self.classes.get("", &name).await?.map(|sc| to_state(&sc)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (_, name) = object_id(prior)?;
        info!("Updating storage class {}", name);
        let current = self
            .classes
            .get("", &name)
            .await?
            .ok_or_else(|| Error::not_found("StorageClass", &name))?;
        let updated = self
            .classes
            .replace("", &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (_, name) = object_id(prior)?;
        let Some(mut sc) = self.classes.get("", &name).await? else {
            warn!("storage class {} already deleted", name);
            return Ok(());
        };

        if annotation_is_true(&sc, ANNOTATION_RESERVED_STORAGE_CLASS) {
            info!(
                "Storage class {} is reserved, clearing its default flag instead of deleting",
                name
            );
            set_default_flag(&mut sc, false);
            reset_managed_metadata(&mut sc.metadata);
            self.classes.replace("", &name, &sc).await?;
            return Ok(());
        }

        info!("Deleting storage class {}", name);
        if !self.classes.delete("", &name).await? {
            warn!("storage class {} already deleted", name);
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
            ("name", string_value("single-replica")),
            ("is_default", bool_value(true)),
            ("allow_volume_expansion", bool_value(false)),
            ("reclaim_policy", string_value("Retain")),
            ("volume_binding_mode", string_value("Immediate")),
            ("volume_provisioner", string_value(LONGHORN_PROVISIONER)),
            (
                "parameters",
                string_map_value(&BTreeMap::from([(
                    "numberOfReplicas".to_string(),
                    "1".to_string(),
                )])),
            ),
        ])
    }

    #[test]
    fn test_round_trip() {
        let sc = build(&planned()).unwrap();
        assert_eq!(sc.allow_volume_expansion, Some(false));
        let state = to_state(&sc);
        for key in [
            "name",
            "is_default",
            "allow_volume_expansion",
            "reclaim_policy",
            "volume_binding_mode",
            "volume_provisioner",
            "parameters",
        ] {
            assert_eq!(state.get(key), planned().get(key), "{}", key);
        }
    }

    #[tokio::test]
    async fn test_unset_default_on_update() {
        let api = MemoryApi::<StorageClass>::new().arc();
        let resource = StorageClassResource::new(api.clone());
        let prior = resource.create(&planned()).await.unwrap();

        let mut changed = prior.clone();
        changed.set("is_default", bool_value(false));
        let state = resource.update(&prior, &changed).await.unwrap();
        assert_eq!(state.get("is_default"), Some(&bool_value(false)));
    }

    #[tokio::test]
    async fn test_reserved_class_is_kept() {
        let api = MemoryApi::<StorageClass>::new().arc();
        let mut reserved = build(&planned()).unwrap();
        reserved.metadata.name = Some("harvester-longhorn".into());
        reserved
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_RESERVED_STORAGE_CLASS.into(), "true".into());
        api.insert(reserved);

        let resource = StorageClassResource::new(api.clone());
        let state = make_state(vec![("id", string_value("harvester-longhorn"))]);
        resource.delete(&state).await.unwrap();

        let kept = api.stored("", "harvester-longhorn").unwrap();
        assert!(!annotation_is_true(&kept, ANNOTATION_IS_DEFAULT_STORAGE_CLASS));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let api = MemoryApi::<StorageClass>::new().arc();
        let resource = StorageClassResource::new(api.clone());
        let state = resource.create(&planned()).await.unwrap();
        resource.delete(&state).await.unwrap();
        assert_eq!(api.len(), 0);
        resource.delete(&state).await.unwrap();
    }
}
