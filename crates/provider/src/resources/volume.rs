//! harvester_volume: PersistentVolumeClaim
//!
//! Image-backed volumes carry the `harvesterhci.io/imageId` annotation and
//! use the storage class Harvester created for that image.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::image::VirtualMachineImage;
use harvester_common::constants::{
    ANNOTATION_IMAGE_ID, ANNOTATION_OWNED_BY, RESOURCE_TYPE_VOLUME, STATE_ACTIVE, STATE_FAILED,
    STATE_IN_PROGRESS,
};
use harvester_common::{namespaced_name_parts, Error, Result};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, construct, metadata_processors, new_meta, reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::schema::{namespaced_attributes, Attribute, Block, Schema};
use crate::state::{get_string_attr, optional_string_value, string_value, Value};
use crate::validators;

pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";
pub const VOLUME_MODES: &[&str] = &["Block", "Filesystem"];
pub const ACCESS_MODES: &[&str] = &["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany"];

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::string("size")
                    .default(string_value(DEFAULT_VOLUME_SIZE))
                    .validate(validators::quantity()),
            )
            .attribute(
                Attribute::string("storage_class_name")
                    .optional()
                    .computed()
                    .force_new(),
            )
            .attribute(
                Attribute::string("volume_mode")
                    .default(string_value("Block"))
                    .force_new()
                    .validate(validators::string_in_slice(VOLUME_MODES)),
            )
            .attribute(
                Attribute::string("access_mode")
                    .default(string_value("ReadWriteMany"))
                    .force_new()
                    .validate(validators::string_in_slice(ACCESS_MODES)),
            )
            .attribute(
                Attribute::string("image")
                    .optional()
                    .force_new()
                    .validate(validators::namespaced_name())
                    .description("Image to clone the volume from, as `namespace/name`"),
            )
            .attribute(Attribute::string("phase").computed())
            .attribute(Attribute::string("attached_vm").computed()),
    )
}

/// Storage class Harvester provisions for an image's volumes
pub fn image_storage_class(image: &VirtualMachineImage) -> String {
    image
        .status
        .as_ref()
        .and_then(|s| s.storage_class_name.clone())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| {
            format!(
                "longhorn-{}",
                image.metadata.name.as_deref().unwrap_or_default()
            )
        })
}

fn spec(pvc: &mut PersistentVolumeClaim) -> &mut PersistentVolumeClaimSpec {
    pvc.spec.get_or_insert_with(Default::default)
}

fn processors<'a>() -> Vec<Processor<'a, PersistentVolumeClaim>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("size", |pvc: &mut PersistentVolumeClaim, v| {
            spec(pvc).resources = Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(as_string(v)),
                )])),
                ..Default::default()
            });
            Ok(())
        }),
        Processor::new("storage_class_name", |pvc: &mut PersistentVolumeClaim, v| {
            spec(pvc).storage_class_name = Some(as_string(v));
            Ok(())
        }),
        Processor::new("volume_mode", |pvc: &mut PersistentVolumeClaim, v| {
            spec(pvc).volume_mode = Some(as_string(v));
            Ok(())
        }),
        Processor::new("access_mode", |pvc: &mut PersistentVolumeClaim, v| {
            spec(pvc).access_modes = Some(vec![as_string(v)]);
            Ok(())
        }),
    ]);
    processors
}

/// Build a new claim. `image` is the resolved source image, if any.
pub fn build(data: &Value, image: Option<&VirtualMachineImage>) -> Result<PersistentVolumeClaim> {
    let mut pvc = PersistentVolumeClaim {
        metadata: new_meta(data),
        ..Default::default()
    };
    let claim = spec(&mut pvc);
    claim.volume_mode = Some("Block".to_string());
    claim.access_modes = Some(vec!["ReadWriteMany".to_string()]);
    claim.resources = Some(VolumeResourceRequirements {
        requests: Some(BTreeMap::from([(
            "storage".to_string(),
            Quantity(DEFAULT_VOLUME_SIZE.to_string()),
        )])),
        ..Default::default()
    });
    construct(&mut pvc, data, &processors())?;

    if let Some(image) = image {
        let image_id = format!(
            "{}/{}",
            image.metadata.namespace.as_deref().unwrap_or_default(),
            image.metadata.name.as_deref().unwrap_or_default()
        );
        pvc.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ANNOTATION_IMAGE_ID.to_string(), image_id);
        spec(&mut pvc).storage_class_name = Some(image_storage_class(image));
    }
    Ok(pvc)
}

/// Only the size and the managed metadata change in place.
pub fn update(current: &PersistentVolumeClaim, data: &Value) -> Result<PersistentVolumeClaim> {
    let mut pvc = current.clone();
    reset_managed_metadata(&mut pvc.metadata);
    let mut processors = metadata_processors();
    processors.extend(processors_for_update());
    construct(&mut pvc, data, &processors)?;
    Ok(pvc)
}

fn processors_for_update<'a>() -> Vec<Processor<'a, PersistentVolumeClaim>> {
    processors()
        .into_iter()
        .filter(|p| p.field == "size")
        .collect()
}

pub fn size(pvc: &PersistentVolumeClaim) -> String {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
        .map(|q| q.0.clone())
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct OwnerRefs {
    #[serde(default)]
    refs: Vec<String>,
}

/// VM that has the volume attached, from Harvester's `owned-by` annotation
pub fn attached_vm(pvc: &PersistentVolumeClaim) -> String {
    pvc.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_OWNED_BY))
        .and_then(|raw| serde_json::from_str::<Vec<OwnerRefs>>(raw).ok())
        .and_then(|owners| owners.into_iter().flat_map(|o| o.refs).next())
        .unwrap_or_default()
}

pub fn to_state(pvc: &PersistentVolumeClaim) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_VOLUME, &pvc.metadata);
    let spec = pvc.spec.clone().unwrap_or_default();
    let phase = pvc
        .status
        .as_ref()
        .and_then(|s| s.phase.clone())
        .unwrap_or_default();
    let state = match phase.as_str() {
        "Bound" => STATE_ACTIVE,
        "Lost" => STATE_FAILED,
        _ => STATE_IN_PROGRESS,
    };
    let image = pvc
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_IMAGE_ID))
        .cloned();

    importer
        .set("size", string_value(size(pvc)))
        .set(
            "storage_class_name",
            optional_string_value(spec.storage_class_name),
        )
        .set(
            "volume_mode",
            string_value(spec.volume_mode.unwrap_or_else(|| "Filesystem".into())),
        )
        .set(
            "access_mode",
            optional_string_value(spec.access_modes.unwrap_or_default().into_iter().next()),
        )
        .set("image", optional_string_value(image))
        .set("phase", string_value(&phase))
        .set("attached_vm", string_value(attached_vm(pvc)))
        .set_state(state, "");
    importer.into_state()
}

pub struct VolumeResource {
    pvcs: Arc<dyn ObjectApi<PersistentVolumeClaim>>,
    images: Arc<dyn ObjectApi<VirtualMachineImage>>,
}

impl VolumeResource {
    pub fn new(
        pvcs: Arc<dyn ObjectApi<PersistentVolumeClaim>>,
        images: Arc<dyn ObjectApi<VirtualMachineImage>>,
    ) -> Self {
        Self { pvcs, images }
    }
}

#[async_trait]
impl Resource for VolumeResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating volume {}/{}", namespace, name);

        let image = match get_string_attr(planned, "image") {
            reference if reference.is_empty() => None,
            reference => {
                let (image_ns, image_name) = namespaced_name_parts(&reference, &namespace)?;
                let image = self.images.get(&image_ns, &image_name).await?.ok_or_else(|| {
                    Error::not_found("VirtualMachineImage", format!("{}/{}", image_ns, image_name))
                })?;
                Some(image)
            }
        };

        let created = self
            .pvcs
            .create(&namespace, &build(planned, image.as_ref())?)
            .await?;
        Ok(to_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        Ok(self.pvcs.get(&namespace, &name).await?.map(|p| to_state(&p)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating volume {}/{}", namespace, name);
        let current = self.pvcs.get(&namespace, &name).await?.ok_or_else(|| {
            Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name))
        })?;
        let updated = self
            .pvcs
            .replace(&namespace, &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting volume {}/{}", namespace, name);
        if !self.pvcs.delete(&namespace, &name).await? {
            warn!("volume {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use crate::state::make_state;
    use harvester_common::api::image::{VirtualMachineImageSpec, VirtualMachineImageStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn planned() -> Value {
        make_state(vec![
            ("name", string_value("data")),
            ("namespace", string_value("default")),
            ("size", string_value("20Gi")),
            ("storage_class_name", string_value("longhorn")),
            ("volume_mode", string_value("Block")),
            ("access_mode", string_value("ReadWriteOnce")),
        ])
    }

    fn image() -> VirtualMachineImage {
        VirtualMachineImage {
            metadata: ObjectMeta {
                name: Some("ubuntu".into()),
                namespace: Some("images".into()),
                ..Default::default()
            },
            spec: VirtualMachineImageSpec::default(),
            status: Some(VirtualMachineImageStatus {
                storage_class_name: Some("longhorn-ubuntu-sc".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_round_trip() {
        let state = to_state(&build(&planned(), None).unwrap());
        let keys = [
            "name",
            "namespace",
            "size",
            "storage_class_name",
            "volume_mode",
            "access_mode",
        ];
        for key in keys {
            assert_eq!(state.get(key), planned().get(key), "{}", key);
        }
        assert!(state.get("image").unwrap().is_null());
    }

    #[test]
    fn test_image_storage_class_fallback() {
        let mut image = image();
        assert_eq!(image_storage_class(&image), "longhorn-ubuntu-sc");
        image.status = None;
        assert_eq!(image_storage_class(&image), "longhorn-ubuntu");
    }

    #[test]
    fn test_attached_vm() {
        let mut pvc = build(&planned(), None).unwrap();
        pvc.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(
            ANNOTATION_OWNED_BY.into(),
            r#"[{"schema":"kubevirt.io.virtualmachine","refs":["default/web-1"]}]"#.into(),
        );
        assert_eq!(attached_vm(&pvc), "default/web-1");
    }

    #[tokio::test]
    async fn test_image_backed_volume() {
        let pvcs = MemoryApi::<PersistentVolumeClaim>::new().arc();
        let images = MemoryApi::<VirtualMachineImage>::new().arc();
        images.insert(image());
        let resource = VolumeResource::new(pvcs.clone(), images);

        let mut data = planned();
        data.set("image", string_value("images/ubuntu"));
        data.set("storage_class_name", Value::Unknown);
        let state = resource.create(&data).await.unwrap();
        assert_eq!(get_string_attr(&state, "image"), "images/ubuntu");
        assert_eq!(get_string_attr(&state, "storage_class_name"), "longhorn-ubuntu-sc");

        let mut missing = planned();
        missing.set("name", string_value("other"));
        missing.set("image", string_value("images/debian"));
        assert!(resource.create(&missing).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_resize_and_destroy() {
        let pvcs = MemoryApi::<PersistentVolumeClaim>::new().arc();
        let resource = VolumeResource::new(pvcs.clone(), MemoryApi::new().arc());
        let prior = resource.create(&planned()).await.unwrap();

        let mut changed = prior.clone();
        changed.set("size", string_value("40Gi"));
        let state = resource.update(&prior, &changed).await.unwrap();
        assert_eq!(get_string_attr(&state, "size"), "40Gi");

        resource.delete(&state).await.unwrap();
        assert!(pvcs.stored("default", "data").is_none());
        assert!(resource.read(&state).await.unwrap().is_none());
    }
}
