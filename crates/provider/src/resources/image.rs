//! harvester_image: VirtualMachineImage

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::image::*;
use harvester_common::constants::{ANNOTATION_STORAGE_CLASS_NAME, RESOURCE_TYPE_IMAGE};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, as_string_map, construct, metadata_processors, new_meta, reset_managed_metadata,
    Processor,
};
use crate::importer::{state_from_condition, Importer};
use crate::poll::{wait_for_state, Timeouts};
use crate::schema::{namespaced_attributes, Attribute, Block, Schema};
use crate::state::{
    get_string_attr, int_value, optional_string_value, string_map_value, string_value, Value,
};
use crate::validators;
use harvester_common::constants::{STATE_ACTIVE, STATE_FAILED, STATE_IN_PROGRESS};

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::string("display_name")
                    .required()
                    .validate(validators::not_empty()),
            )
            .attribute(
                Attribute::string("source_type")
                    .default(string_value(IMAGE_SOURCE_DOWNLOAD))
                    .force_new()
                    .validate(validators::string_in_slice(&[
                        IMAGE_SOURCE_DOWNLOAD,
                        IMAGE_SOURCE_UPLOAD,
                        IMAGE_SOURCE_EXPORT_FROM_VOLUME,
                    ])),
            )
            .attribute(
                Attribute::string("url")
                    .optional()
                    .force_new()
                    .description("supports the `raw` and `qcow2` image formats"),
            )
            .attribute(Attribute::string("pvc_name").optional().force_new())
            .attribute(Attribute::string("pvc_namespace").optional().force_new())
            .attribute(Attribute::string("checksum").optional().force_new())
            .attribute(Attribute::string("storage_class_name").optional().computed().force_new())
            .attribute(
                Attribute::string_map("storage_class_parameters")
                    .optional()
                    .computed()
                    .force_new(),
            )
            .attribute(Attribute::number("progress").computed())
            .attribute(Attribute::number("size").computed())
            .attribute(Attribute::number("virtual_size").computed())
            .attribute(Attribute::string("volume_storage_class_name").computed())
            .check(Arc::new(|config| {
                let source = config
                    .get("source_type")
                    .and_then(Value::as_str)
                    .unwrap_or(IMAGE_SOURCE_DOWNLOAD);
                if source == IMAGE_SOURCE_DOWNLOAD && get_string_attr(config, "url").is_empty() {
                    return Err("expected url to not be empty when source_type is download".into());
                }
                if source == IMAGE_SOURCE_EXPORT_FROM_VOLUME
                    && get_string_attr(config, "pvc_name").is_empty()
                {
                    return Err(
                        "expected pvc_name to not be empty when source_type is export-from-volume"
                            .into(),
                    );
                }
                Ok(())
            })),
    )
}

fn processors<'a>() -> Vec<Processor<'a, VirtualMachineImage>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("display_name", |image: &mut VirtualMachineImage, v| {
            let name = as_string(v);
            if name.trim().is_empty() {
                return Err(Error::Validation("display_name must not be empty".into()));
            }
            image.spec.display_name = name;
            Ok(())
        })
        .required(),
        Processor::new("url", |image: &mut VirtualMachineImage, v| {
            image.spec.url = Some(as_string(v));
            Ok(())
        }),
        Processor::new("pvc_name", |image: &mut VirtualMachineImage, v| {
            image.spec.pvc_name = Some(as_string(v));
            Ok(())
        }),
        Processor::new("pvc_namespace", |image: &mut VirtualMachineImage, v| {
            image.spec.pvc_namespace = Some(as_string(v));
            Ok(())
        }),
        Processor::new("checksum", |image: &mut VirtualMachineImage, v| {
            image.spec.checksum = Some(as_string(v));
            Ok(())
        }),
        Processor::new("storage_class_name", |image: &mut VirtualMachineImage, v| {
            image
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(ANNOTATION_STORAGE_CLASS_NAME.to_string(), as_string(v));
            Ok(())
        }),
        Processor::new("storage_class_parameters", |image: &mut VirtualMachineImage, v| {
            image.spec.storage_class_parameters = as_string_map(v);
            Ok(())
        }),
        // source_type last: its checks see the fields above
        Processor::new("source_type", |image: &mut VirtualMachineImage, v| {
            let source = as_string(v);
            match source.as_str() {
                IMAGE_SOURCE_DOWNLOAD if image.spec.url.as_deref().unwrap_or("").is_empty() => {
                    return Err(Error::Validation(
                        "expected url to not be empty when source_type is download".into(),
                    ))
                }
                IMAGE_SOURCE_EXPORT_FROM_VOLUME
                    if image.spec.pvc_name.as_deref().unwrap_or("").is_empty() =>
                {
                    return Err(Error::Validation(
                        "expected pvc_name to not be empty when source_type is export-from-volume"
                            .into(),
                    ))
                }
                _ => {}
            }
            image.spec.source_type = source;
            Ok(())
        })
        .required(),
    ]);
    processors
}

/// Build a new image from planned attributes
pub fn build(data: &Value) -> Result<VirtualMachineImage> {
    let mut image = VirtualMachineImage {
        metadata: new_meta(data),
        spec: VirtualMachineImageSpec::default(),
        status: None,
    };
    construct(&mut image, data, &processors())?;
    Ok(image)
}

/// Apply planned attributes to the current image
pub fn update(current: &VirtualMachineImage, data: &Value) -> Result<VirtualMachineImage> {
    let mut image = current.clone();
    reset_managed_metadata(&mut image.metadata);
    construct(&mut image, data, &processors())?;
    Ok(image)
}

fn status_state(image: &VirtualMachineImage) -> (String, String) {
    let conditions = image
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[]);
    state_from_condition(conditions, CONDITION_IMAGE_IMPORTED)
}

pub fn to_state(image: &VirtualMachineImage) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_IMAGE, &image.metadata);
    let spec = &image.spec;
    let status = image.status.clone().unwrap_or_default();
    let (state, message) = status_state(image);
    let storage_class_name = image
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_STORAGE_CLASS_NAME))
        .cloned();

    importer
        .set("display_name", string_value(&spec.display_name))
        .set("source_type", string_value(&spec.source_type))
        .set("url", optional_string_value(spec.url.clone()))
        .set("pvc_name", optional_string_value(spec.pvc_name.clone()))
        .set("pvc_namespace", optional_string_value(spec.pvc_namespace.clone()))
        .set("checksum", optional_string_value(spec.checksum.clone()))
        .set("storage_class_name", optional_string_value(storage_class_name))
        .set(
            "storage_class_parameters",
            string_map_value(&spec.storage_class_parameters),
        )
        .set("progress", int_value(status.progress))
        .set("size", int_value(status.size))
        .set("virtual_size", int_value(status.virtual_size))
        .set(
            "volume_storage_class_name",
            string_value(status.storage_class_name.unwrap_or_default()),
        )
        .set_state(&state, &message);
    importer.into_state()
}

pub struct ImageResource {
    images: Arc<dyn ObjectApi<VirtualMachineImage>>,
    timeouts: Timeouts,
}

impl ImageResource {
    pub fn new(images: Arc<dyn ObjectApi<VirtualMachineImage>>) -> Self {
        Self {
            images,
            timeouts: Timeouts {
                create: std::time::Duration::from_secs(20 * 60),
                ..Timeouts::default()
            },
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn wait_imported(&self, namespace: &str, name: &str) -> Result<VirtualMachineImage> {
        let wait = self
            .timeouts
            .wait(format!("image {}/{}", namespace, name), self.timeouts.create)
            .pending(&[STATE_IN_PROGRESS])
            .target(&[STATE_ACTIVE]);
        wait_for_state(&wait, || async {
            let image = self
                .images
                .get(namespace, name)
                .await?
                .ok_or_else(|| {
                    Error::not_found("VirtualMachineImage", format!("{}/{}", namespace, name))
                })?;
            let (state, message) = status_state(&image);
            if state == STATE_FAILED {
                return Err(Error::Validation(format!(
                    "image {}/{} failed to import: {}",
                    namespace, name, message
                )));
            }
            Ok((image, state))
        })
        .await
    }
}

#[async_trait]
impl Resource for ImageResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating image {}/{}", namespace, name);

        let image = build(planned)?;
        let created = self.images.create(&namespace, &image).await?;

        if created.spec.source_type == IMAGE_SOURCE_UPLOAD {
            // Nothing to import until the user uploads the file.
            return Ok(to_state(&created));
        }
        let image = self.wait_imported(&namespace, &name).await?;
        Ok(to_state(&image))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        Ok(self.images.get(&namespace, &name).await?.map(|i| to_state(&i)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating image {}/{}", namespace, name);

        let current = self
            .images
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| {
                Error::not_found("VirtualMachineImage", format!("{}/{}", namespace, name))
            })?;
        let image = update(&current, planned)?;
        let updated = self.images.replace(&namespace, &name, &image).await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting image {}/{}", namespace, name);
        if !self.images.delete(&namespace, &name).await? {
            warn!("image {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}
