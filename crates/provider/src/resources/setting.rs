//! harvester_setting: Setting
//!
//! Settings are predefined by Harvester. Creating one takes over the
//! existing object; destroying one resets its value.

use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::setting::Setting;
use harvester_common::constants::{RESOURCE_TYPE_SETTING, STATE_ACTIVE};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, construct, metadata_processors, reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::schema::{cluster_attributes, Attribute, Block, Schema};
use crate::state::{optional_string_value, string_value, Value};

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(cluster_attributes())
            .attribute(
                Attribute::string("value")
                    .required()
                    .description("Setting value; JSON settings take the JSON document as a string"),
            )
            .attribute(Attribute::string("default").computed()),
    )
}

fn processors<'a>() -> Vec<Processor<'a, Setting>> {
    let mut processors = metadata_processors();
    // Unlike GetOk attributes, an empty value is a legitimate setting.
    processors.push(
        Processor::new("value", |setting: &mut Setting, v| {
            setting.value = Some(as_string(v));
            Ok(())
        })
        .required(),
    );
    processors
}

/// Apply planned attributes to a setting, existing or new
pub fn update(current: &Setting, data: &Value) -> Result<Setting> {
    let mut setting = current.clone();
    reset_managed_metadata(&mut setting.metadata);
    construct(&mut setting, data, &processors())?;
    setting.metadata.namespace = None;
    Ok(setting)
}

pub fn to_state(setting: &Setting) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_SETTING, &setting.metadata);
    importer
        .set(
            "value",
            string_value(setting.value.clone().unwrap_or_default()),
        )
        .set("default", optional_string_value(setting.default.clone()))
        .set_state(STATE_ACTIVE, "");
    importer.into_state()
}

pub struct SettingResource {
    settings: Arc<dyn ObjectApi<Setting>>,
}

impl SettingResource {
    pub fn new(settings: Arc<dyn ObjectApi<Setting>>) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Resource for SettingResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (_, name) = planned_id(planned, false);
        let setting = match self.settings.get("", &name).await? {
            Some(current) => {
                info!("Taking over setting {}", name);
                self.settings
                    .replace("", &name, &update(&current, planned)?)
                    .await?
            }
            None => {
                info!("Creating setting {}", name);
                self.settings
                    .create("", &update(&Setting::new(&name), planned)?)
                    .await?
            }
        };
        Ok(to_state(&setting))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (_, name) = object_id(state)?;
        Ok(self.settings.get("", &name).await?.map(|s| to_state(&s)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (_, name) = object_id(prior)?;
        info!("Updating setting {}", name);
        let current = self
            .settings
            .get("", &name)
            .await?
            .ok_or_else(|| Error::not_found("Setting", &name))?;
        let updated = self
            .settings
            .replace("", &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (_, name) = object_id(prior)?;
        info!("Resetting setting {}", name);
        let Some(mut setting) = self.settings.get("", &name).await? else {
            warn!("setting {} already deleted", name);
            return Ok(());
        };
        setting.value = Some(String::new());
        reset_managed_metadata(&mut setting.metadata);
        self.settings.replace("", &name, &setting).await?;
        Ok(())
    }
}
