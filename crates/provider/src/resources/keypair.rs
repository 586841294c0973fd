//! harvester_ssh_key: KeyPair

use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::find_condition;
use harvester_common::api::keypair::{KeyPair, KeyPairSpec};
use harvester_common::constants::{
    RESOURCE_TYPE_SSH_KEY, STATE_ACTIVE, STATE_FAILED, STATE_IN_PROGRESS,
};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, construct, metadata_processors, new_meta, reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::schema::{namespaced_attributes, Attribute, Block, Schema};
use crate::state::{string_value, Value};
use crate::validators;

const CONDITION_VALIDATED: &str = "validated";

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::string("public_key")
                    .required()
                    .validate(validators::not_empty()),
            )
            .attribute(Attribute::string("fingerprint").computed()),
    )
}

fn processors<'a>() -> Vec<Processor<'a, KeyPair>> {
    let mut processors = metadata_processors();
    processors.push(
        Processor::new("public_key", |kp: &mut KeyPair, v| {
            kp.spec.public_key = as_string(v).trim().to_string();
            Ok(())
        })
        .required(),
    );
    processors
}

pub fn build(data: &Value) -> Result<KeyPair> {
    let mut keypair = KeyPair {
        metadata: new_meta(data),
        spec: KeyPairSpec::default(),
        status: None,
    };
    construct(&mut keypair, data, &processors())?;
    Ok(keypair)
}

pub fn update(current: &KeyPair, data: &Value) -> Result<KeyPair> {
    let mut keypair = current.clone();
    reset_managed_metadata(&mut keypair.metadata);
    construct(&mut keypair, data, &processors())?;
    Ok(keypair)
}

pub fn to_state(keypair: &KeyPair) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_SSH_KEY, &keypair.metadata);
    let status = keypair.status.clone().unwrap_or_default();
    let (state, message) = match find_condition(&status.conditions, CONDITION_VALIDATED) {
        Some(c) if c.is_false() => (STATE_FAILED, c.message().to_string()),
        _ if !status.finger_print.is_empty() => (STATE_ACTIVE, String::new()),
        _ => (STATE_IN_PROGRESS, String::new()),
    };
    importer
        .set("public_key", string_value(&keypair.spec.public_key))
        .set("fingerprint", string_value(&status.finger_print))
        .set_state(state, &message);
    importer.into_state()
}

pub struct KeyPairResource {
    keypairs: Arc<dyn ObjectApi<KeyPair>>,
}

impl KeyPairResource {
    pub fn new(keypairs: Arc<dyn ObjectApi<KeyPair>>) -> Self {
        Self { keypairs }
    }
}

#[async_trait]
impl Resource for KeyPairResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating ssh key {}/{}", namespace, name);
        let created = self.keypairs.create(&namespace, &build(planned)?).await?;
        Ok(to_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        Ok(self.keypairs.get(&namespace, &name).await?.map(|k| to_state(&k)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating ssh key {}/{}", namespace, name);
        let current = self
            .keypairs
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| Error::not_found("KeyPair", format!("{}/{}", namespace, name)))?;
        let updated = self
            .keypairs
            .replace(&namespace, &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting ssh key {}/{}", namespace, name);
        if !self.keypairs.delete(&namespace, &name).await? {
            warn!("ssh key {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}
