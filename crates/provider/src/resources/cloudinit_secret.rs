//! harvester_cloudinit_secret: Secret holding cloud-init user and network data

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use harvester_common::constants::{RESOURCE_TYPE_CLOUDINIT_SECRET, STATE_ACTIVE};
use harvester_common::{Error, Result};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, construct, metadata_processors, new_meta, reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::schema::{namespaced_attributes, Attribute, Block, Schema};
use crate::state::{get_string_attr, string_value, Value};
use crate::validators;

pub const SECRET_KEY_USER_DATA: &str = "userdata";
pub const SECRET_KEY_NETWORK_DATA: &str = "networkdata";

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::string("user_data")
                    .optional()
                    .conflicts_with(&["user_data_base64"]),
            )
            .attribute(
                Attribute::string("user_data_base64")
                    .optional()
                    .conflicts_with(&["user_data"])
                    .validate(validators::base64()),
            )
            .attribute(
                Attribute::string("network_data")
                    .optional()
                    .conflicts_with(&["network_data_base64"]),
            )
            .attribute(
                Attribute::string("network_data_base64")
                    .optional()
                    .conflicts_with(&["network_data"])
                    .validate(validators::base64()),
            ),
    )
}

fn decode(v: &Value) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(as_string(v).trim())?)
}

fn put(secret: &mut Secret, key: &str, bytes: Vec<u8>) {
    secret
        .data
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), ByteString(bytes));
}

fn processors<'a>() -> Vec<Processor<'a, Secret>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("user_data", |secret: &mut Secret, v| {
            put(secret, SECRET_KEY_USER_DATA, as_string(v).into_bytes());
            Ok(())
        }),
        Processor::new("user_data_base64", |secret: &mut Secret, v| {
            put(secret, SECRET_KEY_USER_DATA, decode(v)?);
            Ok(())
        }),
        Processor::new("network_data", |secret: &mut Secret, v| {
            put(secret, SECRET_KEY_NETWORK_DATA, as_string(v).into_bytes());
            Ok(())
        }),
        Processor::new("network_data_base64", |secret: &mut Secret, v| {
            put(secret, SECRET_KEY_NETWORK_DATA, decode(v)?);
            Ok(())
        }),
    ]);
    processors
}

pub fn build(data: &Value) -> Result<Secret> {
    let mut secret = Secret {
        metadata: new_meta(data),
        ..Default::default()
    };
    construct(&mut secret, data, &processors())?;
    Ok(secret)
}

pub fn update(current: &Secret, data: &Value) -> Result<Secret> {
    let mut secret = current.clone();
    reset_managed_metadata(&mut secret.metadata);
    if let Some(entries) = secret.data.as_mut() {
        entries.remove(SECRET_KEY_USER_DATA);
        entries.remove(SECRET_KEY_NETWORK_DATA);
    }
    construct(&mut secret, data, &processors())?;
    Ok(secret)
}

/// Bytes stored under `key`, decoded as text or base64 depending on which
/// attribute the configuration uses.
fn data_attributes(secret: &Secret, key: &str, prefer_base64: bool) -> (Value, Value) {
    let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) else {
        return (Value::Null, Value::Null);
    };
    match String::from_utf8(bytes.0.clone()) {
        Ok(text) if !prefer_base64 => (string_value(text), Value::Null),
        _ => (
            Value::Null,
            string_value(base64::engine::general_purpose::STANDARD.encode(&bytes.0)),
        ),
    }
}

/// `prior` carries the configuration seen last; it decides between the
/// plain and the base64 attribute for each payload.
pub fn to_state(secret: &Secret, prior: &Value) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_CLOUDINIT_SECRET, &secret.metadata);
    let (user_data, user_data_base64) = data_attributes(
        secret,
        SECRET_KEY_USER_DATA,
        !get_string_attr(prior, "user_data_base64").is_empty(),
    );
    let (network_data, network_data_base64) = data_attributes(
        secret,
        SECRET_KEY_NETWORK_DATA,
        !get_string_attr(prior, "network_data_base64").is_empty(),
    );
    importer
        .set("user_data", user_data)
        .set("user_data_base64", user_data_base64)
        .set("network_data", network_data)
        .set("network_data_base64", network_data_base64)
        .set_state(STATE_ACTIVE, "");
    importer.into_state()
}

pub struct CloudInitSecretResource {
    secrets: Arc<dyn ObjectApi<Secret>>,
}

impl CloudInitSecretResource {
    pub fn new(secrets: Arc<dyn ObjectApi<Secret>>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl Resource for CloudInitSecretResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating cloud-init secret {}/{}", namespace, name);
        let created = self.secrets.create(&namespace, &build(planned)?).await?;
        Ok(to_state(&created, planned))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        Ok(self
            .secrets
            .get(&namespace, &name)
            .await?
            .map(|s| to_state(&s, state)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating cloud-init secret {}/{}", namespace, name);
        let current = self
            .secrets
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, name)))?;
        let updated = self
            .secrets
            .replace(&namespace, &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated, planned))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting cloud-init secret {}/{}", namespace, name);
        if !self.secrets.delete(&namespace, &name).await? {
            warn!("cloud-init secret {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use crate::state::make_state;

    const USER_DATA: &str = "#cloud-config\npackages:\n  - qemu-guest-agent\n";

    #[test]
    fn test_plain_round_trip() {
        let planned = make_state(vec![
            ("name", string_value("cloud-config")),
            ("namespace", string_value("default")),
            ("user_data", string_value(USER_DATA)),
            ("network_data", string_value("")),
        ]);
        let secret = build(&planned).unwrap();
        let stored = &secret.data.as_ref().unwrap()[SECRET_KEY_USER_DATA];
        assert_eq!(stored.0, USER_DATA.as_bytes());
        assert!(!secret.data.as_ref().unwrap().contains_key(SECRET_KEY_NETWORK_DATA));

        let state = to_state(&secret, &planned);
        assert_eq!(get_string_attr(&state, "user_data"), USER_DATA);
        assert!(state.get("user_data_base64").unwrap().is_null());
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(USER_DATA);
        let planned = make_state(vec![
            ("name", string_value("cloud-config")),
            ("user_data_base64", string_value(&encoded)),
        ]);
        let secret = build(&planned).unwrap();
        assert_eq!(secret.data.as_ref().unwrap()[SECRET_KEY_USER_DATA].0, USER_DATA.as_bytes());
        let state = to_state(&secret, &planned);
        assert_eq!(get_string_attr(&state, "user_data_base64"), encoded);
        assert!(state.get("user_data").unwrap().is_null());
    }

    #[test]
    fn test_conflicting_pairs() {
        let config = make_state(vec![
            ("name", string_value("cloud-config")),
            ("user_data", string_value(USER_DATA)),
            ("user_data_base64", string_value("I2Nsb3VkLWNvbmZpZw==")),
        ]);
        let diags = schema().block.validate(&config);
        assert!(diags
            .iter()
            .any(|d| d.summary == "Conflicting configuration arguments"));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let planned = make_state(vec![
            ("name", string_value("cloud-config")),
            ("network_data_base64", string_value("not base64!")),
        ]);
        assert!(matches!(build(&planned), Err(Error::Base64(_))));
    }

    #[tokio::test]
    async fn test_update_switches_payload() {
        let api = MemoryApi::<Secret>::new().arc();
        let resource = CloudInitSecretResource::new(api.clone());
        let prior = resource
            .create(&make_state(vec![
                ("name", string_value("cloud-config")),
                ("user_data", string_value(USER_DATA)),
                ("network_data", string_value("version: 2\n")),
            ]))
            .await
            .unwrap();

        let mut changed = prior.clone();
        changed.set("network_data", Value::Null);
        let state = resource.update(&prior, &changed).await.unwrap();
        assert!(state.get("network_data").unwrap().is_null());
        let stored = api.stored("default", "cloud-config").unwrap();
        assert!(!stored.data.unwrap().contains_key(SECRET_KEY_NETWORK_DATA));

        resource.delete(&state).await.unwrap();
        assert!(resource.read(&state).await.unwrap().is_none());
    }
}
