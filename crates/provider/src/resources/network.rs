//! harvester_network: VLAN NetworkAttachmentDefinition

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::network::*;
use harvester_common::constants::{
    ANNOTATION_NETWORK_ROUTE, LABEL_CLUSTER_NETWORK, LABEL_NETWORK_TYPE,
    MANAGEMENT_CLUSTER_NETWORK, NETWORK_TYPE_VLAN, RESOURCE_TYPE_NETWORK, STATE_ACTIVE,
    STATE_FAILED,
};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_int, as_string, construct, metadata_processors, new_meta, reset_managed_metadata,
    Processor,
};
use crate::importer::Importer;
use crate::schema::{namespaced_attributes, Attribute, Block, Schema};
use crate::state::{get_string_attr, int_value, optional_string_value, string_value, Value};
use crate::validators;

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::number("vlan_id")
                    .required()
                    .validate(validators::int_between(0, 4094))
                    .description("e.g. 1-4094"),
            )
            .attribute(
                Attribute::string("cluster_network_name")
                    .default(string_value(MANAGEMENT_CLUSTER_NETWORK))
                    .force_new()
                    .validate(validators::dns1123()),
            )
            .attribute(
                Attribute::string("route_mode")
                    .default(string_value(ROUTE_MODE_AUTO))
                    .validate(validators::string_in_slice(&[ROUTE_MODE_AUTO, ROUTE_MODE_MANUAL])),
            )
            .attribute(
                Attribute::string("route_dhcp_server_ip")
                    .optional()
                    .validate(validators::ipv4()),
            )
            .attribute(Attribute::string("route_cidr").optional().validate(validators::cidr()))
            .attribute(
                Attribute::string("route_gateway")
                    .optional()
                    .validate(validators::ipv4()),
            )
            .attribute(Attribute::string("route_connectivity").computed())
            .attribute(Attribute::string("config").computed())
            .check(Arc::new(|config| {
                let mode = config
                    .get("route_mode")
                    .and_then(Value::as_str)
                    .unwrap_or(ROUTE_MODE_AUTO);
                if mode == ROUTE_MODE_MANUAL
                    && (get_string_attr(config, "route_cidr").is_empty()
                        || get_string_attr(config, "route_gateway").is_empty())
                {
                    return Err(
                        "route_cidr and route_gateway are required when route_mode is manual"
                            .into(),
                    );
                }
                Ok(())
            })),
    )
}

fn bridge_config(nad: &NetworkAttachmentDefinition) -> Result<BridgeConfig> {
    if nad.spec.config.is_empty() {
        let name = nad.metadata.name.as_deref().unwrap_or_default();
        return Ok(BridgeConfig::new(name, MANAGEMENT_CLUSTER_NETWORK, 0));
    }
    Ok(serde_json::from_str(&nad.spec.config)?)
}

fn with_bridge_config(
    nad: &mut NetworkAttachmentDefinition,
    apply: impl FnOnce(&mut BridgeConfig),
) -> Result<()> {
    let mut config = bridge_config(nad)?;
    apply(&mut config);
    nad.spec.config = serde_json::to_string(&config)?;
    Ok(())
}

pub fn route_config(nad: &NetworkAttachmentDefinition) -> Result<RouteConfig> {
    match nad
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_NETWORK_ROUTE))
    {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(RouteConfig::default()),
    }
}

fn with_route_config(
    nad: &mut NetworkAttachmentDefinition,
    apply: impl FnOnce(&mut RouteConfig),
) -> Result<()> {
    let mut route = route_config(nad)?;
    apply(&mut route);
    let raw = serde_json::to_string(&route)?;
    nad.metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(ANNOTATION_NETWORK_ROUTE.to_string(), raw);
    Ok(())
}

fn set_label(nad: &mut NetworkAttachmentDefinition, key: &str, value: &str) {
    nad.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

fn processors<'a>() -> Vec<Processor<'a, NetworkAttachmentDefinition>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("vlan_id", |nad: &mut NetworkAttachmentDefinition, v| {
            let vlan = u16::try_from(as_int(v))
                .ok()
                .filter(|id| *id <= 4094)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "expected vlan_id to be in the range (0 - 4094), got {}",
                        as_int(v)
                    ))
                })?;
            with_bridge_config(nad, |c| c.vlan = vlan)
        })
        .required(),
        Processor::new("cluster_network_name", |nad: &mut NetworkAttachmentDefinition, v| {
            let cluster_network = as_string(v);
            set_label(nad, LABEL_CLUSTER_NETWORK, &cluster_network);
            with_bridge_config(nad, |c| c.bridge = format!("{}-br", cluster_network))
        }),
        Processor::new("route_mode", |nad: &mut NetworkAttachmentDefinition, v| {
            let mode = as_string(v);
            with_route_config(nad, |r| r.mode = mode)
        }),
        Processor::new("route_dhcp_server_ip", |nad: &mut NetworkAttachmentDefinition, v| {
            let ip = as_string(v);
            with_route_config(nad, |r| r.server_ip_addr = ip)
        }),
        Processor::new("route_cidr", |nad: &mut NetworkAttachmentDefinition, v| {
            let cidr = as_string(v);
            with_route_config(nad, |r| r.cidr = cidr)
        }),
        Processor::new("route_gateway", |nad: &mut NetworkAttachmentDefinition, v| {
            let gateway = as_string(v);
            with_route_config(nad, |r| r.gateway = gateway)
        }),
    ]);
    processors
}

fn check_route(nad: &NetworkAttachmentDefinition) -> Result<()> {
    let route = route_config(nad)?;
    if route.mode == ROUTE_MODE_MANUAL && (route.cidr.is_empty() || route.gateway.is_empty()) {
        return Err(Error::Validation(
            "route_cidr and route_gateway are required when route_mode is manual".into(),
        ));
    }
    Ok(())
}

pub fn build(data: &Value) -> Result<NetworkAttachmentDefinition> {
    let mut nad = NetworkAttachmentDefinition {
        metadata: new_meta(data),
        spec: NetworkAttachmentDefinitionSpec::default(),
    };
    // Defaults the schema normally supplies
    set_label(&mut nad, LABEL_CLUSTER_NETWORK, MANAGEMENT_CLUSTER_NETWORK);
    set_label(&mut nad, LABEL_NETWORK_TYPE, NETWORK_TYPE_VLAN);
    construct(&mut nad, data, &processors())?;
    check_route(&nad)?;
    Ok(nad)
}

pub fn update(
    current: &NetworkAttachmentDefinition,
    data: &Value,
) -> Result<NetworkAttachmentDefinition> {
    let mut nad = current.clone();
    reset_managed_metadata(&mut nad.metadata);
    // Route settings are rebuilt from the configuration
    if let Some(annotations) = nad.metadata.annotations.as_mut() {
        annotations.remove(ANNOTATION_NETWORK_ROUTE);
    }
    construct(&mut nad, data, &processors())?;
    check_route(&nad)?;
    Ok(nad)
}

pub fn to_state(nad: &NetworkAttachmentDefinition) -> Result<Value> {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_NETWORK, &nad.metadata);
    let config = bridge_config(nad)?;
    let route = route_config(nad)?;
    let cluster_network = nad
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_CLUSTER_NETWORK))
        .cloned()
        .unwrap_or_else(|| {
            config
                .bridge
                .strip_suffix("-br")
                .unwrap_or(MANAGEMENT_CLUSTER_NETWORK)
                .to_string()
        });
    let (state, message) = match route.connectivity.as_str() {
        "" | "true" => (STATE_ACTIVE, String::new()),
        other => (STATE_FAILED, other.to_string()),
    };
    let mode = if route.mode.is_empty() {
        ROUTE_MODE_AUTO.to_string()
    } else {
        route.mode.clone()
    };

    importer
        .set("vlan_id", int_value(config.vlan.into()))
        .set("cluster_network_name", string_value(cluster_network))
        .set("route_mode", string_value(mode))
        .set("route_dhcp_server_ip", optional_string_value(Some(route.server_ip_addr)))
        .set("route_cidr", optional_string_value(Some(route.cidr)))
        .set("route_gateway", optional_string_value(Some(route.gateway)))
        .set("route_connectivity", string_value(route.connectivity))
        .set("config", string_value(&nad.spec.config))
        .set_state(state, &message);
    Ok(importer.into_state())
}

pub struct NetworkResource {
    networks: Arc<dyn ObjectApi<NetworkAttachmentDefinition>>,
}

impl NetworkResource {
    pub fn new(networks: Arc<dyn ObjectApi<NetworkAttachmentDefinition>>) -> Self {
        Self { networks }
    }
}

#[async_trait]
impl Resource for NetworkResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating network {}/{}", namespace, name);
        let created = self.networks.create(&namespace, &build(planned)?).await?;
        to_state(&created)
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        match self.networks.get(&namespace, &name).await? {
            Some(nad) => Ok(Some(to_state(&nad)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating network {}/{}", namespace, name);
        let current = self.networks.get(&namespace, &name).await?.ok_or_else(|| {
            Error::not_found("NetworkAttachmentDefinition", format!("{}/{}", namespace, name))
        })?;
        let updated = self
            .networks
            .replace(&namespace, &name, &update(&current, planned)?)
            .await?;
        to_state(&updated)
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting network {}/{}", namespace, name);
        if !self.networks.delete(&namespace, &name).await? {
            warn!("network {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}
