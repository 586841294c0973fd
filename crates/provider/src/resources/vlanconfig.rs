//! harvester_vlanconfig: VlanConfig

use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::network::*;
use harvester_common::constants::{RESOURCE_TYPE_VLAN_CONFIG, STATE_REMOVED, STATE_REMOVING};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, as_string_list, as_string_map, construct, metadata_processors,
    reset_managed_metadata, Processor,
};
use crate::importer::{state_from_condition, Importer};
use crate::poll::{wait_for_state, Timeouts};
use crate::schema::{cluster_attributes, Attribute, Block, NestedBlock, Schema};
use crate::state::{
    get_string_attr, int_value, list_value, make_state, null_value,
    optional_string_value, string_list_value, string_map_value, string_value, Value,
};
use crate::validators;

const CONDITION_READY: &str = "ready";

fn uplink_block() -> Block {
    Block::new()
        .attribute(
            Attribute::string_list("nics")
                .required()
                .validate(validators::not_empty())
                .description(
                    "NICs attached to the bond; one NIC leaves the bond with a single member",
                ),
        )
        .attribute(
            Attribute::string("bond_mode")
                .default(string_value(BOND_MODE_ACTIVE_BACKUP))
                .validate(validators::string_in_slice(BOND_MODES)),
        )
        .attribute(
            Attribute::number("bond_miimon")
                .optional()
                .computed()
                .validate(validators::int_at_least(-1)),
        )
        .attribute(
            Attribute::number("mtu")
                .optional()
                .computed()
                .validate(validators::int_between(0, 9000)),
        )
        .attribute(
            Attribute::number("txqlen")
                .optional()
                .computed()
                .validate(validators::int_at_least(-1)),
        )
        .attribute(Attribute::string("hardware_addr").optional().computed())
}

pub fn schema() -> Schema {
    Schema::new(
        Block::new()
            .attributes(cluster_attributes())
            .attribute(
                Attribute::string("cluster_network_name")
                    .required()
                    .force_new()
                    .validate(validators::dns1123()),
            )
            .attribute(
                Attribute::string_map("node_selector")
                    .optional()
                    .description(
                        "Nodes the uplink configuration applies to; empty selects every node",
                    ),
            )
            .attribute(Attribute::string_list("matched_nodes").computed())
            .block(
                NestedBlock::list("uplink", uplink_block())
                    .min_items(1)
                    .max_items(1),
            ),
    )
}

fn parse_uplink(v: &Value) -> Result<Uplink> {
    let nics = v.get("nics").map(as_string_list).unwrap_or_default();
    if nics.is_empty() {
        return Err(Error::Validation("uplink nics must not be empty".into()));
    }
    let mode = get_string_attr(v, "bond_mode");
    let miimon = v.get("bond_miimon").and_then(Value::as_i64);
    let mtu = v.get("mtu").and_then(Value::as_i64).filter(|m| *m != 0);
    let tx_q_len = v.get("txqlen").and_then(Value::as_i64).filter(|t| *t != 0);
    let hardware_addr = v
        .get("hardware_addr")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let link_attributes = (mtu.is_some() || tx_q_len.is_some() || hardware_addr.is_some())
        .then_some(LinkAttributes {
            mtu,
            tx_q_len,
            hardware_addr,
        });
    Ok(Uplink {
        nics,
        link_attributes,
        bond_options: Some(BondOptions {
            mode: if mode.is_empty() {
                BOND_MODE_ACTIVE_BACKUP.to_string()
            } else {
                mode
            },
            miimon,
        }),
    })
}

fn processors<'a>() -> Vec<Processor<'a, VlanConfig>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("cluster_network_name", |vc: &mut VlanConfig, v| {
            vc.spec.cluster_network = as_string(v);
            Ok(())
        })
        .required(),
        Processor::new("node_selector", |vc: &mut VlanConfig, v| {
            vc.spec.node_selector = as_string_map(v);
            Ok(())
        }),
        Processor::new("uplink", |vc: &mut VlanConfig, v| {
            vc.spec.uplink = parse_uplink(v)?;
            Ok(())
        })
        .required()
        .each(),
    ]);
    processors
}

fn check_uplink(vc: &VlanConfig) -> Result<()> {
    if vc.spec.uplink.nics.is_empty() {
        return Err(Error::Validation("uplink is required".into()));
    }
    Ok(())
}

pub fn build(data: &Value) -> Result<VlanConfig> {
    let mut vc = VlanConfig::new(&get_string_attr(data, "name"), VlanConfigSpec::default());
    construct(&mut vc, data, &processors())?;
    check_uplink(&vc)?;
    vc.metadata.namespace = None;
    Ok(vc)
}

pub fn update(current: &VlanConfig, data: &Value) -> Result<VlanConfig> {
    let mut vc = current.clone();
    reset_managed_metadata(&mut vc.metadata);
    vc.spec.node_selector.clear();
    vc.spec.uplink = Uplink::default();
    construct(&mut vc, data, &processors())?;
    check_uplink(&vc)?;
    vc.metadata.namespace = None;
    Ok(vc)
}

fn uplink_state(uplink: &Uplink) -> Value {
    let link = uplink.link_attributes.clone().unwrap_or_default();
    let bond = uplink.bond_options.clone().unwrap_or_default();
    make_state(vec![
        ("nics", string_list_value(uplink.nics.iter().cloned())),
        ("bond_mode", string_value(bond.mode)),
        ("bond_miimon", bond.miimon.map(int_value).unwrap_or_else(null_value)),
        ("mtu", link.mtu.map(int_value).unwrap_or_else(null_value)),
        ("txqlen", link.tx_q_len.map(int_value).unwrap_or_else(null_value)),
        ("hardware_addr", optional_string_value(link.hardware_addr)),
    ])
}

pub fn to_state(vc: &VlanConfig) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_VLAN_CONFIG, &vc.metadata);
    let status = vc.status.clone().unwrap_or_default();
    let (state, message) = state_from_condition(&status.conditions, CONDITION_READY);
    let node_selector = if vc.spec.node_selector.is_empty() {
        Value::Null
    } else {
        string_map_value(&vc.spec.node_selector)
    };
    importer
        .set("cluster_network_name", string_value(&vc.spec.cluster_network))
        .set("node_selector", node_selector)
        .set("uplink", list_value(vec![uplink_state(&vc.spec.uplink)]))
        .set("matched_nodes", string_list_value(status.matched_nodes))
        .set_state(&state, &message);
    importer.into_state()
}

pub struct VlanConfigResource {
    configs: Arc<dyn ObjectApi<VlanConfig>>,
    timeouts: Timeouts,
}

impl VlanConfigResource {
    pub fn new(configs: Arc<dyn ObjectApi<VlanConfig>>) -> Self {
        Self {
            configs,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

#[async_trait]
impl Resource for VlanConfigResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (_, name) = planned_id(planned, false);
        info!("Creating vlanconfig {}", name);
        let created = self.configs.create("", &build(planned)?).await?;
        Ok(to_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (_, name) = object_id(state)?;
        Ok(self.configs.get("", &name).await?.map(|vc| to_state(&vc)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (_, name) = object_id(prior)?;
        info!("Updating vlanconfig {}", name);
        let current = self
            .configs
            .get("", &name)
            .await?
            .ok_or_else(|| Error::not_found("VlanConfig", &name))?;
        let updated = self
            .configs
            .replace("", &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (_, name) = object_id(prior)?;
        info!("Deleting vlanconfig {}", name);
        if !self.configs.delete("", &name).await? {
            warn!("vlanconfig {} already deleted", name);
            return Ok(());
        }

        // The uplink is torn down on every matched node before the object goes.
        let wait = self
            .timeouts
            .wait(format!("vlanconfig {} to be removed", name), self.timeouts.delete)
            .pending(&[STATE_REMOVING])
            .target(&[STATE_REMOVED]);
        wait_for_state(&wait, || async {
            let state = match self.configs.get("", &name).await? {
                Some(_) => STATE_REMOVING,
                None => STATE_REMOVED,
            };
            Ok(((), state.to_string()))
        })
        .await
    }
}
