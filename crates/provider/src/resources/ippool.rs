//! harvester_ippool: IPPool

use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::loadbalancer::*;
use harvester_common::constants::RESOURCE_TYPE_IP_POOL;
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{construct, metadata_processors, reset_managed_metadata, Processor};
use crate::importer::{state_from_condition, Importer};
use crate::schema::{cluster_attributes, Attribute, Block, NestedBlock, Schema};
use crate::state::{
    get_int_attr, get_list_attr, get_string_attr, int_value, list_value, make_state,
    optional_string_value, string_value, Value,
};
use crate::validators;

const CONDITION_READY: &str = "Ready";

pub fn schema() -> Schema {
    let range = Block::new()
        .attribute(
            Attribute::string("subnet")
                .required()
                .validate(validators::cidr()),
        )
        .attribute(Attribute::string("start").optional().validate(validators::ipv4()))
        .attribute(Attribute::string("end").optional().validate(validators::ipv4()))
        .attribute(Attribute::string("gateway").optional().validate(validators::ipv4()));
    let scope = Block::new()
        .attribute(Attribute::string("project").optional())
        .attribute(Attribute::string("namespace").optional())
        .attribute(Attribute::string("guest_cluster").optional());
    let selector = Block::new()
        .attribute(Attribute::number("priority").optional())
        .attribute(
            Attribute::string("network")
                .optional()
                .validate(validators::namespaced_name())
                .description("Namespaced name of the VM network the pool serves"),
        )
        .block(NestedBlock::list("scope", scope));

    Schema::new(
        Block::new()
            .attributes(cluster_attributes())
            .block(NestedBlock::list("range", range).min_items(1))
            .block(NestedBlock::list("selector", selector).max_items(1)),
    )
}

fn parse_range(v: &Value) -> Result<IPRange> {
    let subnet = get_string_attr(v, "subnet");
    if subnet.is_empty() {
        return Err(Error::Validation("range subnet must not be empty".into()));
    }
    Ok(IPRange {
        subnet,
        range_start: get_string_attr(v, "start"),
        range_end: get_string_attr(v, "end"),
        gateway: get_string_attr(v, "gateway"),
    })
}

fn parse_selector(v: &Value) -> IPPoolSelector {
    IPPoolSelector {
        priority: get_int_attr(v, "priority", 0),
        network: get_string_attr(v, "network"),
        scope: get_list_attr(v, "scope")
            .iter()
            .map(|s| IPPoolScope {
                project: get_string_attr(s, "project"),
                namespace: get_string_attr(s, "namespace"),
                guest_cluster: get_string_attr(s, "guest_cluster"),
            })
            .collect(),
    }
}

fn processors<'a>() -> Vec<Processor<'a, IPPool>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("range", |pool: &mut IPPool, v| {
            pool.spec.ranges.push(parse_range(v)?);
            Ok(())
        })
        .required()
        .each(),
        Processor::new("selector", |pool: &mut IPPool, v| {
            pool.spec.selector = Some(parse_selector(v));
            Ok(())
        })
        .each(),
    ]);
    processors
}

fn check_ranges(pool: &IPPool) -> Result<()> {
    if pool.spec.ranges.is_empty() {
        return Err(Error::Validation("at least one range is required".into()));
    }
    Ok(())
}

pub fn build(data: &Value) -> Result<IPPool> {
    let mut pool = IPPool::new(&get_string_attr(data, "name"), IPPoolSpec::default());
    construct(&mut pool, data, &processors())?;
    check_ranges(&pool)?;
    pool.metadata.namespace = None;
    Ok(pool)
}

pub fn update(current: &IPPool, data: &Value) -> Result<IPPool> {
    let mut pool = current.clone();
    reset_managed_metadata(&mut pool.metadata);
    pool.spec.ranges = Vec::new();
    pool.spec.selector = None;
    construct(&mut pool, data, &processors())?;
    check_ranges(&pool)?;
    pool.metadata.namespace = None;
    Ok(pool)
}

fn range_state(range: &IPRange) -> Value {
    make_state(vec![
        ("subnet", string_value(&range.subnet)),
        ("start", optional_string_value(Some(&range.range_start))),
        ("end", optional_string_value(Some(&range.range_end))),
        ("gateway", optional_string_value(Some(&range.gateway))),
    ])
}

fn selector_state(selector: &IPPoolSelector) -> Value {
    let scope = selector
        .scope
        .iter()
        .map(|s| {
            make_state(vec![
                ("project", optional_string_value(Some(&s.project))),
                ("namespace", optional_string_value(Some(&s.namespace))),
                ("guest_cluster", optional_string_value(Some(&s.guest_cluster))),
            ])
        })
        .collect();
    make_state(vec![
        ("priority", int_value(selector.priority)),
        ("network", optional_string_value(Some(&selector.network))),
        ("scope", list_value(scope)),
    ])
}

pub fn to_state(pool: &IPPool) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_IP_POOL, &pool.metadata);
    let conditions = pool
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or(&[]);
    let (state, message) = state_from_condition(conditions, CONDITION_READY);
    importer
        .set(
            "range",
            list_value(pool.spec.ranges.iter().map(range_state).collect()),
        )
        .set(
            "selector",
            list_value(pool.spec.selector.iter().map(selector_state).collect()),
        )
        .set_state(&state, &message);
    importer.into_state()
}

pub struct IPPoolResource {
    pools: Arc<dyn ObjectApi<IPPool>>,
}

impl IPPoolResource {
    pub fn new(pools: Arc<dyn ObjectApi<IPPool>>) -> Self {
        Self { pools }
    }
}

#[async_trait]
impl Resource for IPPoolResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (_, name) = planned_id(planned, false);
        info!("Creating ip pool {}", name);
        let created = self.pools.create("", &build(planned)?).await?;
        Ok(to_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (_, name) = object_id(state)?;
        Ok(self.pools.get("", &name).await?.map(|p| to_state(&p)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (_, name) = object_id(prior)?;
        info!("Updating ip pool {}", name);
        let current = self
            .pools
            .get("", &name)
            .await?
            .ok_or_else(|| Error::not_found("IPPool", &name))?;
        let updated = self
            .pools
            .replace("", &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (_, name) = object_id(prior)?;
        info!("Deleting ip pool {}", name);
        if !self.pools.delete("", &name).await? {
            warn!("ip pool {} already deleted", name);
        }
        Ok(())
    }
}
