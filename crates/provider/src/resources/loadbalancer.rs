//! harvester_loadbalancer: LoadBalancer

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::find_condition;
use harvester_common::api::loadbalancer::*;
use harvester_common::constants::{
    RESOURCE_TYPE_LOAD_BALANCER, STATE_ACTIVE, STATE_FAILED, STATE_IN_PROGRESS,
};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{
    as_string, construct, metadata_processors, new_meta, reset_managed_metadata, Processor,
};
use crate::importer::Importer;
use crate::poll::{wait_for_state, Timeouts};
use crate::schema::{namespaced_attributes, Attribute, Block, NestedBlock, Schema};
use crate::state::{
    get_int_attr, get_string_attr, get_string_list_attr, int_value, list_value,
    make_state, optional_string_value, string_list_value, string_value, Value,
};
use crate::validators;

const CONDITION_READY: &str = "Ready";
const PROTOCOLS: &[&str] = &["TCP", "UDP"];

pub fn schema() -> Schema {
    let listener = Block::new()
        .attribute(Attribute::string("name").optional())
        .attribute(
            Attribute::number("port")
                .required()
                .validate(validators::int_between(1, 65535)),
        )
        .attribute(
            Attribute::string("protocol")
                .default(string_value("TCP"))
                .validate(validators::string_in_slice(PROTOCOLS)),
        )
        .attribute(
            Attribute::number("backend_port")
                .required()
                .validate(validators::int_between(1, 65535)),
        );
    let backend_selector = Block::new()
        .attribute(
            Attribute::string("key")
                .required()
                .validate(validators::not_empty()),
        )
        .attribute(Attribute::string_list("values").required());
    let healthcheck = Block::new()
        .attribute(
            Attribute::number("port")
                .required()
                .validate(validators::int_between(1, 65535)),
        )
        .attribute(Attribute::number("success_threshold").default(int_value(1)))
        .attribute(Attribute::number("failure_threshold").default(int_value(3)))
        .attribute(Attribute::number("period_seconds").default(int_value(5)))
        .attribute(Attribute::number("timeout_seconds").default(int_value(3)));

    Schema::new(
        Block::new()
            .attributes(namespaced_attributes())
            .attribute(
                Attribute::string("workload_type")
                    .default(string_value(WORKLOAD_TYPE_VM))
                    .force_new()
                    .validate(validators::string_in_slice(&[
                        WORKLOAD_TYPE_VM,
                        WORKLOAD_TYPE_CLUSTER,
                    ])),
            )
            .attribute(
                Attribute::string("ipam")
                    .default(string_value(IPAM_POOL))
                    .force_new()
                    .validate(validators::string_in_slice(&[IPAM_POOL, IPAM_DHCP])),
            )
            .attribute(
                Attribute::string("ippool")
                    .optional()
                    .computed()
                    .force_new()
                    .description(
                        "IP pool to allocate from when ipam is pool; picked by selector when unset",
                    ),
            )
            .attribute(Attribute::string("ip_address").computed())
            .block(NestedBlock::list("listener", listener).min_items(1))
            .block(NestedBlock::list("backend_selector", backend_selector))
            .block(NestedBlock::list("healthcheck", healthcheck).max_items(1)),
    )
}

fn parse_listener(v: &Value) -> Listener {
    let port = get_int_attr(v, "port", 0);
    let name = match get_string_attr(v, "name") {
        n if n.is_empty() => format!("port-{}", port),
        n => n,
    };
    let protocol = match get_string_attr(v, "protocol") {
        p if p.is_empty() => "TCP".to_string(),
        p => p,
    };
    Listener {
        name,
        port,
        protocol,
        backend_port: get_int_attr(v, "backend_port", 0),
    }
}

fn parse_healthcheck(v: &Value) -> HealthCheck {
    HealthCheck {
        port: get_int_attr(v, "port", 0),
        success_threshold: get_int_attr(v, "success_threshold", 1),
        failure_threshold: get_int_attr(v, "failure_threshold", 3),
        period_seconds: get_int_attr(v, "period_seconds", 5),
        timeout_seconds: get_int_attr(v, "timeout_seconds", 3),
    }
}

fn processors<'a>() -> Vec<Processor<'a, LoadBalancer>> {
    let mut processors = metadata_processors();
    processors.extend(vec![
        Processor::new("workload_type", |lb: &mut LoadBalancer, v| {
            lb.spec.workload_type = as_string(v);
            Ok(())
        }),
        Processor::new("ipam", |lb: &mut LoadBalancer, v| {
            lb.spec.ipam = as_string(v);
            Ok(())
        }),
        Processor::new("ippool", |lb: &mut LoadBalancer, v| {
            lb.spec.ip_pool = as_string(v);
            Ok(())
        }),
        Processor::new("listener", |lb: &mut LoadBalancer, v| {
            lb.spec.listeners.push(parse_listener(v));
            Ok(())
        })
        .required()
        .each(),
        Processor::new("backend_selector", |lb: &mut LoadBalancer, v| {
            let key = get_string_attr(v, "key");
            let values = get_string_list_attr(v, "values");
            lb.spec.backend_server_selector.insert(key, values);
            Ok(())
        })
        .each(),
        Processor::new("healthcheck", |lb: &mut LoadBalancer, v| {
            lb.spec.health_check = Some(parse_healthcheck(v));
            Ok(())
        })
        .each(),
    ]);
    processors
}

fn check(lb: &LoadBalancer) -> Result<()> {
    if lb.spec.listeners.is_empty() {
        return Err(Error::Validation("at least one listener is required".into()));
    }
    if let Some(hc) = &lb.spec.health_check {
        if !lb.spec.listeners.iter().any(|l| l.backend_port == hc.port) {
            return Err(Error::Validation(format!(
                "healthcheck port {} does not match the backend port of any listener",
                hc.port
            )));
        }
    }
    Ok(())
}

pub fn build(data: &Value) -> Result<LoadBalancer> {
    let mut lb = LoadBalancer {
        metadata: new_meta(data),
        spec: LoadBalancerSpec {
            workload_type: WORKLOAD_TYPE_VM.to_string(),
            ipam: IPAM_POOL.to_string(),
            ..Default::default()
        },
        status: None,
    };
    construct(&mut lb, data, &processors())?;
    check(&lb)?;
    Ok(lb)
}

pub fn update(current: &LoadBalancer, data: &Value) -> Result<LoadBalancer> {
    let mut lb = current.clone();
    reset_managed_metadata(&mut lb.metadata);
    lb.spec.listeners = Vec::new();
    lb.spec.backend_server_selector = BTreeMap::new();
    lb.spec.health_check = None;
    construct(&mut lb, data, &processors())?;
    check(&lb)?;
    Ok(lb)
}

fn status_state(lb: &LoadBalancer) -> (String, String) {
    let status = lb.status.clone().unwrap_or_default();
    match find_condition(&status.conditions, CONDITION_READY) {
        Some(c) if c.is_false() => (STATE_FAILED.to_string(), c.message().to_string()),
        _ if !status.address.is_empty() => (STATE_ACTIVE.to_string(), String::new()),
        _ => (STATE_IN_PROGRESS.to_string(), String::new()),
    }
}

pub fn to_state(lb: &LoadBalancer) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_LOAD_BALANCER, &lb.metadata);
    let spec = &lb.spec;
    let status = lb.status.clone().unwrap_or_default();
    let (state, message) = status_state(lb);
    let ippool = status
        .allocated_address
        .as_ref()
        .map(|a| a.ip_pool.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| spec.ip_pool.clone());

    let listeners = spec
        .listeners
        .iter()
        .map(|l| {
            make_state(vec![
                ("name", string_value(&l.name)),
                ("port", int_value(l.port)),
                ("protocol", string_value(&l.protocol)),
                ("backend_port", int_value(l.backend_port)),
            ])
        })
        .collect();
    let selectors = spec
        .backend_server_selector
        .iter()
        .map(|(key, values)| {
            make_state(vec![
                ("key", string_value(key)),
                ("values", string_list_value(values.iter().cloned())),
            ])
        })
        .collect();
    let healthcheck = spec
        .health_check
        .iter()
        .map(|hc| {
            make_state(vec![
                ("port", int_value(hc.port)),
                ("success_threshold", int_value(hc.success_threshold)),
                ("failure_threshold", int_value(hc.failure_threshold)),
                ("period_seconds", int_value(hc.period_seconds)),
                ("timeout_seconds", int_value(hc.timeout_seconds)),
            ])
        })
        .collect();

    importer
        .set("workload_type", string_value(&spec.workload_type))
        .set("ipam", string_value(&spec.ipam))
        .set("ippool", optional_string_value(Some(ippool)))
        .set("ip_address", string_value(&status.address))
        .set("listener", list_value(listeners))
        .set("backend_selector", list_value(selectors))
        .set("healthcheck", list_value(healthcheck))
        .set_state(&state, &message);
    importer.into_state()
}

pub struct LoadBalancerResource {
    balancers: Arc<dyn ObjectApi<LoadBalancer>>,
    timeouts: Timeouts,
}

impl LoadBalancerResource {
    pub fn new(balancers: Arc<dyn ObjectApi<LoadBalancer>>) -> Self {
        Self {
            balancers,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    async fn wait_allocated(&self, namespace: &str, name: &str) -> Result<LoadBalancer> {
        let wait = self
            .timeouts
            .wait(format!("loadbalancer {}/{} address", namespace, name), self.timeouts.create)
            .pending(&[STATE_IN_PROGRESS])
            .target(&[STATE_ACTIVE]);
        wait_for_state(&wait, || async {
            let lb = self
                .balancers
                .get(namespace, name)
                .await?
                .ok_or_else(|| {
                    Error::not_found("LoadBalancer", format!("{}/{}", namespace, name))
                })?;
            let (state, message) = status_state(&lb);
            if state == STATE_FAILED {
                return Err(Error::Validation(format!(
                    "loadbalancer {}/{} failed: {}",
                    namespace, name, message
                )));
            }
            Ok((lb, state))
        })
        .await
    }
}

#[async_trait]
impl Resource for LoadBalancerResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (namespace, name) = planned_id(planned, true);
        info!("Creating loadbalancer {}/{}", namespace, name);
        self.balancers.create(&namespace, &build(planned)?).await?;
        let lb = self.wait_allocated(&namespace, &name).await?;
        Ok(to_state(&lb))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (namespace, name) = object_id(state)?;
        Ok(self.balancers.get(&namespace, &name).await?.map(|lb| to_state(&lb)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (namespace, name) = object_id(prior)?;
        info!("Updating loadbalancer {}/{}", namespace, name);
        let current = self
            .balancers
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| Error::not_found("LoadBalancer", format!("{}/{}", namespace, name)))?;
        let updated = self
            .balancers
            .replace(&namespace, &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (namespace, name) = object_id(prior)?;
        info!("Deleting loadbalancer {}/{}", namespace, name);
        if !self.balancers.delete(&namespace, &name).await? {
            warn!("loadbalancer {}/{} already deleted", namespace, name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;

    fn listener(port: i64, backend_port: i64) -> Value {
        make_state(vec![
            ("name", string_value(format!("http-{}", port))),
            ("port", int_value(port)),
            ("protocol", string_value("TCP")),
            ("backend_port", int_value(backend_port)),
        ])
    }

    fn planned() -> Value {
        make_state(vec![
            ("name", string_value("web")),
            ("namespace", string_value("default")),
            ("workload_type", string_value("vm")),
            ("ipam", string_value("pool")),
            ("ippool", string_value("service-pool")),
            ("listener", list_value(vec![listener(80, 8080)])),
            (
                "backend_selector",
                list_value(vec![make_state(vec![
                    ("key", string_value("app")),
                    ("values", string_list_value(["web"])),
                ])]),
            ),
            (
                "healthcheck",
                list_value(vec![make_state(vec![
                    ("port", int_value(8080)),
                    ("success_threshold", int_value(1)),
                    ("failure_threshold", int_value(3)),
                    ("period_seconds", int_value(5)),
                    ("timeout_seconds", int_value(3)),
                ])]),
            ),
        ])
    }

    fn allocated(lb: &mut LoadBalancer) {
        lb.status = Some(LoadBalancerStatus {
            address: "192.168.0.10".into(),
            allocated_address: Some(AllocatedAddress {
                ip_pool: "service-pool".into(),
                ip: "192.168.0.10".into(),
                ..Default::default()
            }),
            conditions: vec![],
        });
    }

    #[test]
    fn test_round_trip() {
        let state = to_state(&build(&planned()).unwrap());
        for key in [
            "workload_type",
            "ipam",
            "ippool",
            "listener",
            "backend_selector",
            "healthcheck",
        ] {
            assert_eq!(state.get(key), planned().get(key), "{}", key);
        }
    }

    #[test]
    fn test_healthcheck_must_target_a_backend() {
        let mut data = planned();
        data.set("listener", list_value(vec![listener(443, 8443)]));
        let err = build(&data).unwrap_err();
        assert!(err.to_string().contains("healthcheck port 8080"));
    }

    #[tokio::test]
    async fn test_create_waits_for_address() {
        let api = MemoryApi::<LoadBalancer>::new().on_write(allocated).arc();
        let resource = LoadBalancerResource::new(api.clone()).with_timeouts(Timeouts::fast());
        let state = resource.create(&planned()).await.unwrap();
        assert_eq!(get_string_attr(&state, "ip_address"), "192.168.0.10");
        assert_eq!(get_string_attr(&state, "state"), STATE_ACTIVE);

        let mut changed = state.clone();
        changed.set(
            "listener",
            list_value(vec![listener(8080, 8080), listener(9090, 9090)]),
        );
        resource.update(&state, &changed).await.unwrap();
        let stored = api.stored("default", "web").unwrap();
        assert_eq!(stored.spec.listeners.len(), 2);
        assert_eq!(stored.spec.listeners[0].port, 8080);
    }

    #[tokio::test]
    async fn test_create_times_out_without_address() {
        let api = MemoryApi::<LoadBalancer>::new().arc();
        let resource = LoadBalancerResource::new(api).with_timeouts(Timeouts::fast());
        let err = resource.create(&planned()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
