//! harvester_clusternetwork: ClusterNetwork

use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::api::network::ClusterNetwork;
use harvester_common::constants::{RESOURCE_TYPE_CLUSTER_NETWORK, STATE_ACTIVE};
use harvester_common::{Error, Result};
use tracing::{info, warn};

use super::{object_id, planned_id, Resource};
use crate::client::ObjectApi;
use crate::constructor::{construct, metadata_processors, reset_managed_metadata};
use crate::importer::{state_from_condition, Importer};
use crate::schema::{cluster_attributes, Block, Schema};
use crate::state::{get_string_attr, Value};

const CONDITION_READY: &str = "ready";

pub fn schema() -> Schema {
    Schema::new(Block::new().attributes(cluster_attributes()))
}

pub fn build(data: &Value) -> Result<ClusterNetwork> {
    let mut network = ClusterNetwork::new(&get_string_attr(data, "name"));
    construct(&mut network, data, &metadata_processors())?;
    network.metadata.namespace = None;
    Ok(network)
}

pub fn update(current: &ClusterNetwork, data: &Value) -> Result<ClusterNetwork> {
    let mut network = current.clone();
    reset_managed_metadata(&mut network.metadata);
    construct(&mut network, data, &metadata_processors())?;
    network.metadata.namespace = None;
    Ok(network)
}

pub fn to_state(network: &ClusterNetwork) -> Value {
    let mut importer = Importer::from_meta(RESOURCE_TYPE_CLUSTER_NETWORK, &network.metadata);
    // mgmt and freshly created networks carry no ready condition
    let (state, message) = match network.status.as_ref() {
        Some(status) if !status.conditions.is_empty() => {
            state_from_condition(&status.conditions, CONDITION_READY)
        }
        _ => (STATE_ACTIVE.to_string(), String::new()),
    };
    importer.set_state(&state, &message);
    importer.into_state()
}

pub struct ClusterNetworkResource {
    networks: Arc<dyn ObjectApi<ClusterNetwork>>,
}

impl ClusterNetworkResource {
    pub fn new(networks: Arc<dyn ObjectApi<ClusterNetwork>>) -> Self {
        Self { networks }
    }
}

#[async_trait]
impl Resource for ClusterNetworkResource {
    async fn create(&self, planned: &Value) -> Result<Value> {
        let (_, name) = planned_id(planned, false);
        info!("Creating cluster network {}", name);
        let created = self.networks.create("", &build(planned)?).await?;
        Ok(to_state(&created))
    }

    async fn read(&self, state: &Value) -> Result<Option<Value>> {
        let (_, name) = object_id(state)?;
        Ok(self.networks.get("", &name).await?.map(|n| to_state(&n)))
    }

    async fn update(&self, prior: &Value, planned: &Value) -> Result<Value> {
        let (_, name) = object_id(prior)?;
        info!("Updating cluster network {}", name);
        let current = self
            .networks
            .get("", &name)
            .await?
            .ok_or_else(|| Error::not_found("ClusterNetwork", &name))?;
        let updated = self
            .networks
            .replace("", &name, &update(&current, planned)?)
            .await?;
        Ok(to_state(&updated))
    }

    async fn delete(&self, prior: &Value) -> Result<()> {
        let (_, name) = object_id(prior)?;
        info!("Deleting cluster network {}", name);
        if !self.networks.delete("", &name).await? {
            warn!("cluster network {} already deleted", name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::MemoryApi;
    use crate::state::{make_state, string_value};

    #[tokio::test]
    async fn test_lifecycle() {
        let api = MemoryApi::<ClusterNetwork>::new().arc();
        let resource = ClusterNetworkResource::new(api.clone());
        let planned = make_state(vec![
            ("name", string_value("data")),
            ("description", string_value("storage traffic")),
        ]);
        let state = resource.create(&planned).await.unwrap();
        assert_eq!(get_string_attr(&state, "id"), "data");
        assert!(state.get("namespace").is_none());
        assert_eq!(get_string_attr(&state, "description"), "storage traffic");
        assert_eq!(get_string_attr(&state, "state"), STATE_ACTIVE);

        let stored = api.stored("", "data").unwrap();
        assert_eq!(stored.kind, "ClusterNetwork");

        let mut changed = state.clone();
        changed.set("description", string_value("replication"));
        let state = resource.update(&state, &changed).await.unwrap();
        assert_eq!(get_string_attr(&state, "description"), "replication");

        resource.delete(&state).await.unwrap();
        assert!(resource.read(&state).await.unwrap().is_none());
    }
}
