//! Client for communicating with the Harvester cluster
//!
//! Handlers talk to the API server through [`ObjectApi`] handles, one per
//! object type, so tests can substitute an in-memory store.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use harvester_common::{Error, Result};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Typed CRUD on one kind of Kubernetes object. `namespace` is ignored for
/// cluster-scoped kinds.
#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    /// `None` when the object does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn list(&self, namespace: &str) -> Result<Vec<K>>;

    async fn create(&self, namespace: &str, obj: &K) -> Result<K>;

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K>;

    /// `false` when there was nothing to delete
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool>;
}

/// Bounds every object type handled by the provider satisfies
pub trait Object:
    Resource<DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// [`ObjectApi`] backed by the Kubernetes API server
pub struct KubeApi<K> {
    client: Client,
    scoped: fn(Client, &str) -> Api<K>,
}

impl<K: Object> KubeApi<K> {
    pub fn namespaced(client: Client) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self {
            client,
            scoped: |client, namespace| Api::namespaced(client, namespace),
        }
    }

    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            scoped: |client, _| Api::all(client),
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        (self.scoped)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K: Object> ObjectApi<K> for KubeApi<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        Ok(self.api(namespace).get_opt(name).await?)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<K>> {
        Ok(self
            .api(namespace)
            .list(&ListParams::default())
            .await?
            .items)
    }

    async fn create(&self, namespace: &str, obj: &K) -> Result<K> {
        Ok(self
            .api(namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K> {
        Ok(self
            .api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    debug!("{} {}/{} already gone", K::kind(&()), namespace, name);
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }
}

/// Handle to a Harvester cluster
#[derive(Clone)]
pub struct HarvesterClient {
    client: Client,
}

impl HarvesterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using a kubeconfig file and optional context
    pub async fn from_kubeconfig(path: &Path, context: Option<String>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            Error::InvalidConfig(format!(
                "failed to read kubeconfig {}: {}",
                path.display(),
                e
            ))
        })?;
        let options = KubeConfigOptions {
            context,
            ..Default::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| Error::InvalidConfig(format!("invalid kubeconfig: {}", e)))?;
        Ok(Self::new(Client::try_from(config)?))
    }

    pub fn namespaced<K>(&self) -> Arc<dyn ObjectApi<K>>
    where
        K: Object + Resource<Scope = NamespaceResourceScope>,
    {
        Arc::new(KubeApi::<K>::namespaced(self.client.clone()))
    }

    pub fn cluster<K: Object>(&self) -> Arc<dyn ObjectApi<K>> {
        Arc::new(KubeApi::<K>::cluster(self.client.clone()))
    }
}


#[cfg(test)]
mod tests {
    use super::memory::MemoryApi;
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    fn config_map(name: &str, revision: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.into());
        cm.metadata.namespace = Some("default".into());
        cm.metadata.uid = Some(revision.into());
        cm
    }

    #[tokio::test]
    async fn test_deleted_object_lingers() {
        let api = MemoryApi::new().linger(2);
        api.insert(config_map("settings", "rev-1"));

        assert!(api.delete("default", "settings").await.unwrap());
        assert_eq!(api.len(), 0);
        assert!(api.get("default", "settings").await.unwrap().is_some());
        assert!(api.delete("default", "settings").await.unwrap());
        assert!(api.get("default", "settings").await.unwrap().is_some());
        assert!(api.get("default", "settings").await.unwrap().is_none());
        assert_eq!(api.terminating(), 0);
        assert!(!api.delete("default", "settings").await.unwrap());
    }

    #[tokio::test]
    async fn test_successor_replaces_deleted_object() {
        let api = MemoryApi::new().linger(1).on_delete(|old: &ConfigMap| {
            let uid = old.metadata.uid.clone().unwrap_or_default();
            config_map("settings", &format!("{}-next", uid))
        });
        api.insert(config_map("settings", "rev-1"));

        api.delete("default", "settings").await.unwrap();
        let old = api.get("default", "settings").await.unwrap().unwrap();
        assert_eq!(old.metadata.uid.as_deref(), Some("rev-1"));
        let next = api.get("default", "settings").await.unwrap().unwrap();
        assert_eq!(next.metadata.uid.as_deref(), Some("rev-1-next"));
        assert_eq!(api.len(), 1);
    }
}
