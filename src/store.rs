use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    Resource, ResourceExt,
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    client::Client,
};
use serde::{Serialize, de::DeserializeOwned};

use crate::{Error, Result};

/// Anything the reconcilers read or write through a [`Store`].
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Object store keyed by (kind, namespace, name).
///
/// Every call is a single request. `update` and `update_status` are
/// optimistic: a stale `resourceVersion` fails and the caller re-reads on
/// its next pass.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `Ok(None)` when the object does not exist.
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>>;

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Writes everything except status.
    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K>;

    /// Writes status only.
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K>;

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>>;

    /// Deleting something that is already gone succeeds.
    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Renders a label map as a `k=v,k=v` selector.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn object_key<K: Resource>(obj: &K) -> Result<(String, String)> {
    let namespace = obj.namespace().ok_or(Error::MissingObjectKey("namespace"))?;
    let name = obj.meta().name.clone().ok_or(Error::MissingObjectKey("name"))?;
    Ok((namespace, name))
}

/// [`Store`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api<K: StoreObject>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        self.api::<K>(namespace)
            .get_opt(name)
            .await
            .map_err(Error::KubeError)
    }

    async fn create<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, _) = object_key(obj)?;
        self.api::<K>(&namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    async fn update<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        self.api::<K>(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(Error::KubeError)
    }

    /// Status fields must serialize `None` as `null`; an omitted key would
    /// leave the stored value in place under merge-patch rules.
    async fn update_status<K: StoreObject>(&self, obj: &K) -> Result<K> {
        let (namespace, name) = object_key(obj)?;
        let value = serde_json::to_value(obj).map_err(Error::SerializationError)?;
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": value.get("status").cloned().unwrap_or_default(),
        });
        self.api::<K>(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::KubeError)
    }

    async fn list<K: StoreObject>(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>> {
        let lp = ListParams::default().labels(&label_selector(selector));
        self.api::<K>(namespace)
            .list(&lp)
            .await
            .map(|list| list.items)
            .map_err(Error::KubeError)
    }

    async fn delete<K: StoreObject>(&self, namespace: &str, name: &str) -> Result<()> {
        match self.api::<K>(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}
