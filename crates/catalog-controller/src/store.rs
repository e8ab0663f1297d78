//! Resource storage seam
//!
//! Reconcilers read and write catalog objects only through [`ResourceStore`].
//! [`KubeStore`] talks to the API server; [`crate::memory::MemoryStore`]
//! backs tests. Writes are optimistic: an update carrying a stale
//! `resourceVersion` fails with [`Error::Conflict`] and the caller retries
//! through its queue.

use async_trait::async_trait;
use catalog_common::crd::{
    CatalogResource, ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan,
};
use catalog_common::{Error, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tracing::warn;

use crate::key::ObjectKey;

/// A change observed on a stored object
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    /// Created, updated, or present at watch start
    Applied(K),
    /// Removed from the store
    Deleted(K),
}

/// Typed access to one kind of catalog object
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    /// Latest copy of the object, if it exists
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// Every object of this kind
    async fn list(&self) -> Result<Vec<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec; the status is left as stored
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace the status subresource only
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Request deletion; objects holding finalizers linger until released
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Current objects followed by live changes
    fn watch(&self) -> BoxStream<'static, WatchEvent<K>>;
}

/// Catalog kinds that know how to build their [`Api`]
pub trait KubeResource: CatalogResource {
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! cluster_scoped {
    ($($kind:ty),+) => {
        $(impl KubeResource for $kind {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        })+
    };
}

macro_rules! namespaced {
    ($($kind:ty),+) => {
        $(impl KubeResource for $kind {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::all(client),
                }
            }
        })+
    };
}

cluster_scoped!(ServiceBroker, ServiceClass, ServicePlan);
namespaced!(ServiceInstance, ServiceBinding);

/// [`ResourceStore`] backed by the Kubernetes API server
pub struct KubeStore<K> {
    client: Client,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K: KubeResource> KubeStore<K> {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: std::marker::PhantomData,
        }
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        K::api(self.client.clone(), namespace)
    }

    fn map_err(key: &ObjectKey, err: kube::Error) -> Error {
        Error::from_kube(&K::kind(&()), &key.to_string(), err)
    }
}

#[async_trait]
impl<K: KubeResource> ResourceStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        self.api(key.namespace.as_deref())
            .get_opt(&key.name)
            .await
            .map_err(|e| Self::map_err(key, e))
    }

    async fn list(&self) -> Result<Vec<K>> {
        let list = self.api(None).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(&key, e))
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        self.api(key.namespace.as_deref())
            .replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| Self::map_err(&key, e))
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let body = serde_json::to_vec(obj)?;
        self.api(key.namespace.as_deref())
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| Self::map_err(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        self.api(key.namespace.as_deref())
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| Self::map_err(key, e))?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        let api: Api<K> = Api::all(self.client.clone());
        watcher(api, watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                        Some(WatchEvent::Applied(obj))
                    }
                    Ok(watcher::Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => None,
                    Err(e) => {
                        warn!(kind = K::LABEL, error = %e, "Watch stream error");
                        None
                    }
                }
            })
            .boxed()
    }
}
