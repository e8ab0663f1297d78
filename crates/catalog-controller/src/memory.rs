//! In-memory [`ResourceStore`] and [`CoreClient`] with API-server semantics
//!
//! Mirrors what reconcilers rely on from Kubernetes: resource versions for
//! optimistic concurrency, generation bumps on spec changes, a status
//! subresource ignored on create, and finalizers that hold deletion open.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use catalog_common::crd::CatalogResource;
use catalog_common::{Error, Result};
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use tokio::sync::broadcast;
use tracing::warn;

use crate::core_client::{CoreClient, SecretData};
use crate::key::ObjectKey;
use crate::store::{ResourceStore, WatchEvent};

const WATCH_CAPACITY: usize = 1024;

struct Objects<K> {
    items: BTreeMap<ObjectKey, K>,
    version: u64,
}

impl<K> Objects<K> {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }
}

/// [`ResourceStore`] holding objects in a map
pub struct MemoryStore<K> {
    objects: Mutex<Objects<K>>,
    events: broadcast::Sender<WatchEvent<K>>,
}

impl<K: CatalogResource> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: CatalogResource> MemoryStore<K> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: Mutex::new(Objects {
                items: BTreeMap::new(),
                version: 0,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Objects<K>> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit(&self, event: WatchEvent<K>) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(event);
    }

    fn kind() -> String {
        K::kind(&()).into_owned()
    }

    fn check_version(current: &K, incoming: &K, key: &ObjectKey) -> Result<()> {
        if current.meta().resource_version != incoming.meta().resource_version {
            return Err(Error::conflict(Self::kind(), key.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<K: CatalogResource> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.lock().items.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.lock().items.values().cloned().collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        if objects.items.contains_key(&key) {
            return Err(Error::already_exists(Self::kind(), key.to_string()));
        }

        let mut stored = obj.clone();
        *stored.status_mut() = None;
        let meta = stored.meta_mut();
        meta.resource_version = objects.next_version();
        meta.generation = Some(1);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        meta.deletion_timestamp = None;

        objects.items.insert(key, stored.clone());
        drop(objects);
        self.emit(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        let Some(current) = objects.items.get(&key).cloned() else {
            return Err(Error::not_found(Self::kind(), key.to_string()));
        };
        Self::check_version(&current, obj, &key)?;

        let mut stored = obj.clone();
        *stored.status_mut() = current.status().cloned();
        let generation = current.meta().generation.unwrap_or(1);
        let meta = stored.meta_mut();
        meta.generation = Some(if obj.spec() != current.spec() {
            generation + 1
        } else {
            generation
        });
        meta.uid = current.meta().uid.clone();
        meta.creation_timestamp = current.meta().creation_timestamp.clone();
        meta.deletion_timestamp = current.meta().deletion_timestamp.clone();
        meta.resource_version = objects.next_version();

        let released = stored.meta().deletion_timestamp.is_some()
            && stored.meta().finalizers.as_ref().is_none_or(|f| f.is_empty());
        if released {
            objects.items.remove(&key);
            drop(objects);
            self.emit(WatchEvent::Deleted(stored.clone()));
        } else {
            objects.items.insert(key, stored.clone());
            drop(objects);
            self.emit(WatchEvent::Applied(stored.clone()));
        }
        Ok(stored)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let key = ObjectKey::of(obj);
        let mut objects = self.lock();
        let Some(current) = objects.items.get(&key).cloned() else {
            return Err(Error::not_found(Self::kind(), key.to_string()));
        };
        Self::check_version(&current, obj, &key)?;

        let mut stored = current;
        *stored.status_mut() = obj.status().cloned();
        stored.meta_mut().resource_version = objects.next_version();

        objects.items.insert(key, stored.clone());
        drop(objects);
        self.emit(WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let mut objects = self.lock();
        let Some(mut current) = objects.items.get(key).cloned() else {
            return Err(Error::not_found(Self::kind(), key.to_string()));
        };

        let has_finalizers = current
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if !has_finalizers {
            objects.items.remove(key);
            drop(objects);
            self.emit(WatchEvent::Deleted(current));
            return Ok(());
        }

        if current.meta().deletion_timestamp.is_none() {
            current.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
            current.meta_mut().resource_version = objects.next_version();
            objects.items.insert(key.clone(), current.clone());
            drop(objects);
            self.emit(WatchEvent::Applied(current));
        }
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, WatchEvent<K>> {
        // Subscribe under the lock so no change falls between snapshot and stream
        let objects = self.lock();
        let rx = self.events.subscribe();
        let snapshot: Vec<WatchEvent<K>> = objects
            .items
            .values()
            .cloned()
            .map(WatchEvent::Applied)
            .collect();
        drop(objects);

        let live = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(kind = K::LABEL, missed, "Watcher lagged behind store");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        futures::stream::iter(snapshot).chain(live).boxed()
    }
}

#[derive(Clone, Debug, PartialEq)]
struct StoredSecret {
    data: SecretData,
    owner: Option<OwnerReference>,
}

/// [`CoreClient`] holding secrets and namespaces in maps
#[derive(Default)]
pub struct MemoryCoreClient {
    secrets: Mutex<BTreeMap<ObjectKey, StoredSecret>>,
    namespaces: Mutex<BTreeMap<String, String>>,
}

impl MemoryCoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a namespace with a fresh UID, returning the UID
    pub fn add_namespace(&self, name: &str) -> String {
        let uid = uuid::Uuid::new_v4().to_string();
        self.namespaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.to_string(), uid.clone());
        uid
    }

    /// Store a secret directly, bypassing ownership
    pub fn insert_secret(&self, namespace: &str, name: &str, data: SecretData) {
        self.secrets_lock().insert(
            ObjectKey::namespaced(namespace, name),
            StoredSecret { data, owner: None },
        );
    }

    /// Secret contents, if present
    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.secrets_lock()
            .get(&ObjectKey::namespaced(namespace, name))
            .map(|s| s.data.clone())
    }

    /// Owner recorded on a secret, if any
    pub fn secret_owner(&self, namespace: &str, name: &str) -> Option<OwnerReference> {
        self.secrets_lock()
            .get(&ObjectKey::namespaced(namespace, name))
            .and_then(|s| s.owner.clone())
    }

    fn secrets_lock(&self) -> MutexGuard<'_, BTreeMap<ObjectKey, StoredSecret>> {
        self.secrets.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl CoreClient for MemoryCoreClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        Ok(self.secret(namespace, name))
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<()> {
        self.secrets_lock().insert(
            ObjectKey::namespaced(namespace, name),
            StoredSecret { data, owner },
        );
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.secrets_lock()
            .remove(&ObjectKey::namespaced(namespace, name));
        Ok(())
    }

    async fn namespace_uid(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .namespaces
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_common::crd::{ServiceInstance, ServiceInstanceSpec, ServiceInstanceStatus};
    use catalog_common::FINALIZER;

    fn instance(name: &str) -> ServiceInstance {
        let mut instance = ServiceInstance::new(name, ServiceInstanceSpec::new("mysql", "small"));
        instance.metadata.namespace = Some("default".to_string());
        instance
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    #[tokio::test]
    async fn create_assigns_server_fields() {
        let store = MemoryStore::new();
        let mut obj = instance("db");
        obj.status = Some(ServiceInstanceStatus::default());
        let created = store.create(&obj).await.unwrap();

        assert_eq!(created.metadata.generation, Some(1));
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.resource_version.is_some());
        assert!(created.status.is_none(), "status is only written through update_status");
        assert!(store.create(&instance("db")).await.is_err());
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&instance("db")).await.unwrap();

        let mut first = created.clone();
        first.spec.service_plan_external_name = "large".to_string();
        store.update(&first).await.unwrap();

        let mut second = created;
        second.spec.service_plan_external_name = "medium".to_string();
        let err = store.update(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn spec_change_bumps_generation_and_keeps_status() {
        let store = MemoryStore::new();
        let mut obj = store.create(&instance("db")).await.unwrap();
        obj.status = Some(ServiceInstanceStatus {
            checksum: Some("abc".to_string()),
            ..Default::default()
        });
        let obj = store.update_status(&obj).await.unwrap();

        let mut edited = obj.clone();
        edited.spec.service_plan_external_name = "large".to_string();
        edited.status = None;
        let stored = store.update(&edited).await.unwrap();

        assert_eq!(stored.metadata.generation, Some(2));
        assert_eq!(
            stored.status.and_then(|s| s.checksum).as_deref(),
            Some("abc"),
            "update never touches status"
        );
    }

    #[tokio::test]
    async fn status_update_leaves_generation_alone() {
        let store = MemoryStore::new();
        let mut obj = store.create(&instance("db")).await.unwrap();
        obj.spec.service_plan_external_name = "ignored".to_string();
        obj.status = Some(ServiceInstanceStatus::default());
        let stored = store.update_status(&obj).await.unwrap();

        assert_eq!(stored.metadata.generation, Some(1));
        assert_eq!(stored.spec.service_plan_external_name, "small");
    }

    #[tokio::test]
    async fn finalizer_holds_deletion_until_released() {
        let store = MemoryStore::new();
        let mut obj = instance("db");
        obj.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        store.create(&obj).await.unwrap();

        store.delete(&key("db")).await.unwrap();
        let mut pending = store.get(&key("db")).await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        pending.metadata.finalizers = Some(vec![]);
        store.update(&pending).await.unwrap();
        assert!(store.get(&key("db")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_object_is_not_found() {
        let store: MemoryStore<ServiceInstance> = MemoryStore::new();
        let err = store.delete(&key("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn watch_replays_snapshot_then_live_changes() {
        let store = MemoryStore::new();
        store.create(&instance("a")).await.unwrap();

        let mut events = store.watch();
        store.create(&instance("b")).await.unwrap();
        store.delete(&key("a")).await.unwrap();

        let names: Vec<(bool, String)> = vec![
            events.next().await.unwrap(),
            events.next().await.unwrap(),
            events.next().await.unwrap(),
        ]
        .into_iter()
        .map(|e| match e {
            WatchEvent::Applied(o) => (true, o.metadata.name.unwrap_or_default()),
            WatchEvent::Deleted(o) => (false, o.metadata.name.unwrap_or_default()),
        })
        .collect();
        assert_eq!(
            names,
            vec![
                (true, "a".to_string()),
                (true, "b".to_string()),
                (false, "a".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn core_client_tracks_secret_owner() {
        let core = MemoryCoreClient::new();
        let owner = OwnerReference {
            name: "binding".to_string(),
            ..Default::default()
        };
        let data = SecretData::from([("user".to_string(), b"admin".to_vec())]);
        core.apply_secret("default", "creds", data.clone(), Some(owner))
            .await
            .unwrap();

        assert_eq!(core.secret("default", "creds"), Some(data));
        assert_eq!(
            core.secret_owner("default", "creds").map(|o| o.name),
            Some("binding".to_string())
        );

        core.delete_secret("default", "creds").await.unwrap();
        core.delete_secret("default", "creds").await.unwrap();
        assert!(core.secret("default", "creds").is_none());
    }
}
