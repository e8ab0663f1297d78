//! Helpers for status writes, finalizers and events

use catalog_common::crd::CatalogResource;
use catalog_common::events::EventPublisher;
use catalog_common::{Result, FINALIZER};
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::debug;

use crate::store::ResourceStore;

pub(crate) fn is_deleting<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub(crate) fn has_finalizer<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == FINALIZER))
}

/// Add the controller finalizer, returning the stored object
pub(crate) async fn ensure_finalizer<K: CatalogResource>(
    store: &dyn ResourceStore<K>,
    obj: K,
) -> Result<K> {
    if has_finalizer(&obj) {
        return Ok(obj);
    }
    let mut updated = obj;
    updated
        .meta_mut()
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(FINALIZER.to_string());
    store.update(&updated).await
}

/// Drop the controller finalizer; an object already gone counts as done
pub(crate) async fn remove_finalizer<K: CatalogResource>(
    store: &dyn ResourceStore<K>,
    obj: &K,
) -> Result<()> {
    if !has_finalizer(obj) {
        return Ok(());
    }
    let mut updated = obj.clone();
    if let Some(finalizers) = updated.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != FINALIZER);
    }
    match store.update(&updated).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Persist `updated`'s status unless it equals `original`'s
pub(crate) async fn write_status<K: CatalogResource>(
    store: &dyn ResourceStore<K>,
    original: &K,
    updated: K,
) -> Result<K> {
    if original.status() == updated.status() {
        debug!(kind = K::LABEL, "Status unchanged, skipping write");
        return Ok(updated);
    }
    store.update_status(&updated).await
}

pub(crate) async fn normal_event<K: Resource<DynamicType = ()>>(
    events: &dyn EventPublisher,
    obj: &K,
    reason: &str,
    action: &str,
    message: impl Into<String>,
) {
    events
        .publish(
            &obj.object_ref(&()),
            EventType::Normal,
            reason,
            action,
            Some(message.into()),
        )
        .await;
}

pub(crate) async fn warning_event<K: Resource<DynamicType = ()>>(
    events: &dyn EventPublisher,
    obj: &K,
    reason: &str,
    action: &str,
    message: impl Into<String>,
) {
    events
        .publish(
            &obj.object_ref(&()),
            EventType::Warning,
            reason,
            action,
            Some(message.into()),
        )
        .await;
}
