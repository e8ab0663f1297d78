//! Access to core Kubernetes objects: secrets and namespaces

use std::collections::BTreeMap;

use async_trait::async_trait;
use catalog_common::{Error, Result, CONTROLLER_NAME};
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Decoded secret contents
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Secret and namespace operations needed by the reconcilers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CoreClient: Send + Sync {
    /// Read a secret's data, `None` when it does not exist
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// Create or replace a secret
    ///
    /// # Arguments
    ///
    /// * `namespace` - Namespace of the secret
    /// * `name` - Name of the secret
    /// * `data` - Full contents; keys absent here are removed
    /// * `owner` - Owner reference so the secret is garbage collected with its owner
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<()>;

    /// Delete a secret; a missing secret is not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    /// UID of a namespace, `None` when it does not exist
    async fn namespace_uid(&self, name: &str) -> Result<Option<String>>;
}

/// [`CoreClient`] backed by the Kubernetes API server
pub struct KubeCoreClient {
    client: Client,
}

impl KubeCoreClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CoreClient for KubeCoreClient {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube("Secret", &format!("{namespace}/{name}"), e))?;
        Ok(secret.map(|s| {
            s.data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect()
        }))
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: owner.map(|o| vec![o]),
                ..Default::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(k, v)| (k, ByteString(v)))
                    .collect(),
            ),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };

        api.patch(
            name,
            &PatchParams::apply(CONTROLLER_NAME).force(),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(|e| Error::from_kube("Secret", &format!("{namespace}/{name}"), e))?;
        debug!(namespace, name, "Applied secret");
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(Error::from_kube("Secret", &format!("{namespace}/{name}"), e)),
        }
    }

    async fn namespace_uid(&self, name: &str) -> Result<Option<String>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = api
            .get_opt(name)
            .await
            .map_err(|e| Error::from_kube("Namespace", name, e))?;
        Ok(namespace.and_then(|ns| ns.metadata.uid))
    }
}
