//! Resolve an instance's references down to a broker client
//!
//! An instance names its class and plan by external name. Resolution finds
//! the class, the plan within that class, the owning broker, the broker's
//! credentials, and finally a [`BrokerClient`] for it.

use std::sync::Arc;

use catalog_common::crd::{
    BrokerAuthInfo, SecretReference, ServiceBroker, ServiceClass, ServiceInstanceSpec, ServicePlan,
};
use catalog_common::reason::{BindingReason, BrokerReason, InstanceReason};
use catalog_common::Error;
use catalog_osb::{AuthConfig, BrokerClient, BrokerError, ClientConfiguration};
use kube::ResourceExt;
use thiserror::Error as ThisError;

use crate::context::Context;
use crate::core_client::CoreClient;
use crate::key::ObjectKey;

/// Why references could not be resolved
#[derive(Debug, ThisError)]
pub enum ResolveError {
    #[error("references a non-existent ServiceClass {name:?}")]
    NonexistentClass { name: String },

    #[error("references a non-existent ServicePlan {plan:?} of ServiceClass {class:?}")]
    NonexistentPlan { class: String, plan: String },

    #[error("ServiceClass {class:?} references a non-existent ServiceBroker {broker:?}")]
    NonexistentBroker { class: String, broker: String },

    #[error("error getting auth credentials for broker {broker:?}: {message}")]
    AuthCredentials { broker: String, message: String },

    #[error("error creating client for broker {broker:?}: {source}")]
    Client { broker: String, source: BrokerError },

    #[error(transparent)]
    Store(#[from] Error),
}

impl ResolveError {
    /// Condition reason for an instance; `None` for store failures
    pub fn instance_reason(&self) -> Option<InstanceReason> {
        match self {
            Self::NonexistentClass { .. } => Some(InstanceReason::ReferencesNonexistentServiceClass),
            Self::NonexistentPlan { .. } => Some(InstanceReason::ReferencesNonexistentServicePlan),
            Self::NonexistentBroker { .. } => Some(InstanceReason::ReferencesNonexistentBroker),
            Self::AuthCredentials { .. } | Self::Client { .. } => {
                Some(InstanceReason::ErrorGettingAuthCredentials)
            }
            Self::Store(_) => None,
        }
    }

    /// Condition reason for a binding; `None` for store failures
    pub fn binding_reason(&self) -> Option<BindingReason> {
        match self {
            Self::NonexistentClass { .. } => Some(BindingReason::ReferencesNonexistentServiceClass),
            Self::NonexistentPlan { .. } => Some(BindingReason::ReferencesNonexistentServicePlan),
            Self::NonexistentBroker { .. } => Some(BindingReason::ReferencesNonexistentBroker),
            Self::AuthCredentials { .. } | Self::Client { .. } => {
                Some(BindingReason::ErrorGettingAuthCredentials)
            }
            Self::Store(_) => None,
        }
    }

    /// Condition reason for a broker; `None` for store failures
    pub fn broker_reason(&self) -> Option<BrokerReason> {
        match self {
            Self::AuthCredentials { .. } => Some(BrokerReason::ErrorGettingAuthCredentials),
            Self::Store(_) => None,
            _ => Some(BrokerReason::ErrorFetchingCatalog),
        }
    }

    /// Convert into the controller error returned to the queue
    pub fn into_error(self, resource: &str) -> Error {
        match self {
            Self::Store(e) => e,
            Self::Client { source, .. } => Error::broker("create client", source),
            Self::NonexistentClass { ref name } => {
                Error::reference("ServiceClass", name.clone(), format!("{resource} {self}"))
            }
            Self::NonexistentPlan { ref plan, .. } => {
                Error::reference("ServicePlan", plan.clone(), format!("{resource} {self}"))
            }
            Self::NonexistentBroker { ref broker, .. } => {
                Error::reference("ServiceBroker", broker.clone(), format!("{resource} {self}"))
            }
            Self::AuthCredentials { ref broker, .. } => {
                Error::reference("ServiceBroker", broker.clone(), self.to_string())
            }
        }
    }
}

/// Everything needed to talk to the broker serving an instance
pub struct Resolved {
    pub class: ServiceClass,
    pub plan: ServicePlan,
    pub broker: ServiceBroker,
    pub client: Arc<dyn BrokerClient>,
}

/// Resolve class, plan, broker and client for an instance spec
pub async fn resolve_instance(
    ctx: &Context,
    spec: &ServiceInstanceSpec,
) -> Result<Resolved, ResolveError> {
    let class = find_class(ctx, &spec.service_class_external_name).await?;
    let plan = find_plan(ctx, &class, &spec.service_plan_external_name).await?;
    let broker = ctx
        .brokers
        .get(&ObjectKey::cluster(&class.spec.broker_name))
        .await?
        .ok_or_else(|| ResolveError::NonexistentBroker {
            class: class.spec.external_name.clone(),
            broker: class.spec.broker_name.clone(),
        })?;
    let client = client_for_broker(ctx, &broker).await?;
    Ok(Resolved {
        class,
        plan,
        broker,
        client,
    })
}

/// Class with the given external name
///
/// Classes still in their broker's catalog win over removed ones, so an
/// instance of a withdrawn class can still be deprovisioned.
async fn find_class(ctx: &Context, external_name: &str) -> Result<ServiceClass, ResolveError> {
    let mut matches: Vec<ServiceClass> = ctx
        .classes
        .list()
        .await?
        .into_iter()
        .filter(|c| c.spec.external_name == external_name)
        .collect();
    matches.sort_by_key(|c| {
        c.status
            .as_ref()
            .is_some_and(|s| s.removed_from_broker_catalog)
    });
    matches
        .into_iter()
        .next()
        .ok_or_else(|| ResolveError::NonexistentClass {
            name: external_name.to_string(),
        })
}

async fn find_plan(
    ctx: &Context,
    class: &ServiceClass,
    external_name: &str,
) -> Result<ServicePlan, ResolveError> {
    let class_name = class.name_any();
    ctx.plans
        .list()
        .await?
        .into_iter()
        .find(|p| p.spec.service_class_ref == class_name && p.spec.external_name == external_name)
        .ok_or_else(|| ResolveError::NonexistentPlan {
            class: class.spec.external_name.clone(),
            plan: external_name.to_string(),
        })
}

/// Client for a broker, with credentials read from its secret
pub async fn client_for_broker(
    ctx: &Context,
    broker: &ServiceBroker,
) -> Result<Arc<dyn BrokerClient>, ResolveError> {
    let config = client_configuration(ctx.core.as_ref(), broker).await?;
    ctx.broker_clients
        .create_client(&config)
        .map_err(|source| ResolveError::Client {
            broker: broker.name_any(),
            source,
        })
}

async fn client_configuration(
    core: &dyn CoreClient,
    broker: &ServiceBroker,
) -> Result<ClientConfiguration, ResolveError> {
    let name = broker.name_any();
    let mut config = ClientConfiguration::new(&name, &broker.spec.url);
    config.insecure = broker.spec.insecure_skip_tls_verify;
    config.ca_data = broker.spec.ca_bundle.as_ref().map(|ca| ca.clone().into_bytes());
    if let Some(auth) = &broker.spec.auth_info {
        config.auth = auth_config(core, &name, auth).await?;
    }
    Ok(config)
}

async fn auth_config(
    core: &dyn CoreClient,
    broker: &str,
    auth: &BrokerAuthInfo,
) -> Result<Option<AuthConfig>, ResolveError> {
    if let Some(basic) = &auth.basic {
        let username = secret_value(core, broker, &basic.secret_ref, "username").await?;
        let password = secret_value(core, broker, &basic.secret_ref, "password").await?;
        return Ok(Some(AuthConfig::Basic { username, password }));
    }
    if let Some(bearer) = &auth.bearer {
        let token = secret_value(core, broker, &bearer.secret_ref, "token").await?;
        return Ok(Some(AuthConfig::Bearer { token }));
    }
    Ok(None)
}

async fn secret_value(
    core: &dyn CoreClient,
    broker: &str,
    secret: &SecretReference,
    key: &str,
) -> Result<String, ResolveError> {
    let auth_error = |message: String| ResolveError::AuthCredentials {
        broker: broker.to_string(),
        message,
    };
    let data = core
        .get_secret(&secret.namespace, &secret.name)
        .await
        .map_err(|e| auth_error(e.to_string()))?
        .ok_or_else(|| {
            auth_error(format!(
                "secret {}/{} not found",
                secret.namespace, secret.name
            ))
        })?;
    let value = data.get(key).ok_or_else(|| {
        auth_error(format!(
            "secret {}/{} has no {key:?} key",
            secret.namespace, secret.name
        ))
    })?;
    String::from_utf8(value.clone()).map_err(|_| {
        auth_error(format!(
            "secret {}/{} key {key:?} is not valid UTF-8",
            secret.namespace, secret.name
        ))
    })
}
