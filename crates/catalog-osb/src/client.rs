//! Broker client and factory traits
//!
//! Every request sets `accepts_incomplete` so brokers may answer
//! asynchronously. Callers must treat an `is_async` response as "accepted,
//! still working" and poll the matching last-operation endpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::*;

/// Operations the controller performs against a single broker
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Fetch the broker's catalog of services and plans
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError>;

    /// Provision a new service instance
    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError>;

    /// Change the plan or parameters of an existing instance
    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, BrokerError>;

    /// Deprovision a service instance
    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError>;

    /// Poll the last asynchronous operation on an instance
    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;

    /// Create a binding
    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError>;

    /// Delete a binding
    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError>;

    /// Fetch a binding, used after an asynchronous bind completes
    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError>;

    /// Poll the last asynchronous operation on a binding
    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError>;
}

/// Builds a [`BrokerClient`] for one broker
pub trait BrokerClientFactory: Send + Sync {
    fn create_client(
        &self,
        config: &ClientConfiguration,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError>;
}

/// Credentials presented to a broker
#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// Everything a factory needs to build a client for one broker
#[derive(Clone, Debug, PartialEq)]
pub struct ClientConfiguration {
    /// Name of the broker resource, used for logging
    pub name: String,
    pub url: String,
    pub auth: Option<AuthConfig>,
    pub insecure: bool,
    /// PEM-encoded CA bundle to trust for the broker endpoint
    pub ca_data: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl ClientConfiguration {
    /// Default timeout applied to every outbound broker call
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            auth: None,
            insecure: false,
            ca_data: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}
