//! In-process broker with scripted responses
//!
//! Every call is recorded as an [`Action`] so callers can assert exactly which
//! broker operations were issued. Unscripted operations succeed synchronously
//! with an empty response, except polls which fail until scripted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::client::{BrokerClient, BrokerClientFactory, ClientConfiguration};
use crate::error::BrokerError;
use crate::types::*;

/// External ID of the service in [`test_catalog`]
pub const TEST_SERVICE_ID: &str = "svc-1234";
/// Display name of the service in [`test_catalog`]
pub const TEST_SERVICE_NAME: &str = "test-service";
/// External ID of the plan in [`test_catalog`]
pub const TEST_PLAN_ID: &str = "plan-5678";
/// Display name of the plan in [`test_catalog`]
pub const TEST_PLAN_NAME: &str = "test-plan";

/// A catalog with one bindable service offering one plan
pub fn test_catalog() -> CatalogResponse {
    CatalogResponse {
        services: vec![Service {
            id: TEST_SERVICE_ID.to_string(),
            name: TEST_SERVICE_NAME.to_string(),
            description: "a test service".to_string(),
            bindable: true,
            plans: vec![Plan {
                id: TEST_PLAN_ID.to_string(),
                name: TEST_PLAN_NAME.to_string(),
                description: "a test plan".to_string(),
                free: Some(true),
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// A call received by [`FakeBrokerClient`]
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    GetCatalog,
    ProvisionInstance(ProvisionRequest),
    UpdateInstance(UpdateInstanceRequest),
    DeprovisionInstance(DeprovisionRequest),
    PollLastOperation(LastOperationRequest),
    Bind(BindRequest),
    Unbind(UnbindRequest),
    GetBinding(GetBindingRequest),
    PollBindingLastOperation(BindingLastOperationRequest),
}

type Reaction<T> = Option<Result<T, BrokerError>>;

#[derive(Default)]
struct FakeState {
    actions: Vec<Action>,
    catalog: Reaction<CatalogResponse>,
    provision: Reaction<ProvisionResponse>,
    update: Reaction<UpdateInstanceResponse>,
    deprovision: Reaction<DeprovisionResponse>,
    bind: Reaction<BindResponse>,
    unbind: Reaction<UnbindResponse>,
    get_binding: Reaction<GetBindingResponse>,
    polls: VecDeque<Result<LastOperationResponse, BrokerError>>,
    binding_polls: VecDeque<Result<LastOperationResponse, BrokerError>>,
}

fn react<T: Default + Clone>(reaction: &Reaction<T>) -> Result<T, BrokerError> {
    reaction.clone().unwrap_or_else(|| Ok(T::default()))
}

/// Pops scripted poll results in order, repeating the last one forever
fn next_poll(
    polls: &mut VecDeque<Result<LastOperationResponse, BrokerError>>,
) -> Result<LastOperationResponse, BrokerError> {
    if polls.len() > 1 {
        if let Some(result) = polls.pop_front() {
            return result;
        }
    }
    polls
        .front()
        .cloned()
        .unwrap_or_else(|| Err(BrokerError::transport("no poll reaction scripted")))
}

/// Scriptable [`BrokerClient`] that records every call
#[derive(Default)]
pub struct FakeBrokerClient {
    state: Mutex<FakeState>,
}

impl FakeBrokerClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All calls received so far, oldest first
    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.state().actions.clear();
    }

    pub fn set_catalog(&self, result: Result<CatalogResponse, BrokerError>) {
        self.state().catalog = Some(result);
    }

    pub fn set_provision(&self, result: Result<ProvisionResponse, BrokerError>) {
        self.state().provision = Some(result);
    }

    pub fn set_update(&self, result: Result<UpdateInstanceResponse, BrokerError>) {
        self.state().update = Some(result);
    }

    pub fn set_deprovision(&self, result: Result<DeprovisionResponse, BrokerError>) {
        self.state().deprovision = Some(result);
    }

    pub fn set_bind(&self, result: Result<BindResponse, BrokerError>) {
        self.state().bind = Some(result);
    }

    pub fn set_unbind(&self, result: Result<UnbindResponse, BrokerError>) {
        self.state().unbind = Some(result);
    }

    pub fn set_get_binding(&self, result: Result<GetBindingResponse, BrokerError>) {
        self.state().get_binding = Some(result);
    }

    /// Script instance poll results; the last entry repeats once reached
    pub fn set_polls(
        &self,
        results: impl IntoIterator<Item = Result<LastOperationResponse, BrokerError>>,
    ) {
        self.state().polls = results.into_iter().collect();
    }

    /// Script binding poll results; the last entry repeats once reached
    pub fn set_binding_polls(
        &self,
        results: impl IntoIterator<Item = Result<LastOperationResponse, BrokerError>>,
    ) {
        self.state().binding_polls = results.into_iter().collect();
    }
}

#[async_trait]
impl BrokerClient for FakeBrokerClient {
    async fn get_catalog(&self) -> Result<CatalogResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::GetCatalog);
        react(&state.catalog)
    }

    async fn provision_instance(
        &self,
        request: &ProvisionRequest,
    ) -> Result<ProvisionResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::ProvisionInstance(request.clone()));
        react(&state.provision)
    }

    async fn update_instance(
        &self,
        request: &UpdateInstanceRequest,
    ) -> Result<UpdateInstanceResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::UpdateInstance(request.clone()));
        react(&state.update)
    }

    async fn deprovision_instance(
        &self,
        request: &DeprovisionRequest,
    ) -> Result<DeprovisionResponse, BrokerError> {
        let mut state = self.state();
        state
            .actions
            .push(Action::DeprovisionInstance(request.clone()));
        react(&state.deprovision)
    }

    async fn poll_last_operation(
        &self,
        request: &LastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::PollLastOperation(request.clone()));
        next_poll(&mut state.polls)
    }

    async fn bind(&self, request: &BindRequest) -> Result<BindResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::Bind(request.clone()));
        react(&state.bind)
    }

    async fn unbind(&self, request: &UnbindRequest) -> Result<UnbindResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::Unbind(request.clone()));
        react(&state.unbind)
    }

    async fn get_binding(
        &self,
        request: &GetBindingRequest,
    ) -> Result<GetBindingResponse, BrokerError> {
        let mut state = self.state();
        state.actions.push(Action::GetBinding(request.clone()));
        react(&state.get_binding)
    }

    async fn poll_binding_last_operation(
        &self,
        request: &BindingLastOperationRequest,
    ) -> Result<LastOperationResponse, BrokerError> {
        let mut state = self.state();
        state
            .actions
            .push(Action::PollBindingLastOperation(request.clone()));
        next_poll(&mut state.binding_polls)
    }
}

/// Factory handing out one shared [`FakeBrokerClient`]
pub struct FakeBrokerClientFactory {
    client: Arc<FakeBrokerClient>,
    configs: Mutex<Vec<ClientConfiguration>>,
    error: Mutex<Option<BrokerError>>,
}

impl FakeBrokerClientFactory {
    pub fn new(client: Arc<FakeBrokerClient>) -> Self {
        Self {
            client,
            configs: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }

    /// Make every subsequent `create_client` call fail
    pub fn fail_with(&self, error: BrokerError) {
        *self.error.lock().unwrap_or_else(|p| p.into_inner()) = Some(error);
    }

    /// Configurations passed to `create_client`, oldest first
    pub fn configs(&self) -> Vec<ClientConfiguration> {
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl BrokerClientFactory for FakeBrokerClientFactory {
    fn create_client(
        &self,
        config: &ClientConfiguration,
    ) -> Result<Arc<dyn BrokerClient>, BrokerError> {
        if let Some(err) = self.error.lock().unwrap_or_else(|p| p.into_inner()).clone() {
            return Err(err);
        }
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(config.clone());
        Ok(self.client.clone())
    }
}
