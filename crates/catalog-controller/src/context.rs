//! Shared state handed to every reconciler

use std::sync::Arc;

use catalog_common::crd::{ServiceBinding, ServiceBroker, ServiceClass, ServiceInstance, ServicePlan};
use catalog_common::events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
use catalog_common::CONTROLLER_NAME;
use catalog_osb::BrokerClientFactory;
use catalog_queue::RateLimitingQueue;
use kube::Client;

use crate::config::ControllerConfig;
use crate::core_client::{CoreClient, KubeCoreClient};
use crate::key::ObjectKey;
use crate::memory::{MemoryCoreClient, MemoryStore};
use crate::poll::PollTarget;
use crate::store::{KubeStore, ResourceStore};

/// One retry queue per kind plus the polling queue
#[derive(Clone)]
pub struct Queues {
    pub brokers: RateLimitingQueue<ObjectKey>,
    pub classes: RateLimitingQueue<ObjectKey>,
    pub plans: RateLimitingQueue<ObjectKey>,
    pub instances: RateLimitingQueue<ObjectKey>,
    pub bindings: RateLimitingQueue<ObjectKey>,
    /// Instances and bindings with an asynchronous operation in flight
    pub polling: RateLimitingQueue<PollTarget>,
}

impl Queues {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            brokers: RateLimitingQueue::with_default_limiter("broker"),
            classes: RateLimitingQueue::with_default_limiter("class"),
            plans: RateLimitingQueue::with_default_limiter("plan"),
            instances: RateLimitingQueue::with_default_limiter("instance"),
            bindings: RateLimitingQueue::with_default_limiter("binding"),
            polling: RateLimitingQueue::polling(
                "poll",
                config.polling_start_interval(),
                config.polling_max_backoff(),
            ),
        }
    }

    /// Stop handing out keys on every queue
    pub fn shut_down(&self) {
        self.brokers.shut_down();
        self.classes.shut_down();
        self.plans.shut_down();
        self.instances.shut_down();
        self.bindings.shut_down();
        self.polling.shut_down();
    }
}

/// Controller context shared by all reconcilers
pub struct Context {
    pub brokers: Arc<dyn ResourceStore<ServiceBroker>>,
    pub classes: Arc<dyn ResourceStore<ServiceClass>>,
    pub plans: Arc<dyn ResourceStore<ServicePlan>>,
    pub instances: Arc<dyn ResourceStore<ServiceInstance>>,
    pub bindings: Arc<dyn ResourceStore<ServiceBinding>>,
    /// Secrets and namespaces
    pub core: Arc<dyn CoreClient>,
    /// Builds a broker client per reconcile from the broker's connection details
    pub broker_clients: Arc<dyn BrokerClientFactory>,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
    pub queues: Queues,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(broker_clients: Arc<dyn BrokerClientFactory>) -> ContextBuilder {
        ContextBuilder::new(broker_clients)
    }

    /// Context backed by the Kubernetes API server
    ///
    /// Equivalent to `Context::builder(broker_clients).client(client).build()`.
    pub fn new(client: Client, broker_clients: Arc<dyn BrokerClientFactory>) -> Self {
        Self::builder(broker_clients).client(client).build()
    }

    /// Context over in-memory stores with default configuration
    #[cfg(test)]
    pub fn for_testing(
        core: Arc<dyn CoreClient>,
        broker_clients: Arc<dyn BrokerClientFactory>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self::builder(broker_clients)
            .core_client(core)
            .event_publisher(events)
            .build()
    }
}

/// Builder for constructing [`Context`] instances
///
/// With a Kubernetes client, stores and the core client default to the API
/// server. Without one they default to in-memory implementations and events
/// are discarded.
///
/// ```text
/// let ctx = Context::builder(factory)
///     .client(client)
///     .config(config)
///     .build();
/// ```
pub struct ContextBuilder {
    client: Option<Client>,
    broker_clients: Arc<dyn BrokerClientFactory>,
    brokers: Option<Arc<dyn ResourceStore<ServiceBroker>>>,
    classes: Option<Arc<dyn ResourceStore<ServiceClass>>>,
    plans: Option<Arc<dyn ResourceStore<ServicePlan>>>,
    instances: Option<Arc<dyn ResourceStore<ServiceInstance>>>,
    bindings: Option<Arc<dyn ResourceStore<ServiceBinding>>>,
    core: Option<Arc<dyn CoreClient>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: ControllerConfig,
}

impl ContextBuilder {
    fn new(broker_clients: Arc<dyn BrokerClientFactory>) -> Self {
        Self {
            client: None,
            broker_clients,
            brokers: None,
            classes: None,
            plans: None,
            instances: None,
            bindings: None,
            core: None,
            events: None,
            config: ControllerConfig::default(),
        }
    }

    /// Use the API server for everything not overridden
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn broker_store(mut self, store: Arc<dyn ResourceStore<ServiceBroker>>) -> Self {
        self.brokers = Some(store);
        self
    }

    pub fn class_store(mut self, store: Arc<dyn ResourceStore<ServiceClass>>) -> Self {
        self.classes = Some(store);
        self
    }

    pub fn plan_store(mut self, store: Arc<dyn ResourceStore<ServicePlan>>) -> Self {
        self.plans = Some(store);
        self
    }

    pub fn instance_store(mut self, store: Arc<dyn ResourceStore<ServiceInstance>>) -> Self {
        self.instances = Some(store);
        self
    }

    pub fn binding_store(mut self, store: Arc<dyn ResourceStore<ServiceBinding>>) -> Self {
        self.bindings = Some(store);
        self
    }

    /// Override the secret/namespace client (primarily for testing)
    pub fn core_client(mut self, core: Arc<dyn CoreClient>) -> Self {
        self.core = Some(core);
        self
    }

    /// Override the event publisher (primarily for testing)
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let client = self.client;
        let queues = Queues::new(&self.config);

        let core: Arc<dyn CoreClient> = match (self.core, &client) {
            (Some(core), _) => core,
            (None, Some(c)) => Arc::new(KubeCoreClient::new(c.clone())),
            (None, None) => Arc::new(MemoryCoreClient::new()),
        };
        let events: Arc<dyn EventPublisher> = match (self.events, &client) {
            (Some(events), _) => events,
            (None, Some(c)) => Arc::new(KubeEventPublisher::new(c.clone(), CONTROLLER_NAME)),
            (None, None) => Arc::new(NoopEventPublisher),
        };

        Context {
            brokers: self.brokers.unwrap_or_else(|| store(client.as_ref())),
            classes: self.classes.unwrap_or_else(|| store(client.as_ref())),
            plans: self.plans.unwrap_or_else(|| store(client.as_ref())),
            instances: self.instances.unwrap_or_else(|| store(client.as_ref())),
            bindings: self.bindings.unwrap_or_else(|| store(client.as_ref())),
            core,
            events,
            broker_clients: self.broker_clients,
            config: self.config,
            queues,
        }
    }
}

fn store<K>(client: Option<&Client>) -> Arc<dyn ResourceStore<K>>
where
    K: crate::store::KubeResource,
{
    match client {
        Some(c) => Arc::new(KubeStore::<K>::new(c.clone())),
        None => Arc::new(MemoryStore::<K>::new()),
    }
}
