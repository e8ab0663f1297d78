//! End-to-end workflows through the controller manager against in-memory
//! stores and a scripted broker

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use catalog_common::condition::{find_condition, is_ready};
use catalog_common::crd::{
    ConditionStatus, ConditionType, RelistBehavior, ServiceBinding, ServiceBindingSpec,
    ServiceBroker, ServiceBrokerSpec, ServiceInstance, ServiceInstanceSpec,
};
use catalog_common::events::RecordingEventPublisher;
use catalog_controller::memory::MemoryCoreClient;
use catalog_controller::{ControllerConfig, ControllerManager, Context, ObjectKey};
use catalog_osb::fake::{
    test_catalog, Action, FakeBrokerClient, FakeBrokerClientFactory, TEST_PLAN_ID,
    TEST_PLAN_NAME, TEST_SERVICE_ID, TEST_SERVICE_NAME,
};
use catalog_osb::{
    BindResponse, BrokerError, LastOperationResponse, LastOperationState, ProvisionResponse,
};
use serde_json::{json, Map};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const NAMESPACE: &str = "apps";

struct Running {
    ctx: Arc<Context>,
    broker: Arc<FakeBrokerClient>,
    core: Arc<MemoryCoreClient>,
    events: Arc<RecordingEventPublisher>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Running {
    fn start(config: ControllerConfig) -> Self {
        Self::start_with(config, |manager| manager)
    }

    fn start_with(
        config: ControllerConfig,
        configure: impl FnOnce(ControllerManager) -> ControllerManager,
    ) -> Self {
        let broker = Arc::new(FakeBrokerClient::new());
        broker.set_catalog(Ok(test_catalog()));
        let core = Arc::new(MemoryCoreClient::new());
        core.add_namespace(NAMESPACE);
        let events = Arc::new(RecordingEventPublisher::new());
        let ctx = Arc::new(
            Context::builder(Arc::new(FakeBrokerClientFactory::new(broker.clone())))
                .config(config)
                .core_client(core.clone())
                .event_publisher(events.clone())
                .build(),
        );

        let (stop, stopped) = oneshot::channel::<()>();
        let manager = configure(ControllerManager::new(ctx.clone()));
        let handle = tokio::spawn(manager.run(async {
            let _ = stopped.await;
        }));
        Self {
            ctx,
            broker,
            core,
            events,
            stop: Some(stop),
            handle: Some(handle),
        }
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("manager did not stop")
                .unwrap();
        }
    }

    async fn instance(&self, name: &str) -> Option<ServiceInstance> {
        self.ctx
            .instances
            .get(&ObjectKey::namespaced(NAMESPACE, name))
            .await
            .unwrap()
    }

    async fn binding(&self, name: &str) -> Option<ServiceBinding> {
        self.ctx
            .bindings
            .get(&ObjectKey::namespaced(NAMESPACE, name))
            .await
            .unwrap()
    }

    async fn add_broker(&self) {
        let broker = ServiceBroker::new(
            "broker",
            ServiceBrokerSpec {
                url: "https://broker.example".to_string(),
                auth_info: None,
                insecure_skip_tls_verify: false,
                ca_bundle: None,
                relist_behavior: RelistBehavior::Duration,
                relist_duration_seconds: None,
                relist_requests: 0,
            },
        );
        self.ctx.brokers.create(&broker).await.unwrap();
        eventually("catalog to sync", || async {
            self.ctx
                .plans
                .get(&ObjectKey::cluster(TEST_PLAN_ID))
                .await
                .unwrap()
                .is_some()
        })
        .await;
    }

    async fn add_instance(&self, name: &str) {
        let mut instance = ServiceInstance::new(
            name,
            ServiceInstanceSpec::new(TEST_SERVICE_NAME, TEST_PLAN_NAME),
        );
        instance.metadata.namespace = Some(NAMESPACE.to_string());
        self.ctx.instances.create(&instance).await.unwrap();
    }

    async fn add_binding(&self, name: &str, instance: &str) {
        let mut binding = ServiceBinding::new(
            name,
            ServiceBindingSpec::new(instance, format!("{name}-secret")),
        );
        binding.metadata.namespace = Some(NAMESPACE.to_string());
        self.ctx.bindings.create(&binding).await.unwrap();
    }

    async fn wait_instance_ready(&self, name: &str) {
        eventually("instance to become ready", || async {
            self.instance(name)
                .await
                .and_then(|i| i.status)
                .is_some_and(|s| is_ready(&s.conditions))
        })
        .await;
    }
}

/// Poll `check` until it holds, panicking after ten seconds
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn count(actions: &[Action], matches: impl Fn(&Action) -> bool) -> usize {
    actions.iter().filter(|a| matches(a)).count()
}

#[tokio::test]
async fn broker_catalog_becomes_classes_and_plans() {
    let running = Running::start(ControllerConfig::default());
    running.add_broker().await;

    let class = running
        .ctx
        .classes
        .get(&ObjectKey::cluster(TEST_SERVICE_ID))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(class.spec.external_name, TEST_SERVICE_NAME);
    assert_eq!(class.spec.broker_name, "broker");

    eventually("broker to report ready", || async {
        running
            .ctx
            .brokers
            .get(&ObjectKey::cluster("broker"))
            .await
            .unwrap()
            .and_then(|b| b.status)
            .is_some_and(|s| is_ready(&s.conditions))
    })
    .await;
    assert!(running
        .events
        .reasons()
        .contains(&"FetchedCatalog".to_string()));

    running.stop().await;
}

#[tokio::test]
async fn instance_and_binding_lifecycle() {
    let running = Running::start(ControllerConfig::default());
    running.add_broker().await;
    let mut credentials = Map::new();
    credentials.insert("uri".to_string(), json!("mysql://db.example:3306"));
    running.broker.set_bind(Ok(BindResponse {
        is_async: false,
        credentials: Some(credentials),
        operation_key: None,
    }));

    running.add_instance("db").await;
    running.add_binding("db-creds", "db").await;
    running.wait_instance_ready("db").await;

    eventually("credentials to be injected", || async {
        running.core.secret(NAMESPACE, "db-creds-secret").is_some()
    })
    .await;
    let secret = running.core.secret(NAMESPACE, "db-creds-secret").unwrap();
    assert_eq!(secret["uri"], b"mysql://db.example:3306".to_vec());
    eventually("binding to report ready", || async {
        running
            .binding("db-creds")
            .await
            .and_then(|b| b.status)
            .is_some_and(|s| is_ready(&s.conditions))
    })
    .await;

    running
        .ctx
        .bindings
        .delete(&ObjectKey::namespaced(NAMESPACE, "db-creds"))
        .await
        .unwrap();
    eventually("binding to be released", || async {
        running.binding("db-creds").await.is_none()
    })
    .await;
    assert!(running.core.secret(NAMESPACE, "db-creds-secret").is_none());

    running
        .ctx
        .instances
        .delete(&ObjectKey::namespaced(NAMESPACE, "db"))
        .await
        .unwrap();
    eventually("instance to be released", || async {
        running.instance("db").await.is_none()
    })
    .await;

    let actions = running.broker.actions();
    assert_eq!(count(&actions, |a| matches!(a, Action::ProvisionInstance(_))), 1);
    assert_eq!(count(&actions, |a| matches!(a, Action::Bind(_))), 1);
    assert_eq!(count(&actions, |a| matches!(a, Action::Unbind(_))), 1);
    assert_eq!(count(&actions, |a| matches!(a, Action::DeprovisionInstance(_))), 1);

    running.stop().await;
}

#[tokio::test]
async fn asynchronous_provision_is_polled_to_completion() {
    let running = Running::start(ControllerConfig::default());
    running.add_broker().await;
    running.broker.set_provision(Ok(ProvisionResponse {
        is_async: true,
        dashboard_url: None,
        operation_key: Some("provision-1".to_string()),
    }));
    running.broker.set_polls([
        Ok(LastOperationResponse::new(
            LastOperationState::InProgress,
            Some("creating volumes"),
        )),
        Ok(LastOperationResponse::new(LastOperationState::Succeeded, None)),
    ]);

    running.add_instance("db").await;
    running.wait_instance_ready("db").await;

    let status = running.instance("db").await.unwrap().status.unwrap();
    assert!(!status.async_op_in_progress);
    assert!(status.provisioned);
    let actions = running.broker.actions();
    assert_eq!(count(&actions, |a| matches!(a, Action::ProvisionInstance(_))), 1);
    assert!(count(&actions, |a| matches!(a, Action::PollLastOperation(_))) >= 2);

    running.stop().await;
}

#[tokio::test]
async fn rejected_provision_is_not_retried() {
    let running = Running::start(ControllerConfig::default());
    running.add_broker().await;
    running
        .broker
        .set_provision(Err(BrokerError::http(400, Some("BadRequest"), None::<String>)));

    running.add_instance("db").await;
    eventually("instance to fail", || async {
        running
            .instance("db")
            .await
            .and_then(|i| i.status)
            .and_then(|s| find_condition(&s.conditions, ConditionType::Failed).cloned())
            .is_some_and(|c| c.status == ConditionStatus::True)
    })
    .await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let provisions = count(&running.broker.actions(), |a| {
        matches!(a, Action::ProvisionInstance(_))
    });
    assert_eq!(provisions, 1);

    running.stop().await;
}

#[tokio::test]
async fn exhausted_retries_are_reported() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = ControllerConfig {
        max_retries: 0,
        ..ControllerConfig::default()
    };
    let running = Running::start_with(config, |manager| manager.report_dropped(tx));
    running
        .broker
        .set_catalog(Err(BrokerError::transport("connection refused")));

    let broker = ServiceBroker::new(
        "broker",
        ServiceBrokerSpec {
            url: "https://broker.example".to_string(),
            auth_info: None,
            insecure_skip_tls_verify: false,
            ca_bundle: None,
            relist_behavior: RelistBehavior::Duration,
            relist_duration_seconds: None,
            relist_requests: 0,
        },
    );
    running.ctx.brokers.create(&broker).await.unwrap();

    let dropped = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("no key was dropped")
        .unwrap();
    assert_eq!(dropped.key, "broker");
    assert!(dropped.last_error.contains("connection refused"));

    running.stop().await;
}
