//! Integration tests for the edge agent.
//!
//! These drive the dispatcher, beater and service against the in-memory
//! controller stub, using the real ping plugin and a temp config file.

use std::sync::Arc;
use std::time::Duration;

use edge_agent::{
    beater::Beater,
    client::{AgentClient, HttpAgentClient},
    config_store::ConfigStore,
    dispatcher::Dispatcher,
    join::Joiner,
    plugin::{CommandHandler, Params, Plugin, PluginConfig, PluginDescriptor},
    plugins::ping,
    protocol::{AgentCheckRequest, CheckResult, OpStatus, OperationRequest, OperationResponse},
    registry::PluginRegistry,
    server,
    service::{Service, ServiceState},
    settings::Settings,
    stub::{StubController, STUB_AGENT_TOKEN},
    worker::{Worker, DEFAULT_OP_TIMEOUT},
    AgentError,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

const ASSET: &str = "test-asset";

struct Harness {
    _dir: TempDir,
    config: ConfigStore,
    registry: Arc<PluginRegistry>,
    stub: Arc<StubController>,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = ConfigStore::open(dir.path().join("agent.toml")).unwrap();
        let registry = Arc::new(PluginRegistry::new());
        registry.register(ping::descriptor()).unwrap();
        registry.start_plugin(ping::NAME, &PluginConfig::new()).await.unwrap();
        Self {
            _dir: dir,
            config,
            registry,
            stub: Arc::new(StubController::new(ASSET)),
        }
    }

    fn worker(&self) -> Worker {
        Worker::new(self.registry.clone(), self.config.sub_config("plugins"), DEFAULT_OP_TIMEOUT)
    }

    fn client(&self) -> Arc<dyn AgentClient> {
        self.stub.clone()
    }

    fn dispatcher(&self, op_capacity: usize, response_capacity: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::with_capacities(
            self.client(),
            self.worker(),
            op_capacity,
            response_capacity,
        ))
    }
}

fn ping_op(id: &str) -> OperationRequest {
    OperationRequest::new(id, ASSET, ping::NAME, "ping")
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
#[traced_test]
async fn full_queue_reports_fail() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(0, 1);

    dispatcher.dispatch(ping_op("op-1"));
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let responses = h.stub.responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, OpStatus::Fail);
    assert!(responses[0].info.contains("full"));
}

#[tokio::test]
async fn zero_capacity_agent_reports_fail() {
    let h = Harness::new().await;
    let dispatcher = Dispatcher::new(h.client(), h.worker(), 0);

    dispatcher.dispatch(ping_op("op-1"));
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let responses = h.stub.responses_for("op-1");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, OpStatus::Fail);
    assert!(responses[0].info.contains("full"));
}

/// Controller that takes a while to acknowledge each callback.
struct SlowController {
    inner: Arc<StubController>,
    delay: Duration,
}

#[async_trait::async_trait]
impl AgentClient for SlowController {
    async fn agent_check(&self, request: AgentCheckRequest) -> edge_agent::Result<CheckResult> {
        self.inner.agent_check(request).await
    }

    async fn callback_agent_operation(&self, response: OperationResponse) -> edge_agent::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.callback_agent_operation(response).await
    }
}

#[tokio::test]
async fn slow_controller_still_gets_every_response() {
    let h = Harness::new().await;
    let slow = Arc::new(SlowController {
        inner: h.stub.clone(),
        delay: Duration::from_millis(50),
    });
    let dispatcher = Dispatcher::new(slow, h.worker(), 2);

    for id in ["op-0", "op-1", "op-2"] {
        dispatcher.dispatch(ping_op(id));
    }
    wait_until("five callbacks", || h.stub.num_callbacks() == 5).await;
    dispatcher.stop(Duration::from_secs(2)).await.unwrap();

    for id in ["op-0", "op-1"] {
        let statuses: Vec<_> = h.stub.responses_for(id).iter().map(|r| r.status).collect();
        assert_eq!(statuses, vec![OpStatus::Scheduled, OpStatus::Success], "responses for {}", id);
    }
    let rejected = h.stub.responses_for("op-2");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].status, OpStatus::Fail);
    assert!(rejected[0].info.contains("full"));
    assert_eq!(h.stub.num_callbacks(), 5);
}

#[tokio::test]
#[traced_test]
async fn dispatched_operation_is_scheduled_then_succeeds() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(10, 10);

    dispatcher.dispatch(ping_op("op-1").with_param("msg", "there"));
    wait_until("two callbacks", || h.stub.num_callbacks() == 2).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let responses = h.stub.responses_for("op-1");
    assert_eq!(responses.len(), 2);
    assert_eq!(responses[0].status, OpStatus::Scheduled);
    assert_eq!(responses[1].status, OpStatus::Success);
    assert_eq!(responses[1].info, "pong there");
    assert_eq!(responses[1].asset_id, ASSET);
    assert_eq!(dispatcher.queued_operations(), 0);
    assert_eq!(dispatcher.queued_responses(), 0);
}

#[tokio::test]
async fn failed_operation_reports_error_text() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(10, 10);

    dispatcher.dispatch(OperationRequest::new("op-1", ASSET, "nosuch", "run"));
    wait_until("two callbacks", || h.stub.num_callbacks() == 2).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let responses = h.stub.responses_for("op-1");
    assert_eq!(responses[1].status, OpStatus::Fail);
    assert!(responses[1].info.contains("nosuch"));
}

#[tokio::test]
#[traced_test]
async fn stop_fails_queued_operations_without_running_them() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(4, 16);

    // Occupy the worker so the next operations stay queued.
    dispatcher.dispatch(ping_op("busy").with_param("sleep", "600"));
    wait_until("busy op picked up", || dispatcher.queued_operations() == 0).await;

    dispatcher.dispatch(ping_op("queued-1"));
    dispatcher.dispatch(ping_op("queued-2"));
    assert_eq!(dispatcher.queued_operations(), 2);

    dispatcher.stop(Duration::from_secs(2)).await.unwrap();

    for id in ["queued-1", "queued-2"] {
        let responses = h.stub.responses_for(id);
        assert_eq!(responses.len(), 2, "responses for {}", id);
        assert_eq!(responses[0].status, OpStatus::Scheduled);
        assert_eq!(responses[1].status, OpStatus::Fail);
        assert!(responses[1].info.contains("stopped"));
    }

    // The in-flight operation was cancelled rather than completed.
    let busy = h.stub.responses_for("busy");
    assert_eq!(busy.len(), 2);
    assert_eq!(busy[1].status, OpStatus::Fail);

    // Nothing ran to completion, so the ping counter never moved.
    let (data, _) = h
        .registry
        .collect_heartbeat_data(tokio::time::Instant::now() + Duration::from_secs(1))
        .await;
    assert_eq!(data.to_wire()[0].data["pongs"], 0);
}

#[tokio::test]
async fn dispatch_after_stop_is_refused() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(4, 4);
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    dispatcher.dispatch(ping_op("late"));
    assert_eq!(dispatcher.queued_operations(), 0);
    assert_eq!(h.stub.num_callbacks(), 0);
}

#[tokio::test]
async fn stop_times_out_on_stuck_response_delivery() {
    struct Stuck;

    #[async_trait::async_trait]
    impl AgentClient for Stuck {
        async fn agent_check(&self, _: AgentCheckRequest) -> edge_agent::Result<edge_agent::protocol::CheckResult> {
            Ok(Default::default())
        }

        async fn callback_agent_operation(&self, _: edge_agent::protocol::OperationResponse) -> edge_agent::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    let h = Harness::new().await;
    let dispatcher = Dispatcher::new(Arc::new(Stuck), h.worker(), 4);
    dispatcher.dispatch(ping_op("op-1"));

    let err = dispatcher.stop(Duration::from_millis(200)).await.unwrap_err();
    assert!(err.is_deadline_exceeded());
}

/// Plugin whose command ignores cancellation.
struct Stubborn;

#[async_trait::async_trait]
impl Plugin for Stubborn {
    fn command(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        match name {
            "wait" => Some(Arc::new(|_cancel: CancellationToken, _params: Params| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok::<_, AgentError>("done".to_string())
            })),
            _ => None,
        }
    }
}

#[tokio::test]
async fn stop_times_out_on_command_ignoring_cancellation() {
    let h = Harness::new().await;
    h.registry
        .register(PluginDescriptor::new("stubborn", "ignores cancellation", |_: &PluginConfig| {
            Ok::<Arc<dyn Plugin>, AgentError>(Arc::new(Stubborn))
        }))
        .unwrap();
    h.registry.start_plugin("stubborn", &PluginConfig::new()).await.unwrap();
    let dispatcher = h.dispatcher(4, 16);

    dispatcher.dispatch(OperationRequest::new("stuck", ASSET, "stubborn", "wait"));
    wait_until("stuck op picked up", || dispatcher.queued_operations() == 0).await;
    dispatcher.dispatch(ping_op("queued"));

    let started = std::time::Instant::now();
    let err = dispatcher.stop(Duration::from_millis(200)).await.unwrap_err();
    assert!(err.is_deadline_exceeded());
    assert!(started.elapsed() < Duration::from_secs(1), "stop took {:?}", started.elapsed());

    // Everything queued before the deadline still reaches the controller.
    wait_until("three callbacks", || h.stub.num_callbacks() == 3).await;
    let stuck = h.stub.responses_for("stuck");
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].status, OpStatus::Scheduled);
    let queued: Vec<_> = h.stub.responses_for("queued").iter().map(|r| r.status).collect();
    assert_eq!(queued, vec![OpStatus::Scheduled, OpStatus::Fail]);
}

#[tokio::test]
#[traced_test]
async fn beat_dispatches_pending_operations() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(10, 10);
    let beater = Beater::new(h.client(), dispatcher.clone(), h.registry.clone(), ASSET);

    for _ in 0..3 {
        h.stub.queue_operation(ping::NAME, "ping", Params::new());
    }

    assert!(beater.beat(Duration::from_secs(1)).await);
    assert_eq!(h.stub.num_checks(), 1);

    // Three operations, scheduled and succeeded.
    wait_until("six callbacks", || h.stub.num_callbacks() == 6).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    let responses = h.stub.responses();
    assert_eq!(responses.iter().filter(|r| r.status == OpStatus::Scheduled).count(), 3);
    assert_eq!(responses.iter().filter(|r| r.status == OpStatus::Success).count(), 3);
    for r in &responses {
        let mine = h.stub.responses_for(&r.operation_id);
        assert_eq!(mine[0].status, OpStatus::Scheduled);
    }
}

#[tokio::test]
async fn beat_carries_plugin_data() {
    let h = Harness::new().await;
    let beater = Beater::new(h.client(), h.dispatcher(1, 1), h.registry.clone(), ASSET);

    assert!(beater.beat(Duration::from_secs(1)).await);

    let check = h.stub.last_check().unwrap();
    assert_eq!(check.asset_id, ASSET);
    assert_eq!(check.plugin_data.len(), 1);
    assert_eq!(check.plugin_data[0].plugin, "ping");
}

#[tokio::test]
async fn beat_drops_operations_for_other_assets() {
    let h = Harness::new().await;
    let dispatcher = h.dispatcher(10, 10);
    let beater = Beater::new(h.client(), dispatcher.clone(), h.registry.clone(), ASSET);

    h.stub
        .queue_request(OperationRequest::new("foreign", "other-asset", ping::NAME, "ping"));
    assert!(beater.beat(Duration::from_secs(1)).await);
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    assert!(h.stub.responses_for("foreign").is_empty());
}

#[tokio::test]
async fn beat_reports_transport_failure() {
    let h = Harness::new().await;
    let beater = Beater::new(h.client(), h.dispatcher(1, 1), h.registry.clone(), ASSET);

    h.stub.set_failing(true);
    assert!(!beater.beat(Duration::from_secs(1)).await);
    assert_eq!(h.stub.num_checks(), 0);
}

#[tokio::test(start_paused = true)]
async fn liveness_follows_successful_beats() {
    let h = Harness::new().await;
    let mut settings = Settings::joined(ASSET, "token", "stub");
    settings.agent.interval_ms = 1_000;

    let service = Arc::new(Service::new(settings, h.client(), h.registry.clone(), h.config.clone()));
    let handle = service.handle();
    assert!(!handle.alive());
    assert_eq!(handle.state(), ServiceState::Idle);

    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(handle.state(), ServiceState::Running);
    assert!(handle.alive());
    assert!(h.stub.num_checks() >= 2);

    h.stub.set_failing(true);
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(!handle.alive());

    h.stub.set_failing(false);
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(handle.alive());

    handle.stop();
    running.await.unwrap().unwrap();
    assert_eq!(handle.state(), ServiceState::Stopped);
    assert!(!h.registry.is_running(ping::NAME));
}

#[tokio::test(start_paused = true)]
async fn disabled_service_stops_beating() {
    let h = Harness::new().await;
    let mut settings = Settings::joined(ASSET, "token", "stub");
    settings.agent.interval_ms = 1_000;

    let service = Arc::new(Service::new(settings, h.client(), h.registry.clone(), h.config.clone()));
    let handle = service.handle();
    let running = {
        let service = service.clone();
        tokio::spawn(async move { service.run().await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.disable();
    let checks = h.stub.num_checks();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.stub.num_checks(), checks);
    assert_eq!(handle.state(), ServiceState::Disabled);
    assert!(handle.alive());

    handle.stop();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn service_replays_enabled_plugins() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    std::fs::write(
        &path,
        r#"
[plugins.ping]
enabled = true

[plugins.ghost]
enabled = true
"#,
    )
    .unwrap();

    let registry = Arc::new(PluginRegistry::new());
    registry.register(ping::descriptor()).unwrap();
    let stub = Arc::new(StubController::new(ASSET));
    let service = Service::new(
        Settings::joined(ASSET, "token", "stub"),
        stub.clone(),
        registry.clone(),
        ConfigStore::open(&path).unwrap(),
    );

    service.restart_plugins().await;
    assert!(registry.is_running(ping::NAME));
}

#[tokio::test]
async fn service_refuses_to_run_unjoined() {
    let h = Harness::new().await;
    let service = Service::new(Settings::default(), h.client(), h.registry.clone(), h.config.clone());
    let err = service.run().await.unwrap_err();
    assert!(matches!(err, AgentError::FailedPrecondition(_)));
    assert_eq!(service.handle().state(), ServiceState::Idle);
}

#[tokio::test]
async fn start_operation_persists_plugin_config() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    let registry = Arc::new(PluginRegistry::new());
    registry.register(ping::descriptor()).unwrap();
    let stub = Arc::new(StubController::new(ASSET));
    let root = ConfigStore::open(&path).unwrap();
    let worker = Worker::new(registry.clone(), root.sub_config("plugins"), DEFAULT_OP_TIMEOUT);
    let dispatcher = Dispatcher::new(stub.clone(), worker, 4);

    dispatcher.dispatch(OperationRequest::new("op-1", ASSET, ping::NAME, "start").with_param("colour", "blue"));
    wait_until("two callbacks", || stub.num_callbacks() == 2).await;
    dispatcher.stop(Duration::from_secs(1)).await.unwrap();

    assert!(registry.is_running(ping::NAME));
    let on_disk = ConfigStore::open(&path).unwrap();
    assert_eq!(on_disk.get_bool("plugins.ping.enabled"), Some(true));
    assert_eq!(on_disk.get_str("plugins.ping.colour").as_deref(), Some("blue"));
}

#[tokio::test]
async fn http_client_talks_to_stub_server() {
    let stub = Arc::new(StubController::new(ASSET));
    stub.queue_operation(ping::NAME, "ping", Params::new());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server::serve_listener(listener, stub.clone(), shutdown.clone()));

    let client = HttpAgentClient::new(&addr.to_string(), "token", Duration::from_secs(5)).unwrap();
    let result = client
        .agent_check(AgentCheckRequest {
            asset_id: ASSET.to_string(),
            timestamp: 0,
            plugin_data: vec![],
        })
        .await
        .unwrap();
    assert_eq!(result.pending_requests.len(), 1);
    assert_eq!(result.pending_requests[0].plugin, "ping");

    let op = &result.pending_requests[0];
    client
        .callback_agent_operation(edge_agent::protocol::OperationResponse::for_request(
            op,
            OpStatus::Success,
            "pong",
        ))
        .await
        .unwrap();
    assert_eq!(stub.num_checks(), 1);
    assert_eq!(stub.num_callbacks(), 1);

    stub.set_failing(true);
    let err = client
        .agent_check(AgentCheckRequest {
            asset_id: ASSET.to_string(),
            timestamp: 0,
            plugin_data: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Unavailable(_)));

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn joined_agent_settings_are_ready_to_run() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    let stub = Arc::new(StubController::new(ASSET));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server::serve_listener(listener, stub.clone(), shutdown.clone()));

    // Not joined yet.
    let settings = Settings::load(&path).unwrap();
    assert!(settings.validate_joined().is_err());

    let client = HttpAgentClient::new(&addr, "join-token", Duration::from_secs(5)).unwrap();
    let joiner = Joiner::new(ConfigStore::open(&path).unwrap(), addr.clone(), "join-token");
    let joined = joiner.run(&client).await.unwrap();
    assert_eq!(joined.asset_id, ASSET);
    assert_eq!(stub.joins().len(), 1);

    let settings = Settings::load(&path).unwrap();
    settings.validate_joined().unwrap();
    assert_eq!(settings.agent.asset_id, ASSET);
    assert_eq!(settings.agent.token, STUB_AGENT_TOKEN);
    assert_eq!(settings.controller.address, addr);

    shutdown.cancel();
    serving.await.unwrap().unwrap();
}
