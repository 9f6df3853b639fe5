//! Orchestrator lifecycle tests
//!
//! Background loops (health probes, discovery, telemetry), eviction and
//! event ordering as seen by a subscriber.


use agentmesh::observability::{MetricsSink, OrchestratorMetrics};
use agentmesh::registry::{AgentFilter, AgentOrigin, HealthStatus};
use agentmesh::testing::{agent_metadata, MockTransport, StaticDiscovery};
use agentmesh::{Orchestrator, OrchestratorEvent, ProbeResult, Task};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{drain_event_names, orchestrator, register, test_config};

#[derive(Default)]
struct RecordingSink {
    snapshots: Mutex<Vec<OrchestratorMetrics>>,
}

impl MetricsSink for RecordingSink {
    fn publish(&self, metrics: &OrchestratorMetrics) {
        self.snapshots.lock().push(metrics.clone());
    }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opened_precedes_caused_failures() {
    let mut config = test_config();
    config.routing.max_retries = 0;
    config.routing.circuit_breaker.failure_threshold = 2;
    let (orchestrator, transport) = orchestrator(config);
    register(&orchestrator, "a1", &["x"]).await;
    transport.fail_always("a1", true);
    let mut rx = orchestrator.subscribe();

    for _ in 0..3 {
        orchestrator.route_task(&Task::new("t", ["x"])).await.unwrap_err();
    }

    assert_eq!(
        drain_event_names(&mut rx),
        vec!["task.failed", "circuit.opened", "task.failed", "task.failed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_task_reports_tried_agents() {
    let mut config = test_config();
    config.routing.max_retries = 1;
    let (orchestrator, transport) = orchestrator(config);
    register(&orchestrator, "a1", &["x"]).await;
    register(&orchestrator, "a2", &["x", "y"]).await;
    transport.fail_always("a1", true);
    transport.fail_always("a2", true);
    let mut rx = orchestrator.subscribe();

    let task = Task::new("t", ["x"]);
    orchestrator.route_task(&task).await.unwrap_err();

    let failed = std::iter::from_fn(|| rx.try_recv().ok())
        .find(|event| event.name() == "task.failed")
        .unwrap();
    match failed {
        OrchestratorEvent::TaskFailed {
            task_id,
            attempts,
            tried_agents,
            ..
        } => {
            assert_eq!(task_id, task.id);
            assert_eq!(attempts, 2);
            assert_eq!(tried_agents, vec!["a1", "a2"]);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_health_loop_marks_and_evicts_unreachable_agents() {
    let mut config = test_config();
    config.registry.health_check_interval_ms = 1_000;
    config.telemetry.enabled = false;
    let (orchestrator, transport) = orchestrator(config);
    register(&orchestrator, "a1", &["x"]).await;
    register(&orchestrator, "a2", &["x"]).await;
    transport.set_probe("a1", ProbeResult::failed("connection refused"));
    let mut rx = orchestrator.subscribe();

    orchestrator.start().await;

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(
        orchestrator.get_agent("a1").unwrap().health.status,
        HealthStatus::Unreachable
    );
    assert_eq!(
        orchestrator.get_agent("a2").unwrap().health.status,
        HealthStatus::Healthy
    );

    let result = orchestrator.route_task(&Task::new("t", ["x"])).await.unwrap();
    assert_eq!(result.agent_id, "a2");

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(orchestrator.get_agent("a1").is_none());

    let evicted: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|event| event.agent_id() == Some("a1"))
        .map(|event| event.name())
        .collect();
    assert_eq!(
        evicted,
        vec!["agent.health.changed", "agent.health.changed", "agent.evicted"]
    );

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_discovery_loop_tracks_source() {
    let mut config = test_config();
    config.registry.discovery_enabled = true;
    config.registry.discovery_interval_ms = 1_000;
    config.telemetry.enabled = false;

    let source = Arc::new(StaticDiscovery::new(vec![
        agent_metadata("d1", &["x"]),
        agent_metadata("d2", &["y"]),
    ]));
    let orchestrator = Arc::new(
        Orchestrator::new(config, Arc::new(MockTransport::new()))
            .unwrap()
            .with_discovery(source.clone()),
    );
    register(&orchestrator, "manual", &["x"]).await;

    orchestrator.start().await;
    assert_eq!(orchestrator.registry().len(), 3);

    source.set_agents(vec![agent_metadata("d1", &["x"])]);
    tokio::time::sleep(Duration::from_millis(1_001)).await;

    let discovered = orchestrator
        .list_agents(Some(&AgentFilter::default().with_origin(AgentOrigin::Discovered)));
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].id, "d1");
    assert!(orchestrator.get_agent("manual").is_some());

    source.set_failing(true);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(orchestrator.registry().len(), 2);
    assert!(source.calls() >= 3);

    orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_loop_publishes_snapshots() {
    let mut config = test_config();
    config.telemetry.metrics_interval_ms = 500;
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Arc::new(
        Orchestrator::new(config, Arc::new(MockTransport::new()))
            .unwrap()
            .with_metrics_sink(sink.clone()),
    );
    register(&orchestrator, "a1", &["x"]).await;
    orchestrator.route_task(&Task::new("t", ["x"])).await.unwrap();

    orchestrator.start().await;
    tokio::time::sleep(Duration::from_millis(1_001)).await;
    orchestrator.shutdown().await;

    let snapshots = sink.snapshots.lock();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].tasks.completed, 1);
    assert_eq!(snapshots[0].agents.total, 1);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_serialize_for_dashboards() {
    let (orchestrator, _) = orchestrator(test_config());
    register(&orchestrator, "a1", &["x"]).await;
    orchestrator.route_task(&Task::new("t", ["x"])).await.unwrap();
    orchestrator.route_task(&Task::new("t", ["nope"])).await.unwrap_err();

    let json = serde_json::to_value(orchestrator.get_metrics()).unwrap();
    assert_eq!(json["tasks"]["submitted"], 2);
    assert_eq!(json["tasks"]["failures_by_kind"]["no_capable_agent"], 1);
    assert_eq!(json["pool"]["idle"], 1);
    assert_eq!(json["open_circuits"], 0);
}
