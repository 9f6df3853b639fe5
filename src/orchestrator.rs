//! Orchestrator facade
//!
//! Wires the registry, pool and router together from one configuration and
//! runs their background maintenance: health probing, pool upkeep, discovery
//! sweeps and metrics publication.

use crate::agent_span;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorResult;
use crate::events::{EventBus, OrchestratorEvent};
use crate::observability::{
    AgentMetrics, MetricsCollector, MetricsSink, OrchestratorMetrics, TracingMetricsSink,
};
use crate::pool::ConnectionPool;
use crate::registry::{
    Agent, AgentFilter, AgentMetadata, AgentRegistry, DiscoverySource, DiscoverySync,
    HealthDisposition,
};
use crate::routing::{Task, TaskResult, TaskRouter};
use crate::transport::{AgentTransport, ProbeResult, TransportError};
use chrono::Utc;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

/// Single entry point for task submission and agent administration
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    pool: Arc<ConnectionPool>,
    router: TaskRouter,
    transport: Arc<dyn AgentTransport>,
    metrics: Arc<MetricsCollector>,
    events: EventBus,
    discovery: Option<Arc<dyn DiscoverySource>>,
    sink: Arc<dyn MetricsSink>,
    background: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("agents", &self.registry.len())
            .field("pool", &self.pool.stats())
            .field("router", &self.router)
            .field("discovery", &self.discovery.is_some())
            .finish()
    }
}

impl Orchestrator {
    /// Validate `config` and build every component around `transport`
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn AgentTransport>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let events = EventBus::default();
        let metrics = Arc::new(MetricsCollector::new(config.telemetry.retention_period()));
        let registry = Arc::new(AgentRegistry::new(config.registry.clone(), events.clone()));
        let pool = Arc::new(ConnectionPool::new(
            config.connection_pool.clone(),
            Arc::clone(&transport),
            events.clone(),
        ));
        let router = TaskRouter::new(
            config.routing.clone(),
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&transport),
            Arc::clone(&metrics),
            events.clone(),
        );

        Ok(Self {
            config,
            registry,
            pool,
            router,
            transport,
            metrics,
            events,
            discovery: None,
            sink: Arc::new(TracingMetricsSink),
            background: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Feed the registry from `source` every discovery interval
    pub fn with_discovery(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.discovery = Some(source);
        self
    }

    /// Publish periodic metrics to `sink` instead of the log
    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn router(&self) -> &TaskRouter {
        &self.router
    }

    /// Route a task to an agent and return its result or one terminal error
    pub async fn route_task(&self, task: &Task) -> OrchestratorResult<TaskResult> {
        self.router.route(task).await
    }

    /// Register or update an agent, warming its connections when asked to
    pub async fn register_agent(&self, metadata: AgentMetadata) -> OrchestratorResult<Agent> {
        let span = agent_span!(agent_name = %metadata.name, endpoint = %metadata.endpoint);
        async {
            let agent = self.registry.register(metadata)?;
            let warmup = self.config.connection_pool.warmup_connections;
            if agent.warm && warmup > 0 {
                let opened = self.pool.warmup(&agent.id, warmup).await;
                debug!(agent_id = %agent.id, opened, "Warmup finished");
            }
            Ok(agent)
        }
        .instrument(span)
        .await
    }

    /// Remove an agent along with its connections and routing state
    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let _span = agent_span!(agent_id = %agent_id).entered();
        let removed = self.registry.deregister(agent_id);
        if removed {
            self.forget(agent_id);
        }
        removed
    }

    fn forget(&self, agent_id: &str) {
        let closed = self.pool.recycle_agent(agent_id);
        self.router.forget_agent(agent_id);
        debug!(agent_id = %agent_id, closed, "Dropped agent state");
    }

    pub fn get_agent(&self, agent_id: &str) -> Option<Agent> {
        self.registry.get(agent_id)
    }

    pub fn list_agents(&self, filter: Option<&AgentFilter>) -> Vec<Agent> {
        self.registry.list_agents(filter)
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    /// Snapshot of task, agent, pool and router telemetry
    pub fn get_metrics(&self) -> OrchestratorMetrics {
        let by_status = self
            .registry
            .status_counts()
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();

        OrchestratorMetrics {
            tasks: self.metrics.snapshot(),
            agents: AgentMetrics {
                total: self.registry.len(),
                by_status,
            },
            pool: self.pool.stats(),
            open_circuits: self.router.breakers().open_count(),
            queue_depth: self.router.queue_depth(),
            timestamp: Utc::now(),
        }
    }

    /// Apply a probe result; an evicted agent loses its connections too
    pub fn record_health(
        &self,
        agent_id: &str,
        probe: &ProbeResult,
    ) -> OrchestratorResult<HealthDisposition> {
        let disposition = self.registry.record_health(agent_id, probe)?;
        if disposition == HealthDisposition::Evicted {
            self.forget(agent_id);
        }
        Ok(disposition)
    }

    /// Probe every registered agent once; returns how many were probed
    pub async fn probe_agents(&self) -> usize {
        let timeout = self.config.connection_pool.connection_timeout();
        let mut probes = JoinSet::new();

        for agent in self.registry.list_agents(None) {
            let transport = Arc::clone(&self.transport);
            probes.spawn(async move {
                let result = match tokio::time::timeout(timeout, transport.probe(&agent)).await {
                    Ok(result) => result,
                    Err(_) => ProbeResult::failed(format!(
                        "probe timed out after {}ms",
                        timeout.as_millis()
                    )),
                };
                (agent.id, result)
            });
        }

        let mut probed = 0;
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((agent_id, result)) => {
                    probed += 1;
                    // deregistered while the probe ran
                    if let Err(e) = self.record_health(&agent_id, &result) {
                        debug!(agent_id = %agent_id, "Probe result dropped: {}", e);
                    }
                }
                Err(e) => error!("Health probe task failed: {}", e),
            }
        }
        probed
    }

    /// Close idle connections and recycle those of persistently failing agents
    pub fn maintain_pool(&self) -> usize {
        let mut closed = self.pool.sweep_idle();
        let threshold = self.config.connection_pool.retry_attempts;

        for agent in self.registry.list_agents(None) {
            if agent.health.consecutive_failures >= threshold
                && !self.pool.connections(&agent.id).is_empty()
            {
                warn!(
                    agent_id = %agent.id,
                    consecutive_failures = agent.health.consecutive_failures,
                    "Recycling connections of failing agent"
                );
                closed += self.pool.recycle_agent(&agent.id);
            }
        }
        closed
    }

    /// Run one discovery sweep against the configured source
    pub async fn run_discovery(&self) -> Result<DiscoverySync, TransportError> {
        let Some(source) = self.discovery.as_ref() else {
            return Ok(DiscoverySync::default());
        };
        let discovered = source.discover().await?;
        let sync = self.registry.sync_discovered(discovered);
        for agent_id in &sync.removed {
            self.forget(agent_id);
        }
        Ok(sync)
    }

    /// Prune old samples and hand a snapshot to the metrics sink
    pub fn publish_metrics(&self) {
        let pruned = self.metrics.prune();
        if pruned > 0 {
            debug!(pruned, "Pruned expired latency samples");
        }
        self.sink.publish(&self.get_metrics());
    }

    /// Start the background loops
    ///
    /// Only the first call starts anything, including calls racing each
    /// other and calls after `shutdown`.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("Orchestrator already started");
            return;
        }

        if self.config.registry.discovery_enabled && self.discovery.is_some() {
            if let Err(e) = self.run_discovery().await {
                warn!("Initial discovery sweep failed: {}", e);
            }
        }

        let mut handles = vec![
            self.spawn_loop(
                "health_probe",
                self.config.registry.health_check_interval(),
                |o| async move {
                    o.probe_agents().await;
                },
            ),
            self.spawn_loop(
                "pool_maintenance",
                self.config.connection_pool.health_check_interval(),
                |o| async move {
                    o.maintain_pool();
                },
            ),
        ];

        if self.config.registry.discovery_enabled && self.discovery.is_some() {
            handles.push(self.spawn_loop(
                "discovery",
                self.config.registry.discovery_interval(),
                |o| async move {
                    if let Err(e) = o.run_discovery().await {
                        warn!("Discovery sweep failed: {}", e);
                    }
                },
            ));
        }

        if self.config.telemetry.enabled {
            handles.push(self.spawn_loop(
                "telemetry",
                self.config.telemetry.metrics_interval(),
                |o| async move {
                    o.publish_metrics();
                },
            ));
        }

        info!(loops = handles.len(), "Orchestrator started");
        self.background.lock().extend(handles);
    }

    /// Run `tick` every `period` for as long as the orchestrator is alive
    fn spawn_loop<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let orchestrator: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // first tick completes immediately

            loop {
                interval.tick().await;
                let Some(orchestrator) = orchestrator.upgrade() else {
                    debug!(task = name, "Orchestrator dropped, stopping loop");
                    break;
                };
                tick(orchestrator).await;
            }
        })
    }

    /// Stop background loops, refuse new tasks and close every connection
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.router.close();

        let handles: Vec<_> = self.background.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Background loop shutdown error: {}", e);
                }
            }
        }

        let closed = self.pool.close_all();
        info!(closed, "Orchestrator shutdown complete");
    }
}
