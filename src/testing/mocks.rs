//! Mock implementations for testing
//!
//! Provides a scriptable [`AgentTransport`] and a static [`DiscoverySource`]
//! so the registry, pool and router can be exercised without real agents.

use crate::pool::ConnectionInfo;
use crate::registry::{Agent, AgentMetadata, DiscoverySource};
use crate::routing::Task;
use crate::transport::{AgentTransport, ProbeResult, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct AgentScript {
    /// Invocations left that fail before the agent recovers
    fail_next: u32,
    fail_always: bool,
    refuse: bool,
    latency: Duration,
    probes: VecDeque<ProbeResult>,
    probe: Option<ProbeResult>,
    /// Accumulated failure budget for rate-based failures
    failure_debt: f64,
}

/// Scriptable transport for testing
///
/// Every agent succeeds instantly unless told otherwise. Invocations are
/// counted per agent; opened and closed connections are counted globally.
#[derive(Debug, Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, AgentScript>>,
    invocations: Mutex<HashMap<String, u64>>,
    fail_open: Mutex<HashSet<String>>,
    failure_rate: Mutex<f64>,
    opened: AtomicU64,
    closed: AtomicU64,
    probes: AtomicU64,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail a fraction of invocations on every agent, spread evenly
    pub fn with_failure_rate(rate: f64) -> Self {
        let transport = Self::default();
        *transport.failure_rate.lock() = rate.clamp(0.0, 1.0);
        transport
    }

    fn script<R>(&self, agent_id: &str, f: impl FnOnce(&mut AgentScript) -> R) -> R {
        let mut scripts = self.scripts.lock();
        f(scripts.entry(agent_id.to_string()).or_default())
    }

    /// Fail the next `count` invocations on `agent_id`
    pub fn fail_next(&self, agent_id: &str, count: u32) {
        self.script(agent_id, |s| s.fail_next = count);
    }

    pub fn fail_always(&self, agent_id: &str, fail: bool) {
        self.script(agent_id, |s| s.fail_always = fail);
    }

    /// Answer invocations with `ConnectionRefused`
    pub fn refuse_connections(&self, agent_id: &str, refuse: bool) {
        self.script(agent_id, |s| s.refuse = refuse);
    }

    pub fn set_latency(&self, agent_id: &str, latency: Duration) {
        self.script(agent_id, |s| s.latency = latency);
    }

    /// Make opening connections to `agent_id` fail
    pub fn fail_open(&self, agent_id: &str) {
        self.fail_open.lock().insert(agent_id.to_string());
    }

    pub fn allow_open(&self, agent_id: &str) {
        self.fail_open.lock().remove(agent_id);
    }

    /// Probe result returned for `agent_id` from now on
    pub fn set_probe(&self, agent_id: &str, result: ProbeResult) {
        self.script(agent_id, |s| s.probe = Some(result));
    }

    /// Probe results returned once each, before the persistent one
    pub fn queue_probes<I>(&self, agent_id: &str, results: I)
    where
        I: IntoIterator<Item = ProbeResult>,
    {
        self.script(agent_id, |s| s.probes.extend(results));
    }

    pub fn invocations(&self, agent_id: &str) -> u64 {
        self.invocations.lock().get(agent_id).copied().unwrap_or(0)
    }

    pub fn total_invocations(&self) -> u64 {
        self.invocations.lock().values().sum()
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Decide this invocation's outcome and consume any scripted failure
    fn next_outcome(&self, agent_id: &str) -> (Duration, Option<TransportError>) {
        let rate = *self.failure_rate.lock();
        self.script(agent_id, |s| {
            let error = if s.refuse {
                Some(TransportError::ConnectionRefused(format!(
                    "{agent_id} refused the connection"
                )))
            } else if s.fail_always {
                Some(TransportError::Remote("scripted failure".to_string()))
            } else if s.fail_next > 0 {
                s.fail_next -= 1;
                Some(TransportError::Remote("scripted failure".to_string()))
            } else {
                s.failure_debt += rate;
                if s.failure_debt >= 1.0 {
                    s.failure_debt -= 1.0;
                    Some(TransportError::Remote("simulated failure".to_string()))
                } else {
                    None
                }
            };
            (s.latency, error)
        })
    }
}

#[async_trait]
impl AgentTransport for MockTransport {
    async fn open(&self, agent_id: &str) -> Result<(), TransportError> {
        if self.fail_open.lock().contains(agent_id) {
            return Err(TransportError::ConnectionRefused(format!(
                "cannot reach {agent_id}"
            )));
        }
        self.opened.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self, _connection: &ConnectionInfo) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    async fn invoke(
        &self,
        agent: &Agent,
        connection: &ConnectionInfo,
        task: &Task,
    ) -> Result<Value, TransportError> {
        *self
            .invocations
            .lock()
            .entry(agent.id.clone())
            .or_insert(0) += 1;

        let (latency, error) = self.next_outcome(&agent.id);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        match error {
            Some(error) => Err(error),
            None => Ok(json!({
                "agent_id": agent.id,
                "task_id": task.id,
                "task_type": task.task_type,
                "connection_id": connection.id,
                "context": task.context,
            })),
        }
    }

    async fn probe(&self, agent: &Agent) -> ProbeResult {
        self.probes.fetch_add(1, Ordering::Relaxed);
        self.script(&agent.id, |s| {
            s.probes
                .pop_front()
                .or_else(|| s.probe.clone())
                .unwrap_or_else(|| ProbeResult::healthy(5))
        })
    }
}

/// Discovery source returning a fixed, replaceable set of agents
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    agents: Mutex<Vec<AgentMetadata>>,
    failing: Mutex<bool>,
    calls: AtomicU64,
}

impl StaticDiscovery {
    pub fn new(agents: Vec<AgentMetadata>) -> Self {
        Self {
            agents: Mutex::new(agents),
            ..Default::default()
        }
    }

    /// Replace what the next sweep returns
    pub fn set_agents(&self, agents: Vec<AgentMetadata>) {
        *self.agents.lock() = agents;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn discover(&self) -> Result<Vec<AgentMetadata>, TransportError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if *self.failing.lock() {
            return Err(TransportError::Other("discovery backend unavailable".into()));
        }
        Ok(self.agents.lock().clone())
    }
}

/// Metadata for an agent with a stable id equal to `id`
pub fn agent_metadata(id: &str, capabilities: &[&str]) -> AgentMetadata {
    AgentMetadata::new(id, format!("http://{id}.agents.local:8080"))
        .with_id(id)
        .with_capabilities(capabilities.iter().copied())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentOrigin;

    fn agent(id: &str) -> Agent {
        let metadata = agent_metadata(id, &["x"]);
        let parsed = metadata.parse().unwrap();
        Agent::from_metadata(metadata, parsed, AgentOrigin::Manual)
    }

    fn conn(agent_id: &str) -> ConnectionInfo {
        ConnectionInfo {
            id: uuid::Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            lease: 1,
            created_at: tokio::time::Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_then_recovery() {
        let transport = MockTransport::new();
        transport.fail_next("a1", 2);
        let a1 = agent("a1");
        let task = Task::new("t", ["x"]);

        assert!(transport.invoke(&a1, &conn("a1"), &task).await.is_err());
        assert!(transport.invoke(&a1, &conn("a1"), &task).await.is_err());
        let output = transport.invoke(&a1, &conn("a1"), &task).await.unwrap();
        assert_eq!(output["agent_id"], "a1");
        assert_eq!(transport.invocations("a1"), 3);
    }

    #[tokio::test]
    async fn test_failure_rate_is_evenly_spread() {
        let transport = MockTransport::with_failure_rate(0.25);
        let a1 = agent("a1");
        let task = Task::new("t", ["x"]);

        let mut failures = 0;
        for _ in 0..8 {
            if transport.invoke(&a1, &conn("a1"), &task).await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_probe_queue_then_persistent() {
        let transport = MockTransport::new();
        transport.queue_probes("a1", [ProbeResult::failed("boom")]);
        let a1 = agent("a1");

        assert!(!transport.probe(&a1).await.healthy);
        assert!(transport.probe(&a1).await.healthy);
        assert_eq!(transport.probe_count(), 2);
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let discovery = StaticDiscovery::new(vec![agent_metadata("a1", &["x"])]);
        assert_eq!(discovery.discover().await.unwrap().len(), 1);

        discovery.set_failing(true);
        assert!(discovery.discover().await.is_err());
        assert_eq!(discovery.calls(), 2);
    }
}
