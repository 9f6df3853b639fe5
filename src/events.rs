//! Observable orchestration events
//!
//! Components publish onto a broadcast [`EventBus`] from inside the state
//! transition that caused the event, so events concerning one agent are
//! delivered in causal order. No ordering holds across distinct agents.

use crate::error::ErrorKind;
use crate::registry::HealthStatus;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Event payloads emitted by the registry, router and pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    AgentRegistered {
        agent_id: String,
        updated: bool,
    },
    AgentDeregistered {
        agent_id: String,
    },
    AgentEvicted {
        agent_id: String,
        consecutive_failures: u32,
    },
    AgentHealthChanged {
        agent_id: String,
        from: HealthStatus,
        to: HealthStatus,
    },
    TaskCompleted {
        task_id: Uuid,
        agent_id: String,
        attempts: u32,
        latency_ms: u64,
    },
    TaskRetrying {
        task_id: Uuid,
        agent_id: String,
        attempt: u32,
        error: ErrorKind,
    },
    TaskFailed {
        task_id: Uuid,
        error: ErrorKind,
        attempts: u32,
        tried_agents: Vec<String>,
    },
    CircuitOpened {
        key: String,
        failure_count: u32,
    },
    CircuitHalfOpen {
        key: String,
    },
    CircuitClosed {
        key: String,
    },
    PoolExhausted {
        agent_id: String,
    },
}

impl OrchestratorEvent {
    /// Dotted event name as seen by collaborators
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::AgentRegistered { .. } => "agent.registered",
            OrchestratorEvent::AgentDeregistered { .. } => "agent.deregistered",
            OrchestratorEvent::AgentEvicted { .. } => "agent.evicted",
            OrchestratorEvent::AgentHealthChanged { .. } => "agent.health.changed",
            OrchestratorEvent::TaskCompleted { .. } => "task.completed",
            OrchestratorEvent::TaskRetrying { .. } => "task.retrying",
            OrchestratorEvent::TaskFailed { .. } => "task.failed",
            OrchestratorEvent::CircuitOpened { .. } => "circuit.opened",
            OrchestratorEvent::CircuitHalfOpen { .. } => "circuit.half_open",
            OrchestratorEvent::CircuitClosed { .. } => "circuit.closed",
            OrchestratorEvent::PoolExhausted { .. } => "pool.exhausted",
        }
    }

    /// Agent the event concerns, if any
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            OrchestratorEvent::AgentRegistered { agent_id, .. }
            | OrchestratorEvent::AgentDeregistered { agent_id }
            | OrchestratorEvent::AgentEvicted { agent_id, .. }
            | OrchestratorEvent::AgentHealthChanged { agent_id, .. }
            | OrchestratorEvent::TaskCompleted { agent_id, .. }
            | OrchestratorEvent::TaskRetrying { agent_id, .. }
            | OrchestratorEvent::PoolExhausted { agent_id } => Some(agent_id),
            _ => None,
        }
    }
}

/// Broadcast channel shared by all components of one orchestrator
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn emit(&self, event: OrchestratorEvent) {
        trace!(event = event.name(), "emitting event");
        let _ = self.sender.send(event);
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
