//! Agent invocation capability
//!
//! The wire protocol used to reach an agent is supplied by the embedding
//! application. The core only needs to open channels, invoke tasks and probe
//! health through this trait, which keeps it testable with mocks.

use crate::pool::ConnectionInfo;
use crate::registry::Agent;
use crate::routing::Task;
use async_trait::async_trait;
use thiserror::Error;

/// Failure reported by the transport for one call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("agent returned error: {0}")]
    Remote(String),
    #[error("transport failure: {0}")]
    Other(String),
}

/// Outcome of a single health probe
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn healthy(latency_ms: u64) -> Self {
        Self {
            healthy: true,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn failed<S: Into<String>>(message: S) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Transport used to reach agents
///
/// Implementations must be cheap to share; the pool and router call them
/// concurrently and never while holding a lock.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Establish a new channel to an agent
    async fn open(&self, _agent_id: &str) -> Result<(), TransportError> {
        Ok(())
    }

    /// Tear down a channel the pool has dropped
    fn close(&self, _connection: &ConnectionInfo) {}

    /// Execute a task on the agent over the given connection
    async fn invoke(
        &self,
        agent: &Agent,
        connection: &ConnectionInfo,
        task: &Task,
    ) -> Result<serde_json::Value, TransportError>;

    /// Check agent liveness
    async fn probe(&self, _agent: &Agent) -> ProbeResult {
        ProbeResult::healthy(0)
    }
}
