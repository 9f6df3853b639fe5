//! agentmesh - capability-aware task routing core
//!
//! Routes tasks to a large, changing population of remote agents while
//! bounding connection usage, isolating failing agents and adapting routing
//! to observed performance.
//!
//! # Overview
//!
//! - [`registry`]: agent catalog, capability matching and compatibility scoring
//! - [`routing`]: strategies, circuit breakers, rate limiting, retries
//! - [`pool`]: bounded, lazily created connections per agent
//! - [`orchestrator`]: the facade wiring everything from one configuration
//!
//! The wire protocol is supplied by the caller through [`AgentTransport`].
//!
//! # Quick Start
//!
//! ```rust
//! use agentmesh::testing::{agent_metadata, MockTransport};
//! use agentmesh::{Orchestrator, OrchestratorConfig, Task};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(MockTransport::new()),
//! )?;
//!
//! orchestrator
//!     .register_agent(agent_metadata("summarizer", &["summarize@1.0"]))
//!     .await?;
//!
//! let result = orchestrator
//!     .route_task(&Task::new("summarize", ["summarize"]))
//!     .await?;
//! assert_eq!(result.agent_id, "summarizer");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod routing;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{ErrorKind, OrchestratorError, OrchestratorResult};
pub use events::{EventBus, OrchestratorEvent};
pub use orchestrator::Orchestrator;
pub use registry::{Agent, AgentFilter, AgentMetadata, Capability, HealthStatus};
pub use routing::{Task, TaskPriority, TaskResult};
pub use transport::{AgentTransport, ProbeResult, TransportError};
