//! Agent registry
//!
//! Catalog of agents, their typed capabilities and rolling health and
//! performance signals, plus capability matching and discovery sync.

pub mod agent;
pub mod discovery;
pub mod scoring;
pub mod store;

pub use agent::{
    derive_agent_id, Agent, AgentHealth, AgentMetadata, AgentOrigin, AgentPerformance, Capability,
    HealthStatus,
};
pub use discovery::DiscoverySource;
pub use scoring::{compatibility_score, CapableAgents, ScoredAgent};
pub use store::{AgentFilter, AgentRegistry, DiscoverySync, HealthDisposition, Outcome};
