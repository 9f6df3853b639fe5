//! Discovery feed for the registry
//!
//! A [`DiscoverySource`] reports the agents it currently knows about; the
//! registry reconciles each sweep through `AgentRegistry::sync_discovered`.

use super::agent::AgentMetadata;
use crate::transport::TransportError;
use async_trait::async_trait;

/// External source of agent registrations
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// Full set of agents visible to this source right now
    async fn discover(&self) -> Result<Vec<AgentMetadata>, TransportError>;
}
