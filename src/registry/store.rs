//! Agent registry
//!
//! Thread-safe catalog of agents. The map itself is only locked long enough
//! to find or insert an entry; each agent record has its own mutex so
//! concurrent outcome and probe updates on different agents never contend.

use super::agent::{Agent, AgentMetadata, AgentOrigin, HealthStatus};
use super::scoring::{compatibility_score, CapableAgents, ScoredAgent};
use crate::config::RegistryConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, OrchestratorEvent};
use crate::transport::ProbeResult;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Successful probes slower than this mark the agent degraded
const DEGRADED_PROBE_LATENCY_MS: u64 = 2000;

/// Outcome of a task execution fed back into performance signals
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Outcome {
    pub success: bool,
    pub latency_ms: u64,
}

impl Outcome {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
        }
    }

    pub fn failure(latency_ms: u64) -> Self {
        Self {
            success: false,
            latency_ms,
        }
    }
}

/// Result of applying a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthDisposition {
    Updated(HealthStatus),
    Evicted,
}

/// Snapshot filter for administrative listings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentFilter {
    pub status: Option<HealthStatus>,
    pub capability: Option<String>,
    pub origin: Option<AgentOrigin>,
}

impl AgentFilter {
    pub fn with_status(mut self, status: HealthStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.capability = Some(capability.into());
        self
    }

    pub fn with_origin(mut self, origin: AgentOrigin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.status.map_or(true, |s| agent.health.status == s)
            && self
                .capability
                .as_deref()
                .map_or(true, |c| agent.has_capability(c))
            && self.origin.map_or(true, |o| agent.origin == o)
    }
}

/// Summary of one discovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoverySync {
    pub registered: usize,
    /// Ids of discovered agents dropped because the sweep no longer lists them
    pub removed: Vec<String>,
    pub rejected: usize,
}

type AgentSlot = Arc<Mutex<Agent>>;

/// Thread-safe registry of agents
#[derive(Debug)]
pub struct AgentRegistry {
    config: RegistryConfig,
    agents: RwLock<HashMap<String, AgentSlot>>,
    events: EventBus,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default(), EventBus::default())
    }
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register or update an agent
    pub fn register(&self, metadata: AgentMetadata) -> OrchestratorResult<Agent> {
        self.register_with_origin(metadata, AgentOrigin::Manual)
    }

    pub(crate) fn register_with_origin(
        &self,
        metadata: AgentMetadata,
        origin: AgentOrigin,
    ) -> OrchestratorResult<Agent> {
        let parsed = metadata.parse()?;
        let agent_id = parsed.id.clone();

        let (stored, updated) = {
            let mut agents = self.agents.write();
            match agents.get(&agent_id) {
                Some(slot) => {
                    let mut agent = slot.lock();
                    agent.apply_update(metadata, parsed);
                    (agent.clone(), true)
                }
                None => {
                    if agents.len() >= self.config.max_agents {
                        warn!(
                            agent_id = %agent_id,
                            capacity = self.config.max_agents,
                            "Registry full, rejecting registration"
                        );
                        return Err(OrchestratorError::CapacityExceeded {
                            capacity: self.config.max_agents,
                        });
                    }
                    let agent = Agent::from_metadata(metadata, parsed, origin);
                    agents.insert(agent_id.clone(), Arc::new(Mutex::new(agent.clone())));
                    (agent, false)
                }
            }
        };

        if updated {
            debug!("Updated agent info: {}", agent_id);
        } else {
            info!(
                "Registered new agent: {} ({} capabilities)",
                agent_id,
                stored.capabilities.len()
            );
        }
        self.events
            .emit(OrchestratorEvent::AgentRegistered { agent_id, updated });

        Ok(stored)
    }

    /// Remove an agent; absent ids are a no-op
    pub fn deregister(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().remove(agent_id).is_some();
        if removed {
            info!("Deregistered agent: {}", agent_id);
            self.events.emit(OrchestratorEvent::AgentDeregistered {
                agent_id: agent_id.to_string(),
            });
        }
        removed
    }

    fn slot(&self, agent_id: &str) -> Option<AgentSlot> {
        self.agents.read().get(agent_id).cloned()
    }

    fn slots(&self) -> Vec<AgentSlot> {
        self.agents.read().values().cloned().collect()
    }

    /// Get agent snapshot by ID
    pub fn get(&self, agent_id: &str) -> Option<Agent> {
        self.slot(agent_id).map(|slot| slot.lock().clone())
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Agents whose capability names cover `required`, best match first
    pub fn find_capable<I, S>(&self, required: I) -> CapableAgents
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let required: BTreeSet<String> = required.into_iter().map(Into::into).collect();
        if required.is_empty() {
            return CapableAgents::new(required, Vec::new());
        }

        let scored = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let agent = slot.lock();
                compatibility_score(&agent, &required).map(|score| ScoredAgent::new(&agent, score))
            })
            .collect();

        CapableAgents::new(required, scored)
    }

    /// Fold a task outcome into the agent's rolling signals
    pub fn record_outcome(&self, agent_id: &str, outcome: Outcome) -> OrchestratorResult<()> {
        let slot = self
            .slot(agent_id)
            .ok_or_else(|| OrchestratorError::agent_not_found(agent_id))?;

        let mut agent = slot.lock();
        agent
            .performance
            .record(outcome.success, outcome.latency_ms, self.config.ema_alpha);
        debug!(
            agent_id = %agent_id,
            success = outcome.success,
            latency_ms = outcome.latency_ms,
            success_score = agent.performance.success_score,
            "Recorded task outcome"
        );
        Ok(())
    }

    /// Apply a health probe result, evicting the agent past the failure threshold
    pub fn record_health(
        &self,
        agent_id: &str,
        probe: &ProbeResult,
    ) -> OrchestratorResult<HealthDisposition> {
        let slot = self
            .slot(agent_id)
            .ok_or_else(|| OrchestratorError::agent_not_found(agent_id))?;

        let (previous, status, failures) = {
            let mut agent = slot.lock();
            let previous = agent.health.status;
            agent.health.last_checked_at = Some(Utc::now());

            if probe.healthy {
                agent.health.consecutive_failures = 0;
                agent.health.status = match probe.latency_ms {
                    Some(ms) if ms > DEGRADED_PROBE_LATENCY_MS => HealthStatus::Degraded,
                    _ => HealthStatus::Healthy,
                };
            } else {
                agent.health.consecutive_failures += 1;
                agent.health.status =
                    if agent.health.consecutive_failures >= self.config.unreachable_after {
                        HealthStatus::Unreachable
                    } else {
                        HealthStatus::Degraded
                    };
            }

            (
                previous,
                agent.health.status,
                agent.health.consecutive_failures,
            )
        };

        if previous != status {
            info!(
                agent_id = %agent_id,
                from = %previous,
                to = %status,
                "Agent health changed"
            );
            self.events.emit(OrchestratorEvent::AgentHealthChanged {
                agent_id: agent_id.to_string(),
                from: previous,
                to: status,
            });
        }

        if !probe.healthy && failures >= self.config.eviction_threshold {
            let evicted = {
                let mut agents = self.agents.write();
                match agents.get(agent_id) {
                    Some(current) if Arc::ptr_eq(current, &slot) => {
                        agents.remove(agent_id);
                        true
                    }
                    _ => false,
                }
            };
            if evicted {
                warn!(
                    agent_id = %agent_id,
                    consecutive_failures = failures,
                    "Evicting unreachable agent"
                );
                self.events.emit(OrchestratorEvent::AgentEvicted {
                    agent_id: agent_id.to_string(),
                    consecutive_failures: failures,
                });
                return Ok(HealthDisposition::Evicted);
            }
        }

        Ok(HealthDisposition::Updated(status))
    }

    /// Snapshot of agents matching `filter`, ordered by id
    pub fn list_agents(&self, filter: Option<&AgentFilter>) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .slots()
            .into_iter()
            .map(|slot| slot.lock().clone())
            .filter(|agent| filter.map_or(true, |f| f.matches(agent)))
            .collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Count of agents per health status
    pub fn status_counts(&self) -> HashMap<HealthStatus, usize> {
        let mut counts = HashMap::new();
        for slot in self.slots() {
            let status = slot.lock().health.status;
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }

    /// Reconcile with a discovery sweep
    ///
    /// Every discovered agent is upserted. Agents that entered through
    /// discovery and are missing from this sweep are deregistered; manual
    /// registrations are never touched.
    pub fn sync_discovered(&self, discovered: Vec<AgentMetadata>) -> DiscoverySync {
        let mut summary = DiscoverySync::default();
        let mut seen = HashSet::new();

        for metadata in discovered {
            match self.register_with_origin(metadata, AgentOrigin::Discovered) {
                Ok(agent) => {
                    seen.insert(agent.id);
                    summary.registered += 1;
                }
                Err(e) => {
                    warn!("Rejected discovered agent: {}", e);
                    summary.rejected += 1;
                }
            }
        }

        let stale: Vec<String> = self
            .list_agents(Some(&AgentFilter::default().with_origin(AgentOrigin::Discovered)))
            .into_iter()
            .map(|agent| agent.id)
            .filter(|id| !seen.contains(id))
            .collect();

        for agent_id in stale {
            if self.deregister(&agent_id) {
                summary.removed.push(agent_id);
            }
        }

        if !summary.removed.is_empty() || summary.rejected > 0 {
            info!(
                "Discovery sweep: {} registered, {} removed, {} rejected",
                summary.registered,
                summary.removed.len(),
                summary.rejected
            );
        }
        summary
    }
}
