//! Agent records and their typed building blocks

use crate::error::{OrchestratorError, OrchestratorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A named, versioned unit of functionality
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: Option<String>,
}

impl Capability {
    pub fn new<S: Into<String>>(name: S, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl FromStr for Capability {
    type Err = OrchestratorError;

    /// Parse `name` or `name@version`
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let (name, version) = match raw.split_once('@') {
            Some((name, version)) => (name, Some(version)),
            None => (raw, None),
        };

        validate_capability_name(name)?;

        let version = match version {
            Some(v) if v.is_empty() || v.contains('@') || v.chars().any(char::is_whitespace) => {
                return Err(OrchestratorError::invalid_metadata(format!(
                    "capability '{raw}' has an invalid version"
                )));
            }
            Some(v) => Some(v.to_string()),
            None => None,
        };

        Ok(Capability::new(name, version))
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => f.write_str(&self.name),
        }
    }
}

fn validate_capability_name(name: &str) -> OrchestratorResult<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'));

    if name.is_empty() || !valid_chars {
        return Err(OrchestratorError::invalid_metadata(format!(
            "capability name '{name}' must match [A-Za-z0-9._:-]+"
        )));
    }
    Ok(())
}

/// Registration request for an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetadata {
    /// Explicit identity; derived from name and endpoint when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub endpoint: String,
    /// Capabilities as `name` or `name@version`
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Eagerly open pool connections for this agent
    #[serde(default)]
    pub warm: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl AgentMetadata {
    pub fn new<N: Into<String>, E: Into<String>>(name: N, endpoint: E) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_capability<S: Into<String>>(mut self, capability: S) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn warm(mut self) -> Self {
        self.warm = true;
        self
    }

    /// Stable identity for this agent
    pub fn agent_id(&self) -> OrchestratorResult<String> {
        match self.id.as_deref().map(str::trim) {
            Some("") => Err(OrchestratorError::invalid_metadata("agent id is empty")),
            Some(id) => Ok(id.to_string()),
            None => {
                if self.name.trim().is_empty() || self.endpoint.trim().is_empty() {
                    return Err(OrchestratorError::invalid_metadata(
                        "agent id cannot be derived without name and endpoint",
                    ));
                }
                Ok(derive_agent_id(&self.name, &self.endpoint))
            }
        }
    }

    /// Validate and parse into the parts the registry stores
    pub(crate) fn parse(&self) -> OrchestratorResult<ParsedMetadata> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::invalid_metadata("agent name is missing"));
        }
        if self.endpoint.trim().is_empty() {
            return Err(OrchestratorError::invalid_metadata(
                "agent endpoint is missing",
            ));
        }
        url::Url::parse(self.endpoint.trim()).map_err(|e| {
            OrchestratorError::invalid_metadata(format!(
                "agent endpoint '{}' is not a valid URL: {e}",
                self.endpoint
            ))
        })?;
        if self.capabilities.is_empty() {
            return Err(OrchestratorError::invalid_metadata(format!(
                "agent '{}' declares no capabilities",
                self.name
            )));
        }

        let capabilities = self
            .capabilities
            .iter()
            .map(|raw| raw.parse::<Capability>())
            .collect::<OrchestratorResult<BTreeSet<_>>>()?;

        Ok(ParsedMetadata {
            id: self.agent_id()?,
            capabilities,
        })
    }
}

pub(crate) struct ParsedMetadata {
    pub id: String,
    pub capabilities: BTreeSet<Capability>,
}

/// Deterministic identity from name and endpoint
pub fn derive_agent_id(name: &str, endpoint: &str) -> String {
    let key = format!("{}@{}", name.trim(), endpoint.trim());
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes()).to_string()
}

/// Health status derived from probes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthStatus {
    /// Whether the router may send tasks to an agent in this state
    pub fn is_routable(&self) -> bool {
        !matches!(self, HealthStatus::Unreachable)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unreachable => "unreachable",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentHealth {
    pub status: HealthStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Rolling performance signals
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentPerformance {
    /// Moving average of outcomes, 1.0 = always succeeds
    pub success_score: f64,
    pub average_latency_ms: f64,
    pub total_invocations: u64,
    pub total_failures: u64,
}

impl Default for AgentPerformance {
    fn default() -> Self {
        Self {
            success_score: 1.0,
            average_latency_ms: 0.0,
            total_invocations: 0,
            total_failures: 0,
        }
    }
}

impl AgentPerformance {
    pub(crate) fn record(&mut self, success: bool, latency_ms: u64, alpha: f64) {
        let observed = if success { 1.0 } else { 0.0 };
        let latency = latency_ms as f64;

        if self.total_invocations == 0 {
            self.average_latency_ms = latency;
        } else {
            self.average_latency_ms += alpha * (latency - self.average_latency_ms);
        }
        self.success_score += alpha * (observed - self.success_score);
        self.success_score = self.success_score.clamp(0.0, 1.0);

        self.total_invocations += 1;
        if !success {
            self.total_failures += 1;
        }
    }
}

/// How an agent entered the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AgentOrigin {
    #[default]
    Manual,
    Discovered,
}

/// A registered agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub capabilities: BTreeSet<Capability>,
    pub description: Option<String>,
    pub warm: bool,
    pub metadata: HashMap<String, serde_json::Value>,
    pub origin: AgentOrigin,
    pub health: AgentHealth,
    pub performance: AgentPerformance,
    pub registered_at: DateTime<Utc>,
}

impl Agent {
    pub(crate) fn from_metadata(
        metadata: AgentMetadata,
        parsed: ParsedMetadata,
        origin: AgentOrigin,
    ) -> Self {
        Self {
            id: parsed.id,
            name: metadata.name,
            endpoint: metadata.endpoint,
            capabilities: parsed.capabilities,
            description: metadata.description,
            warm: metadata.warm,
            metadata: metadata.metadata,
            origin,
            health: AgentHealth::default(),
            performance: AgentPerformance::default(),
            registered_at: Utc::now(),
        }
    }

    /// Replace declared attributes, keeping health and performance history
    pub(crate) fn apply_update(&mut self, metadata: AgentMetadata, parsed: ParsedMetadata) {
        self.name = metadata.name;
        self.endpoint = metadata.endpoint;
        self.capabilities = parsed.capabilities;
        self.description = metadata.description;
        self.warm = metadata.warm;
        self.metadata = metadata.metadata;
    }

    /// Capability names, versions dropped
    pub fn capability_names(&self) -> BTreeSet<&str> {
        self.capabilities.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}
