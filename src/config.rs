//! Orchestrator configuration
//!
//! A single structured object with one section per component. Every field has
//! a default, unknown keys are rejected, and `validate()` refuses out-of-range
//! values instead of merging them silently.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub registry: RegistryConfig,
    pub routing: RoutingConfig,
    pub connection_pool: ConnectionPoolConfig,
    pub telemetry: TelemetryConfig,
}

/// Agent registry capacity and probing cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Maximum number of registered agents
    pub max_agents: usize,
    /// Interval between health probe sweeps
    pub health_check_interval_ms: u64,
    /// Run the discovery source periodically
    pub discovery_enabled: bool,
    /// Interval between discovery sweeps
    pub discovery_interval_ms: u64,
    /// Consecutive failed probes before an agent is marked unreachable
    pub unreachable_after: u32,
    /// Consecutive failed probes before an agent is evicted
    pub eviction_threshold: u32,
    /// Exponential moving average weight for performance signals
    pub ema_alpha: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_agents: 1500,
            health_check_interval_ms: 30_000,
            discovery_enabled: false,
            discovery_interval_ms: 60_000,
            unreachable_after: 3,
            eviction_threshold: 5,
            ema_alpha: 0.1,
        }
    }
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

/// Routing strategy selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Highest compatibility score wins
    #[default]
    CapabilityMatch,
    /// Cycle through candidates in stable id order
    RoundRobin,
    /// Fewest in-use pool connections wins
    LeastConnections,
    /// Lowest average latency wins
    ResponseTime,
}

impl RoutingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::CapabilityMatch => "capability-match",
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::LeastConnections => "least-connections",
            RoutingStrategy::ResponseTime => "response-time",
        }
    }
}

/// Routing and retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    pub default_strategy: RoutingStrategy,
    pub enable_adaptive_routing: bool,
    /// Step size for adaptive weight updates
    pub learning_rate: f64,
    /// Largest shift the learned weight may apply to a compatibility score
    pub adaptive_weight_cap: f64,
    pub max_concurrent_tasks: usize,
    pub task_timeout_ms: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay between attempts, doubled on every retry
    pub retry_delay_ms: u64,
    /// Queue rate-limited tasks by priority instead of failing fast
    pub priority_queues: bool,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: RoutingStrategy::CapabilityMatch,
            enable_adaptive_routing: true,
            learning_rate: 0.1,
            adaptive_weight_cap: 0.1,
            max_concurrent_tasks: 100,
            task_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            priority_queues: true,
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

impl RoutingConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// What a circuit breaker is keyed by
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreakerScope {
    /// One breaker per agent
    #[default]
    Agent,
    /// One breaker per agent and required capability set
    Capability,
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Sliding window over which failures are counted
    pub monitoring_period_ms: u64,
    pub scope: BreakerScope,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            monitoring_period_ms: 60_000,
            scope: BreakerScope::Agent,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_millis(self.monitoring_period_ms)
    }
}

/// Per-agent throttling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub max_requests_per_second: u32,
    pub burst_size: u32,
    pub window_size_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: 10,
            burst_size: 20,
            window_size_ms: 1_000,
        }
    }
}

impl RateLimitConfig {
    pub fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    /// Requests admitted back to back within one window
    pub fn capacity(&self) -> f64 {
        f64::from(self.max_requests_per_second) + f64::from(self.burst_size)
    }

    /// Tokens regained per second
    ///
    /// Never faster than `max_requests_per_second`, and never more than one
    /// full `capacity` per window.
    pub fn refill_rate(&self) -> f64 {
        let window_secs = self.window_size().as_secs_f64();
        let per_window = self.capacity() / window_secs;
        f64::from(self.max_requests_per_second).min(per_window)
    }
}

/// Connection pooling limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionPoolConfig {
    pub max_total_connections: usize,
    pub max_connections_per_agent: usize,
    pub connection_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Consecutive failed probes after which an agent's connections are recycled
    pub retry_attempts: u32,
    /// Connections opened eagerly for agents registered as warm
    pub warmup_connections: usize,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 200,
            max_connections_per_agent: 5,
            connection_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            health_check_interval_ms: 60_000,
            retry_attempts: 3,
            warmup_connections: 2,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Metrics emission
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub metrics_interval_ms: u64,
    /// How long latency samples are kept for percentile reporting
    pub retention_period_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval_ms: 60_000,
            retention_period_ms: 3_600_000,
        }
    }
}

impl TelemetryConfig {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn retention_period(&self) -> Duration {
        Duration::from_millis(self.retention_period_ms)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

fn invalid<S: Into<String>>(message: S) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

fn require_positive_ms(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(format!("{name} must be greater than zero")));
    }
    Ok(())
}

fn require_unit_interval(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(invalid(format!("{name} must be in (0, 1], got {value}")));
    }
    Ok(())
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: OrchestratorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_registry()?;
        self.validate_routing()?;
        self.validate_pool()?;
        self.validate_telemetry()
    }

    fn validate_registry(&self) -> Result<(), ConfigError> {
        let registry = &self.registry;
        if registry.max_agents == 0 {
            return Err(invalid("registry.max_agents must be greater than zero"));
        }
        require_positive_ms(
            "registry.health_check_interval_ms",
            registry.health_check_interval_ms,
        )?;
        require_positive_ms(
            "registry.discovery_interval_ms",
            registry.discovery_interval_ms,
        )?;
        if registry.unreachable_after == 0 {
            return Err(invalid("registry.unreachable_after must be greater than zero"));
        }
        if registry.eviction_threshold < registry.unreachable_after {
            return Err(invalid(format!(
                "registry.eviction_threshold ({}) must be at least registry.unreachable_after ({})",
                registry.eviction_threshold, registry.unreachable_after
            )));
        }
        require_unit_interval("registry.ema_alpha", registry.ema_alpha)
    }

    fn validate_routing(&self) -> Result<(), ConfigError> {
        let routing = &self.routing;
        require_unit_interval("routing.learning_rate", routing.learning_rate)?;
        if !(0.0..=1.0).contains(&routing.adaptive_weight_cap) {
            return Err(invalid(format!(
                "routing.adaptive_weight_cap must be in [0, 1], got {}",
                routing.adaptive_weight_cap
            )));
        }
        if routing.max_concurrent_tasks == 0 {
            return Err(invalid(
                "routing.max_concurrent_tasks must be greater than zero",
            ));
        }
        require_positive_ms("routing.task_timeout_ms", routing.task_timeout_ms)?;
        require_positive_ms("routing.retry_delay_ms", routing.retry_delay_ms)?;

        let breaker = &routing.circuit_breaker;
        if breaker.failure_threshold == 0 {
            return Err(invalid(
                "routing.circuit_breaker.failure_threshold must be greater than zero",
            ));
        }
        require_positive_ms(
            "routing.circuit_breaker.reset_timeout_ms",
            breaker.reset_timeout_ms,
        )?;
        require_positive_ms(
            "routing.circuit_breaker.monitoring_period_ms",
            breaker.monitoring_period_ms,
        )?;

        let limit = &routing.rate_limit;
        if limit.max_requests_per_second == 0 {
            return Err(invalid(
                "routing.rate_limit.max_requests_per_second must be greater than zero",
            ));
        }
        require_positive_ms("routing.rate_limit.window_size_ms", limit.window_size_ms)
    }

    fn validate_pool(&self) -> Result<(), ConfigError> {
        let pool = &self.connection_pool;
        if pool.max_total_connections == 0 || pool.max_connections_per_agent == 0 {
            return Err(invalid("connection_pool limits must be greater than zero"));
        }
        if pool.max_connections_per_agent > pool.max_total_connections {
            return Err(invalid(format!(
                "connection_pool.max_connections_per_agent ({}) exceeds max_total_connections ({})",
                pool.max_connections_per_agent, pool.max_total_connections
            )));
        }
        require_positive_ms(
            "connection_pool.connection_timeout_ms",
            pool.connection_timeout_ms,
        )?;
        require_positive_ms("connection_pool.idle_timeout_ms", pool.idle_timeout_ms)?;
        require_positive_ms(
            "connection_pool.health_check_interval_ms",
            pool.health_check_interval_ms,
        )?;
        if pool.retry_attempts == 0 {
            return Err(invalid(
                "connection_pool.retry_attempts must be greater than zero",
            ));
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<(), ConfigError> {
        require_positive_ms(
            "telemetry.metrics_interval_ms",
            self.telemetry.metrics_interval_ms,
        )?;
        require_positive_ms(
            "telemetry.retention_period_ms",
            self.telemetry.retention_period_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.max_agents, 1500);
        assert_eq!(
            config.routing.default_strategy,
            RoutingStrategy::CapabilityMatch
        );
        assert_eq!(config.routing.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.connection_pool.max_connections_per_agent, 5);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn test_partial_override() {
        let toml_content = r#"
[registry]
max_agents = 10

[routing]
default_strategy = "round-robin"
max_retries = 1

[routing.circuit_breaker]
failure_threshold = 3
scope = "capability"

[routing.rate_limit]
max_requests_per_second = 2
burst_size = 1

[connection_pool]
max_total_connections = 8
max_connections_per_agent = 2
"#;

        let config = OrchestratorConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.registry.max_agents, 10);
        assert_eq!(config.registry.eviction_threshold, 5);
        assert_eq!(config.routing.default_strategy, RoutingStrategy::RoundRobin);
        assert_eq!(config.routing.max_retries, 1);
        assert_eq!(config.routing.task_timeout_ms, 30_000);
        assert_eq!(config.routing.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.routing.circuit_breaker.scope, BreakerScope::Capability);
        assert_eq!(config.routing.rate_limit.capacity(), 3.0);
        assert_eq!(config.connection_pool.max_total_connections, 8);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let result = OrchestratorConfig::from_toml_str("[routing]\nmax_retires = 2\n");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = OrchestratorConfig::from_toml_str("[routing]\ntask_timeout_ms = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_negative_timeout_rejected_at_parse() {
        let result = OrchestratorConfig::from_toml_str("[routing]\ntask_timeout_ms = -5\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_per_agent_cap_above_total_rejected() {
        let mut config = OrchestratorConfig::default();
        config.connection_pool.max_connections_per_agent = 500;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_connections_per_agent"));
    }

    #[test]
    fn test_learning_rate_out_of_range_rejected() {
        let mut config = OrchestratorConfig::default();
        config.routing.learning_rate = 1.5;
        assert!(config.validate().is_err());

        config.routing.learning_rate = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_eviction_below_unreachable_rejected() {
        let mut config = OrchestratorConfig::default();
        config.registry.eviction_threshold = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_names() {
        for strategy in [
            RoutingStrategy::CapabilityMatch,
            RoutingStrategy::RoundRobin,
            RoutingStrategy::LeastConnections,
            RoutingStrategy::ResponseTime,
        ] {
            let json = serde_json::to_string(&strategy).unwrap();
            assert_eq!(json, format!("\"{}\"", strategy.as_str()));
        }
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[telemetry]\nenabled = false\nmetrics_interval_ms = 500").unwrap();

        let config = OrchestratorConfig::load_from_file(file.path()).unwrap();
        assert!(!config.telemetry.enabled);
        assert_eq!(config.telemetry.metrics_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = OrchestratorConfig::load_from_file(Path::new("/nonexistent/agentmesh.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }
}
