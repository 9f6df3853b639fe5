//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use agentmesh::config::{BreakerScope, ConfigError, OrchestratorConfig, RoutingStrategy};
use agentmesh::error::ErrorKind;
use agentmesh::testing::MockTransport;
use agentmesh::Orchestrator;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_full_config_loads_from_toml() {
    let file = write_config(
        r#"
[registry]
max_agents = 1500
health_check_interval_ms = 15000
discovery_enabled = true
discovery_interval_ms = 30000

[routing]
default_strategy = "least-connections"
enable_adaptive_routing = true
learning_rate = 0.2
max_concurrent_tasks = 64
task_timeout_ms = 10000
max_retries = 2
retry_delay_ms = 250
priority_queues = false

[routing.circuit_breaker]
failure_threshold = 4
reset_timeout_ms = 20000
monitoring_period_ms = 30000
scope = "capability"

[routing.rate_limit]
max_requests_per_second = 50
burst_size = 10
window_size_ms = 2000

[connection_pool]
max_total_connections = 400
max_connections_per_agent = 4
connection_timeout_ms = 2000
idle_timeout_ms = 120000
health_check_interval_ms = 30000
retry_attempts = 2
warmup_connections = 1

[telemetry]
enabled = false
metrics_interval_ms = 5000
retention_period_ms = 600000
"#,
    );

    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    assert!(config.registry.discovery_enabled);
    assert_eq!(
        config.routing.default_strategy,
        RoutingStrategy::LeastConnections
    );
    assert_eq!(config.routing.max_concurrent_tasks, 64);
    assert!(!config.routing.priority_queues);
    assert_eq!(config.routing.circuit_breaker.scope, BreakerScope::Capability);
    assert_eq!(config.routing.rate_limit.capacity(), 60.0);
    assert_eq!(config.routing.rate_limit.refill_rate(), 30.0);
    assert_eq!(config.connection_pool.max_total_connections, 400);
    assert!(!config.telemetry.enabled);
}

#[test]
fn test_missing_sections_take_defaults() {
    let file = write_config("[routing]\nmax_retries = 0\n");
    let config = OrchestratorConfig::load_from_file(file.path()).unwrap();

    assert_eq!(config.routing.max_retries, 0);
    assert_eq!(config.registry, OrchestratorConfig::default().registry);
    assert_eq!(
        config.connection_pool,
        OrchestratorConfig::default().connection_pool
    );
}

#[test]
fn test_invalid_toml_syntax_is_parse_error() {
    let file = write_config("[routing\nmax_retries = ");
    let result = OrchestratorConfig::load_from_file(file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_unknown_strategy_rejected() {
    let result = OrchestratorConfig::from_toml_str("[routing]\ndefault_strategy = \"random\"\n");
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_out_of_range_values_rejected() {
    let cases = [
        "[registry]\nmax_agents = 0\n",
        "[routing]\nlearning_rate = 2.0\n",
        "[routing.circuit_breaker]\nfailure_threshold = 0\n",
        "[routing.rate_limit]\nmax_requests_per_second = 0\n",
        "[connection_pool]\nmax_total_connections = 2\nmax_connections_per_agent = 3\n",
        "[telemetry]\nmetrics_interval_ms = 0\n",
    ];
    for case in cases {
        let result = OrchestratorConfig::from_toml_str(case);
        assert!(
            matches!(result, Err(ConfigError::InvalidConfig(_))),
            "expected rejection for {case:?}"
        );
    }
}

#[test]
fn test_orchestrator_refuses_invalid_config() {
    let mut config = OrchestratorConfig::default();
    config.connection_pool.idle_timeout_ms = 0;

    let err = Orchestrator::new(config, Arc::new(MockTransport::new())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert!(err.to_string().contains("idle_timeout_ms"));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = OrchestratorConfig::default();
    let text = toml::to_string_pretty(&config).unwrap();
    assert_eq!(OrchestratorConfig::from_toml_str(&text).unwrap(), config);
}
