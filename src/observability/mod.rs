//! Observability: structured logging and per-instance metrics

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{
    AgentMetrics, InFlight, MetricsCollector, MetricsSink, OrchestratorMetrics, TaskMetrics,
    TracingMetricsSink,
};

// Span macros for structured logging
pub use logging::{agent_span, pool_span, task_span};
