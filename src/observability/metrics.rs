//! Thread-safe metrics collection
//!
//! Atomic counters for the hot path and mutex-protected collections for
//! latency samples and failure breakdowns. Each orchestrator owns its own
//! collector; nothing here is process-global.

use crate::error::ErrorKind;
use crate::pool::PoolStats;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Latency samples kept regardless of retention
const MAX_LATENCY_SAMPLES: usize = 1000;

/// Per-orchestrator metrics collector
#[derive(Debug)]
pub struct MetricsCollector {
    tasks_submitted: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    tasks_in_flight: AtomicU64,
    max_in_flight: AtomicU64,
    retries: AtomicU64,

    failures_by_kind: Mutex<HashMap<ErrorKind, u64>>,
    // (recorded at, latency ms)
    latencies: Mutex<VecDeque<(Instant, u64)>>,

    retention: Duration,
    started_at: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl MetricsCollector {
    pub fn new(retention: Duration) -> Self {
        Self {
            tasks_submitted: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            tasks_in_flight: AtomicU64::new(0),
            max_in_flight: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures_by_kind: Mutex::new(HashMap::new()),
            latencies: Mutex::new(VecDeque::new()),
            retention,
            started_at: Instant::now(),
        }
    }

    /// Count a submitted task; in-flight until the guard drops
    pub fn task_submitted(&self) -> InFlight<'_> {
        self.tasks_submitted.fetch_add(1, Ordering::Relaxed);
        let current = self.tasks_in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_in_flight.fetch_max(current, Ordering::Relaxed);
        InFlight(self)
    }

    pub fn task_completed(&self, latency_ms: u64) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency_ms);
    }

    pub fn task_failed(&self, kind: ErrorKind, latency_ms: u64) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        *self.failures_by_kind.lock().entry(kind).or_insert(0) += 1;
        self.record_latency(latency_ms);
    }

    pub fn task_retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency_ms: u64) {
        let now = Instant::now();
        let mut samples = self.latencies.lock();
        samples.push_back((now, latency_ms));
        if samples.len() > MAX_LATENCY_SAMPLES {
            samples.pop_front();
        }
        Self::prune_samples(&mut samples, now, self.retention);
    }

    fn prune_samples(samples: &mut VecDeque<(Instant, u64)>, now: Instant, retention: Duration) {
        while samples
            .front()
            .is_some_and(|(at, _)| now.saturating_duration_since(*at) > retention)
        {
            samples.pop_front();
        }
    }

    /// Drop latency samples older than the retention period
    pub fn prune(&self) -> usize {
        let mut samples = self.latencies.lock();
        let before = samples.len();
        Self::prune_samples(&mut samples, Instant::now(), self.retention);
        before - samples.len()
    }

    /// Calculate latency statistics (avg, p50, p95, p99)
    fn latency_statistics(&self) -> (f64, f64, f64, f64, usize) {
        let mut sorted: Vec<u64> = {
            let mut samples = self.latencies.lock();
            Self::prune_samples(&mut samples, Instant::now(), self.retention);
            samples.iter().map(|(_, ms)| *ms).collect()
        };
        if sorted.is_empty() {
            return (0.0, 0.0, 0.0, 0.0, 0);
        }
        sorted.sort_unstable();

        let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
        (
            avg,
            percentile(&sorted, 50.0),
            percentile(&sorted, 95.0),
            percentile(&sorted, 99.0),
            sorted.len(),
        )
    }

    pub fn snapshot(&self) -> TaskMetrics {
        let (avg, p50, p95, p99, samples) = self.latency_statistics();
        let failures_by_kind = self
            .failures_by_kind
            .lock()
            .iter()
            .map(|(kind, count)| (kind.as_str().to_string(), *count))
            .collect();

        TaskMetrics {
            submitted: self.tasks_submitted.load(Ordering::Relaxed),
            completed: self.tasks_completed.load(Ordering::Relaxed),
            failed: self.tasks_failed.load(Ordering::Relaxed),
            in_flight: self.tasks_in_flight.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures_by_kind,
            avg_latency_ms: avg,
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_p99_ms: p99,
            latency_samples: samples,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        self.tasks_submitted.store(0, Ordering::Relaxed);
        self.tasks_completed.store(0, Ordering::Relaxed);
        self.tasks_failed.store(0, Ordering::Relaxed);
        self.max_in_flight
            .store(self.tasks_in_flight.load(Ordering::Relaxed), Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.failures_by_kind.lock().clear();
        self.latencies.lock().clear();
    }
}

/// Marks a task in flight for as long as it lives
#[derive(Debug)]
pub struct InFlight<'a>(&'a MetricsCollector);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.tasks_in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskMetrics {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub max_in_flight: u64,
    pub retries: u64,
    pub failures_by_kind: BTreeMap<String, u64>,
    pub avg_latency_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    pub latency_samples: usize,
    pub uptime_seconds: u64,
}

/// Aggregated orchestrator telemetry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorMetrics {
    pub tasks: TaskMetrics,
    pub agents: AgentMetrics,
    pub pool: PoolStats,
    pub open_circuits: usize,
    pub queue_depth: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentMetrics {
    pub total: usize,
    /// Agent count per health status
    pub by_status: BTreeMap<String, usize>,
}

/// Destination for periodic metrics snapshots
pub trait MetricsSink: Send + Sync {
    fn publish(&self, metrics: &OrchestratorMetrics);
}

/// Writes each snapshot as one structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn publish(&self, metrics: &OrchestratorMetrics) {
        info!(
            target: "agentmesh::metrics",
            tasks_submitted = metrics.tasks.submitted,
            tasks_completed = metrics.tasks.completed,
            tasks_failed = metrics.tasks.failed,
            tasks_in_flight = metrics.tasks.in_flight,
            latency_p95_ms = metrics.tasks.latency_p95_ms,
            agents = metrics.agents.total,
            connections = metrics.pool.total,
            connections_in_use = metrics.pool.in_use,
            open_circuits = metrics.open_circuits,
            queue_depth = metrics.queue_depth,
            "Orchestrator metrics"
        );
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_task_metrics() {
        let collector = MetricsCollector::default();

        {
            let _in_flight = collector.task_submitted();
            assert_eq!(collector.snapshot().in_flight, 1);
            collector.task_completed(1500);
        }

        let metrics = collector.snapshot();
        assert_eq!(metrics.submitted, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.in_flight, 0);
        assert_eq!(metrics.max_in_flight, 1);
        assert!(metrics.avg_latency_ms > 1400.0);
    }

    #[test]
    fn test_failures_by_kind() {
        let collector = MetricsCollector::default();
        collector.task_failed(ErrorKind::CircuitOpen, 1);
        collector.task_failed(ErrorKind::CircuitOpen, 1);
        collector.task_failed(ErrorKind::RateLimited, 1);
        collector.task_retried();

        let metrics = collector.snapshot();
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.failures_by_kind["circuit_open"], 2);
        assert_eq!(metrics.failures_by_kind["rate_limited"], 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::default());

        let mut handles = vec![];

        for _ in 0..10 {
            let collector_clone = Arc::clone(&collector);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    let _guard = collector_clone.task_submitted();
                    collector_clone.task_completed(5);
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.snapshot();
        assert_eq!(metrics.submitted, 1000);
        assert_eq!(metrics.completed, 1000);
        assert_eq!(metrics.in_flight, 0);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);
        let p0 = percentile(&data, 0.0);
        let p100 = percentile(&data, 100.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert!((p0 - 1.0).abs() < 0.1, "P0: expected ~1.0, got {p0}");
        assert!(
            (p100 - 10.0).abs() < 0.1,
            "P100: expected ~10.0, got {p100}"
        );

        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_latency_samples_bounded() {
        let collector = MetricsCollector::default();
        for i in 0..1500 {
            collector.task_completed(i);
        }
        assert_eq!(collector.snapshot().latency_samples, MAX_LATENCY_SAMPLES);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_prunes_old_samples() {
        let collector = MetricsCollector::new(Duration::from_secs(60));
        collector.task_completed(10);
        tokio::time::advance(Duration::from_secs(61)).await;
        collector.task_completed(20);

        let metrics = collector.snapshot();
        assert_eq!(metrics.latency_samples, 1);
        assert_eq!(metrics.avg_latency_ms, 20.0);
        // counters are not subject to retention
        assert_eq!(metrics.completed, 2);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::default();
        collector.task_completed(10);
        collector.task_failed(ErrorKind::TaskTimeout, 10);

        collector.reset();

        let metrics = collector.snapshot();
        assert_eq!(metrics.completed, 0);
        assert_eq!(metrics.failed, 0);
        assert!(metrics.failures_by_kind.is_empty());
        assert_eq!(metrics.latency_samples, 0);
    }
}
