//! Task router
//!
//! Picks an eligible agent for a task, runs it through the pool with a
//! bounded invocation, classifies the outcome and feeds it back into the
//! registry, the breakers and the adaptive weights.
//!
//! ```text
//! route ─▶ concurrency permit ─▶ attempt loop
//!            attempt: select (capable ▸ routable ▸ breaker ▸ strategy ▸ rate)
//!                     └─ throttled ─▶ admission queue ─▶ select again
//!                     execute (pool lease ▸ invoke ≤ task_timeout ▸ record)
//! ```

use super::adaptive::AdaptiveWeights;
use super::circuit_breaker::{BreakerPermit, CircuitBreakerSet};
use super::queue::AdmissionQueue;
use super::rate_limiter::{RateLimiterSet, RatePermit};
use super::strategy::StrategySelector;
use super::task::{Task, TaskResult};
use crate::config::RoutingConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, OrchestratorEvent};
use crate::observability::MetricsCollector;
use crate::pool::ConnectionPool;
use crate::registry::{Agent, AgentRegistry, Outcome, ScoredAgent};
use crate::task_span;
use crate::transport::{AgentTransport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

const MIN_RETRY_WAIT: Duration = Duration::from_millis(1);

/// Agent chosen for one attempt, with the admissions it consumed
struct Selection<'a> {
    agent: Agent,
    breaker: BreakerPermit<'a>,
    rate: RatePermit,
}

enum SelectOutcome<'a> {
    Selected(Selection<'a>),
    /// Every available candidate is out of tokens
    Throttled { retry_in: Duration },
    Failed(OrchestratorError),
}

/// Routes tasks to agents
pub struct TaskRouter {
    config: RoutingConfig,
    registry: Arc<AgentRegistry>,
    pool: Arc<ConnectionPool>,
    transport: Arc<dyn AgentTransport>,
    breakers: CircuitBreakerSet,
    limiters: RateLimiterSet,
    adaptive: AdaptiveWeights,
    selector: StrategySelector,
    queue: AdmissionQueue,
    concurrency: Semaphore,
    metrics: Arc<MetricsCollector>,
    events: EventBus,
}

impl std::fmt::Debug for TaskRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRouter")
            .field("config", &self.config)
            .field("queue_depth", &self.queue.depth())
            .field("open_circuits", &self.breakers.open_count())
            .finish()
    }
}

impl TaskRouter {
    pub fn new(
        config: RoutingConfig,
        registry: Arc<AgentRegistry>,
        pool: Arc<ConnectionPool>,
        transport: Arc<dyn AgentTransport>,
        metrics: Arc<MetricsCollector>,
        events: EventBus,
    ) -> Self {
        Self {
            breakers: CircuitBreakerSet::new(config.circuit_breaker.clone(), events.clone()),
            limiters: RateLimiterSet::new(&config.rate_limit),
            adaptive: AdaptiveWeights::new(config.learning_rate, config.adaptive_weight_cap),
            selector: StrategySelector::new(),
            queue: AdmissionQueue::new(config.max_concurrent_tasks),
            concurrency: Semaphore::new(config.max_concurrent_tasks),
            config,
            registry,
            pool,
            transport,
            metrics,
            events,
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn breakers(&self) -> &CircuitBreakerSet {
        &self.breakers
    }

    pub fn limiters(&self) -> &RateLimiterSet {
        &self.limiters
    }

    pub fn adaptive_weights(&self) -> &AdaptiveWeights {
        &self.adaptive
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    /// Drop breaker, limiter and learned state for a removed agent
    pub fn forget_agent(&self, agent_id: &str) {
        self.breakers.remove_agent(agent_id);
        self.limiters.remove_agent(agent_id);
        self.adaptive.remove_agent(agent_id);
    }

    /// Stop admitting tasks; in-flight tasks finish normally
    pub fn close(&self) {
        self.concurrency.close();
    }

    /// Route a task to completion or to one terminal error
    pub async fn route(&self, task: &Task) -> OrchestratorResult<TaskResult> {
        let span = task_span!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = %task.priority
        );

        async {
            let _in_flight = self.metrics.task_submitted();
            let started = Instant::now();
            let result = self.route_attempts(task).await;
            let elapsed = elapsed_ms(started);

            match &result {
                Ok(done) => {
                    self.metrics.task_completed(elapsed);
                    info!(
                        agent_id = %done.agent_id,
                        attempts = done.attempts,
                        latency_ms = done.latency_ms,
                        "Task completed"
                    );
                }
                Err(e) => {
                    self.metrics.task_failed(e.kind(), elapsed);
                    warn!(error = %e, kind = %e.kind(), "Task failed");
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn route_attempts(&self, task: &Task) -> OrchestratorResult<TaskResult> {
        let mut tried: Vec<String> = Vec::new();
        let mut attempts = 0u32;

        let _slot = match self.admit(task).await {
            Ok(permit) => permit,
            Err(e) => return Err(self.fail(task, e, attempts, tried)),
        };

        let max_attempts = self.config.max_retries.saturating_add(1);
        loop {
            if attempts > 0 {
                let delay = self.backoff(attempts);
                if task.deadline.is_some_and(|d| Instant::now() + delay >= d) {
                    return Err(self.fail(task, OrchestratorError::DeadlineExceeded, attempts, tried));
                }
                debug!(attempt = attempts + 1, delay_ms = delay.as_millis() as u64, "Backing off before retry");
                sleep(delay).await;
            }
            if task.deadline_passed() {
                return Err(self.fail(task, OrchestratorError::DeadlineExceeded, attempts, tried));
            }

            let selection = match self.select(task, &tried).await {
                Ok(selection) => selection,
                Err(e) => return Err(self.fail(task, e, attempts, tried)),
            };

            attempts += 1;
            let agent_id = selection.agent.id.clone();
            if !tried.contains(&agent_id) {
                tried.push(agent_id.clone());
            }

            match self.execute(task, selection).await {
                Ok((output, latency_ms)) => {
                    self.events.emit(OrchestratorEvent::TaskCompleted {
                        task_id: task.id,
                        agent_id: agent_id.clone(),
                        attempts,
                        latency_ms,
                    });
                    return Ok(TaskResult {
                        task_id: task.id,
                        agent_id,
                        output,
                        attempts,
                        latency_ms,
                    });
                }
                Err(e) if e.is_transient() && attempts < max_attempts => {
                    self.metrics.task_retried();
                    warn!(agent_id = %agent_id, attempt = attempts, error = %e, "Attempt failed, retrying");
                    self.events.emit(OrchestratorEvent::TaskRetrying {
                        task_id: task.id,
                        agent_id,
                        attempt: attempts,
                        error: e.kind(),
                    });
                }
                Err(e) => return Err(self.fail(task, e, attempts, tried)),
            }
        }
    }

    fn backoff(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1).min(16);
        self.config.retry_delay().saturating_mul(1u32 << exponent)
    }

    fn fail(
        &self,
        task: &Task,
        error: OrchestratorError,
        attempts: u32,
        tried_agents: Vec<String>,
    ) -> OrchestratorError {
        self.events.emit(OrchestratorEvent::TaskFailed {
            task_id: task.id,
            error: error.kind(),
            attempts,
            tried_agents,
        });
        error
    }

    /// Wait for a global concurrency slot
    async fn admit(&self, task: &Task) -> OrchestratorResult<SemaphorePermit<'_>> {
        let (until, deadline_first) = self.wait_bound(task);
        match timeout_at(until, self.concurrency.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(OrchestratorError::rate_limited("router is shutting down")),
            Err(_) if deadline_first => Err(OrchestratorError::DeadlineExceeded),
            Err(_) => Err(OrchestratorError::rate_limited(format!(
                "no concurrency slot within {}ms",
                self.config.task_timeout_ms
            ))),
        }
    }

    /// How long a task may wait before running: its deadline or `task_timeout`
    fn wait_bound(&self, task: &Task) -> (Instant, bool) {
        let timeout_end = Instant::now() + self.config.task_timeout();
        match task.deadline {
            Some(deadline) if deadline <= timeout_end => (deadline, true),
            _ => (timeout_end, false),
        }
    }

    async fn select(&self, task: &Task, tried: &[String]) -> OrchestratorResult<Selection<'_>> {
        match self.try_select(task, tried) {
            SelectOutcome::Selected(selection) => Ok(selection),
            SelectOutcome::Failed(e) => Err(e),
            SelectOutcome::Throttled { .. } if !self.config.priority_queues => {
                Err(OrchestratorError::rate_limited(
                    "all capable agents are rate limited",
                ))
            }
            SelectOutcome::Throttled { retry_in } => self.queued_select(task, tried, retry_in).await,
        }
    }

    /// Wait in the admission queue until selection succeeds
    async fn queued_select(
        &self,
        task: &Task,
        tried: &[String],
        mut retry_in: Duration,
    ) -> OrchestratorResult<Selection<'_>> {
        let ticket = self.queue.enqueue(task.priority).ok_or_else(|| {
            OrchestratorError::rate_limited("admission queue is full")
        })?;
        let (until, deadline_first) = self.wait_bound(task);
        debug!(priority = %task.priority, depth = self.queue.depth(), "Task queued behind rate limit");

        loop {
            let changed = ticket.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let head = ticket.is_head();
            if head {
                match self.try_select(task, tried) {
                    SelectOutcome::Selected(selection) => return Ok(selection),
                    SelectOutcome::Failed(e) => return Err(e),
                    SelectOutcome::Throttled { retry_in: next } => retry_in = next,
                }
            }

            if Instant::now() >= until {
                return Err(if deadline_first {
                    OrchestratorError::DeadlineExceeded
                } else {
                    OrchestratorError::rate_limited(format!(
                        "queued longer than {}ms waiting for a rate limit slot",
                        self.config.task_timeout_ms
                    ))
                });
            }

            let wake_at = if head {
                (Instant::now() + retry_in.max(MIN_RETRY_WAIT)).min(until)
            } else {
                until
            };

            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    fn try_select(&self, task: &Task, tried: &[String]) -> SelectOutcome<'_> {
        let required = &task.required_capabilities;
        let capable = self.registry.find_capable(required.iter().cloned());

        let routable: Vec<ScoredAgent> = capable
            .into_vec()
            .into_iter()
            .filter(|s| s.status.is_routable())
            .collect();
        if routable.is_empty() {
            return SelectOutcome::Failed(OrchestratorError::no_capable_agent(required));
        }

        let routable_count = routable.len();
        let closed: Vec<ScoredAgent> = routable
            .into_iter()
            .filter(|s| self.breakers.is_available(&self.breakers.key(s.id(), required)))
            .collect();
        if closed.is_empty() {
            return SelectOutcome::Failed(OrchestratorError::CircuitOpen {
                candidates: routable_count,
            });
        }

        let strategy = task.strategy.unwrap_or(self.config.default_strategy);
        let adaptive = self
            .config
            .enable_adaptive_routing
            .then_some(&self.adaptive);
        let ordered = self.selector.order(
            strategy,
            required,
            closed,
            |id| self.pool.in_use_count(id),
            adaptive,
        );

        // untried agents first, strategy order otherwise kept
        let (fresh, retried): (Vec<_>, Vec<_>) = ordered
            .into_iter()
            .partition(|s| !tried.iter().any(|t| t == s.id()));

        let mut retry_in: Option<Duration> = None;
        let mut lost_breaker_race = 0usize;
        for candidate in fresh.into_iter().chain(retried) {
            let Some(rate) = self.limiters.try_acquire(candidate.id()) else {
                let wait = self.limiters.time_until_available(candidate.id());
                retry_in = Some(retry_in.map_or(wait, |r| r.min(wait)));
                continue;
            };
            let Some(breaker) = self.breakers.try_acquire(&self.breakers.key(candidate.id(), required)) else {
                lost_breaker_race += 1;
                continue;
            };
            // deregistered since ranking; both permits are released unused
            let Some(agent) = self.registry.get(candidate.id()) else {
                continue;
            };

            debug!(
                agent_id = %candidate.id(),
                score = candidate.score,
                strategy = strategy.as_str(),
                trial = breaker.is_trial(),
                "Selected agent"
            );
            self.selector.served(strategy, required, candidate.id());
            return SelectOutcome::Selected(Selection {
                agent,
                breaker,
                rate,
            });
        }

        match retry_in {
            Some(retry_in) => SelectOutcome::Throttled { retry_in },
            None => SelectOutcome::Failed(OrchestratorError::CircuitOpen {
                candidates: lost_breaker_race.max(routable_count),
            }),
        }
    }

    /// Run one attempt on the selected agent; returns output and latency
    async fn execute(
        &self,
        task: &Task,
        selection: Selection<'_>,
    ) -> OrchestratorResult<(serde_json::Value, u64)> {
        let Selection {
            agent,
            breaker,
            mut rate,
        } = selection;

        let connection = match self.pool.acquire_with_deadline(&agent.id, task.deadline).await {
            Ok(connection) => connection,
            Err(e @ OrchestratorError::ConnectionTimeout { .. }) => {
                breaker.failure();
                self.learn(&agent.id, false);
                return Err(e);
            }
            // pool exhaustion is not the agent's fault; permits drop unsettled
            Err(e) => return Err(e),
        };
        rate.commit();

        let timeout_end = Instant::now() + self.config.task_timeout();
        let (until, deadline_first) = match task.deadline {
            Some(deadline) if deadline < timeout_end => (deadline, true),
            _ => (timeout_end, false),
        };

        let started = Instant::now();
        let outcome = timeout_at(
            until,
            self.transport.invoke(&agent, connection.info(), task),
        )
        .await;
        let latency_ms = elapsed_ms(started);

        match outcome {
            Ok(Ok(output)) => {
                breaker.success();
                self.record(&agent.id, Outcome::success(latency_ms));
                Ok((output, latency_ms))
            }
            Ok(Err(e)) => {
                if matches!(e, TransportError::ConnectionRefused(_)) {
                    connection.mark_unhealthy();
                }
                breaker.failure();
                self.record(&agent.id, Outcome::failure(latency_ms));
                Err(OrchestratorError::invocation_failed(&agent.id, &e.to_string()))
            }
            Err(_) if deadline_first => {
                connection.mark_unhealthy();
                self.learn(&agent.id, false);
                drop(breaker);
                Err(OrchestratorError::DeadlineExceeded)
            }
            Err(_) => {
                connection.mark_unhealthy();
                breaker.failure();
                self.record(&agent.id, Outcome::failure(latency_ms));
                Err(OrchestratorError::TaskTimeout {
                    agent_id: agent.id.clone(),
                    timeout_ms: self.config.task_timeout_ms,
                })
            }
        }
    }

    fn record(&self, agent_id: &str, outcome: Outcome) {
        // the agent may have been deregistered while the call ran
        if let Err(e) = self.registry.record_outcome(agent_id, outcome) {
            debug!(agent_id = %agent_id, "Outcome not recorded: {}", e);
        }
        self.learn(agent_id, outcome.success);
    }

    fn learn(&self, agent_id: &str, success: bool) {
        if self.config.enable_adaptive_routing {
            let weight = self
                .adaptive
                .update(agent_id, if success { 1.0 } else { 0.0 });
            debug!(agent_id = %agent_id, weight, "Updated adaptive weight");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
