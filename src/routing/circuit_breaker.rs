//! Circuit breakers
//!
//! One breaker per key (agent, or agent plus capability set). Failures are
//! counted over a sliding `monitoring_period`. An open breaker turns
//! half-open lazily, on the first look after `reset_timeout`, and then admits
//! exactly one trial through a [`BreakerPermit`].

use super::slots::SlotMap;
use crate::config::{BreakerScope, CircuitBreakerConfig};
use crate::events::{EventBus, OrchestratorEvent};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// State of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn reset_elapsed(&self, config: &CircuitBreakerConfig, now: Instant) -> bool {
        self.opened_at
            .is_some_and(|opened| now.saturating_duration_since(opened) >= config.reset_timeout())
    }

    /// State as seen at `now`, without side effects
    fn effective_state(&self, config: &CircuitBreakerConfig, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::Open if self.reset_elapsed(config, now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    fn prune(&mut self, config: &CircuitBreakerConfig, now: Instant) {
        let window = config.monitoring_period();
        while self
            .failures
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            self.failures.pop_front();
        }
    }

    fn failure_count(&self) -> u32 {
        u32::try_from(self.failures.len()).unwrap_or(u32::MAX)
    }
}

/// Every breaker owned by one router
#[derive(Debug)]
pub struct CircuitBreakerSet {
    config: CircuitBreakerConfig,
    breakers: SlotMap<Breaker>,
    events: EventBus,
}

impl CircuitBreakerSet {
    pub fn new(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self {
            config,
            breakers: SlotMap::default(),
            events,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker key for an agent serving a requirement
    pub fn key(&self, agent_id: &str, required: &BTreeSet<String>) -> String {
        match self.config.scope {
            BreakerScope::Agent => agent_id.to_string(),
            BreakerScope::Capability => {
                let caps: Vec<&str> = required.iter().map(String::as_str).collect();
                format!("{agent_id}|{}", caps.join(","))
            }
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .get(key)
            .map_or(CircuitState::Closed, |slot| {
                slot.lock().effective_state(&self.config, Instant::now())
            })
    }

    /// Whether `try_acquire` could currently admit a call, claiming nothing
    pub fn is_available(&self, key: &str) -> bool {
        let Some(slot) = self.breakers.get(key) else {
            return true;
        };
        let breaker = slot.lock();
        match breaker.effective_state(&self.config, Instant::now()) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !breaker.trial_in_flight,
        }
    }

    /// Admit one call, claiming the half-open trial when applicable
    pub fn try_acquire(&self, key: &str) -> Option<BreakerPermit<'_>> {
        let slot = self.breakers.get_or_insert_with(key, Breaker::new);
        let trial = {
            let mut breaker = slot.lock();
            let now = Instant::now();

            if breaker.state == CircuitState::Open && breaker.reset_elapsed(&self.config, now) {
                breaker.state = CircuitState::HalfOpen;
                breaker.trial_in_flight = false;
                info!(key = %key, "Circuit half-open, admitting one trial");
                self.events.emit(OrchestratorEvent::CircuitHalfOpen {
                    key: key.to_string(),
                });
            }

            match breaker.state {
                CircuitState::Closed => false,
                CircuitState::Open => return None,
                CircuitState::HalfOpen if breaker.trial_in_flight => return None,
                CircuitState::HalfOpen => {
                    breaker.trial_in_flight = true;
                    true
                }
            }
        };

        Some(BreakerPermit {
            set: self,
            key: key.to_string(),
            slot,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, key: &str, slot: &Mutex<Breaker>, trial: bool) {
        let mut breaker = slot.lock();
        if trial && breaker.state == CircuitState::HalfOpen {
            breaker.state = CircuitState::Closed;
            breaker.failures.clear();
            breaker.opened_at = None;
            breaker.trial_in_flight = false;
            info!(key = %key, "Circuit closed after successful trial");
            self.events.emit(OrchestratorEvent::CircuitClosed {
                key: key.to_string(),
            });
        }
    }

    fn on_failure(&self, key: &str, slot: &Mutex<Breaker>, trial: bool) {
        let mut breaker = slot.lock();
        let now = Instant::now();
        breaker.failures.push_back(now);
        breaker.prune(&self.config, now);

        let open = match breaker.state {
            CircuitState::HalfOpen => trial,
            CircuitState::Closed => breaker.failure_count() >= self.config.failure_threshold,
            CircuitState::Open => false,
        };

        if open {
            breaker.state = CircuitState::Open;
            breaker.opened_at = Some(now);
            breaker.trial_in_flight = false;
            let failure_count = breaker.failure_count();
            warn!(key = %key, failure_count, "Circuit opened");
            self.events.emit(OrchestratorEvent::CircuitOpened {
                key: key.to_string(),
                failure_count,
            });
        } else {
            debug!(key = %key, failures = breaker.failures.len(), "Recorded breaker failure");
        }
    }

    fn on_abandon(&self, slot: &Mutex<Breaker>, trial: bool) {
        if trial {
            let mut breaker = slot.lock();
            if breaker.state == CircuitState::HalfOpen {
                breaker.trial_in_flight = false;
            }
        }
    }

    /// Breakers not closed, half-open ones included
    pub fn open_count(&self) -> usize {
        self.breakers
            .values()
            .iter()
            .filter(|slot| slot.lock().state != CircuitState::Closed)
            .count()
    }

    /// Drop every breaker belonging to an agent
    pub fn remove_agent(&self, agent_id: &str) {
        let prefix = format!("{agent_id}|");
        self.breakers
            .retain(|key| key != agent_id && !key.starts_with(&prefix));
    }
}

/// Admission through a breaker
///
/// Record the call's outcome with `success` or `failure`. Dropping the permit
/// without an outcome (pool exhaustion, cancellation) leaves the failure
/// window untouched and frees a claimed half-open trial.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    set: &'a CircuitBreakerSet,
    key: String,
    slot: Arc<Mutex<Breaker>>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit<'_> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// This permit is the single half-open trial
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.set.on_success(&self.key, &self.slot, self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.set.on_failure(&self.key, &self.slot, self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.set.on_abandon(&self.slot, self.trial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breakers(threshold: u32) -> CircuitBreakerSet {
        CircuitBreakerSet::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout_ms: 1_000,
                monitoring_period_ms: 10_000,
                scope: BreakerScope::Agent,
            },
            EventBus::default(),
        )
    }

    fn fail(set: &CircuitBreakerSet, key: &str) {
        set.try_acquire(key).unwrap().failure();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let set = breakers(3);
        fail(&set, "a1");
        fail(&set, "a1");
        assert_eq!(set.state("a1"), CircuitState::Closed);
        fail(&set, "a1");

        assert_eq!(set.state("a1"), CircuitState::Open);
        assert!(!set.is_available("a1"));
        assert!(set.try_acquire("a1").is_none());
        assert_eq!(set.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_do_not_count() {
        let set = breakers(2);
        fail(&set, "a1");
        tokio::time::advance(Duration::from_millis(10_001)).await;
        fail(&set, "a1");
        assert_eq!(set.state("a1"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_trial() {
        let set = breakers(1);
        fail(&set, "a1");
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert_eq!(set.state("a1"), CircuitState::HalfOpen);
        let trial = set.try_acquire("a1").unwrap();
        assert!(trial.is_trial());
        assert!(set.try_acquire("a1").is_none());
        assert!(!set.is_available("a1"));

        trial.success();
        assert_eq!(set.state("a1"), CircuitState::Closed);
        assert!(set.try_acquire("a1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let set = CircuitBreakerSet::new(
            CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout_ms: 1_000,
                ..CircuitBreakerConfig::default()
            },
            events,
        );
        fail(&set, "a1");
        tokio::time::advance(Duration::from_millis(1_000)).await;
        set.try_acquire("a1").unwrap().failure();

        assert_eq!(set.state("a1"), CircuitState::Open);
        // openedAt reset by the failed trial
        tokio::time::advance(Duration::from_millis(999)).await;
        assert_eq!(set.state("a1"), CircuitState::Open);

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert_eq!(
            names,
            vec!["circuit.opened", "circuit.half_open", "circuit.opened"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_frees_slot() {
        let set = breakers(1);
        fail(&set, "a1");
        tokio::time::advance(Duration::from_millis(1_000)).await;

        drop(set.try_acquire("a1").unwrap());
        assert!(set.is_available("a1"));
        assert!(set.try_acquire("a1").unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capability_scope_keys() {
        let set = CircuitBreakerSet::new(
            CircuitBreakerConfig {
                scope: BreakerScope::Capability,
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
            EventBus::default(),
        );
        let x: BTreeSet<String> = ["x".to_string()].into();
        let y: BTreeSet<String> = ["y".to_string()].into();

        let kx = set.key("a1", &x);
        fail(&set, &kx);
        assert!(!set.is_available(&kx));
        assert!(set.is_available(&set.key("a1", &y)));

        set.remove_agent("a1");
        assert!(set.is_available(&kx));
    }
}
