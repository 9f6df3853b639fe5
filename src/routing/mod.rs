//! Task routing
//!
//! [`TaskRouter`] selects an agent for each [`Task`] and drives it to a
//! result. Its collaborators live in their own modules: per-agent circuit
//! breakers and token buckets, the priority admission queue for throttled
//! tasks, strategy ordering, and learned adaptive weights.

pub mod adaptive;
pub mod circuit_breaker;
pub mod queue;
pub mod rate_limiter;
pub mod router;
mod slots;
pub mod strategy;
pub mod task;

pub use adaptive::AdaptiveWeights;
pub use circuit_breaker::{BreakerPermit, CircuitBreakerSet, CircuitState};
pub use queue::{AdmissionQueue, QueueTicket};
pub use rate_limiter::{RateLimiterSet, RatePermit};
pub use router::TaskRouter;
pub use strategy::StrategySelector;
pub use task::{Task, TaskPriority, TaskResult};
