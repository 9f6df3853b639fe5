//! Tasks submitted for routing and their results

use crate::config::RoutingStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Scheduling priority, used to order queued tasks
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskPriority::Low => "low",
            TaskPriority::Normal => "normal",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// A unit of work submitted for routing
///
/// The router only ever borrows a task; retries reuse the same value.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    /// Capability names the serving agent must all provide
    pub required_capabilities: BTreeSet<String>,
    pub priority: TaskPriority,
    /// Absolute point after which the task is abandoned
    pub deadline: Option<Instant>,
    /// Opaque payload forwarded to the chosen agent
    pub context: serde_json::Value,
    /// Caller's retry-safety token, forwarded but never used for caching
    pub idempotency_key: Option<String>,
    /// Overrides the configured default strategy
    pub strategy: Option<RoutingStrategy>,
}

impl Task {
    pub fn new<T, I, S>(task_type: T, required_capabilities: I) -> Self
    where
        T: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            required_capabilities: required_capabilities.into_iter().map(Into::into).collect(),
            priority: TaskPriority::Normal,
            deadline: None,
            context: serde_json::Value::Null,
            idempotency_key: None,
            strategy: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_idempotency_key<S: Into<String>>(mut self, key: S) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Successful routing outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: Uuid,
    pub agent_id: String,
    pub output: serde_json::Value,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub latency_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder() {
        let task = Task::new("review", ["lint", "review"])
            .with_priority(TaskPriority::High)
            .with_context(serde_json::json!({"file": "main.rs"}))
            .with_idempotency_key("req-42")
            .with_strategy(RoutingStrategy::RoundRobin);

        assert_eq!(task.required_capabilities.len(), 2);
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.context["file"], "main.rs");
        assert_eq!(task.idempotency_key.as_deref(), Some("req-42"));
        assert_eq!(task.strategy, Some(RoutingStrategy::RoundRobin));
        assert!(task.deadline.is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Task::new("t", ["x"]);
        let b = Task::new("t", ["x"]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
        assert_eq!(TaskPriority::default(), TaskPriority::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_passed() {
        let task = Task::new("t", ["x"]).with_timeout(Duration::from_millis(100));
        assert!(!task.deadline_passed());
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(task.deadline_passed());
    }
}
