//! Error taxonomy for the orchestration core
//!
//! Every public operation returns one of the kinds below. Transport-level
//! failures are wrapped in `AgentInvocationFailed` with a sanitised message so
//! raw transport errors never reach callers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

const MAX_MESSAGE_LEN: usize = 500;

/// Main error type for orchestration operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid agent metadata: {message}")]
    InvalidMetadata { message: String },

    #[error("Registry capacity exceeded: {capacity} agents registered")]
    CapacityExceeded { capacity: usize },

    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    #[error("No capable agent for capabilities [{required}]")]
    NoCapableAgent { required: String },

    #[error("Circuit open for all {candidates} capable agents")]
    CircuitOpen { candidates: usize },

    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    #[error("Connection pool exhausted for agent {agent_id}")]
    PoolExhausted { agent_id: String },

    #[error("Connection to agent {agent_id} failed: {message}")]
    ConnectionTimeout { agent_id: String, message: String },

    #[error("Task timed out after {timeout_ms}ms on agent {agent_id}")]
    TaskTimeout { agent_id: String, timeout_ms: u64 },

    #[error("Task deadline exceeded")]
    DeadlineExceeded,

    #[error("Agent {agent_id} invocation failed: {message}")]
    AgentInvocationFailed { agent_id: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Stable, copyable classification of an [`OrchestratorError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidMetadata,
    CapacityExceeded,
    AgentNotFound,
    NoCapableAgent,
    CircuitOpen,
    RateLimited,
    PoolExhausted,
    ConnectionTimeout,
    TaskTimeout,
    DeadlineExceeded,
    AgentInvocationFailed,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidMetadata => "invalid_metadata",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::AgentNotFound => "agent_not_found",
            ErrorKind::NoCapableAgent => "no_capable_agent",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::ConnectionTimeout => "connection_timeout",
            ErrorKind::TaskTimeout => "task_timeout",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::AgentInvocationFailed => "agent_invocation_failed",
            ErrorKind::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OrchestratorError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::InvalidMetadata { .. } => ErrorKind::InvalidMetadata,
            OrchestratorError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            OrchestratorError::AgentNotFound { .. } => ErrorKind::AgentNotFound,
            OrchestratorError::NoCapableAgent { .. } => ErrorKind::NoCapableAgent,
            OrchestratorError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            OrchestratorError::RateLimited { .. } => ErrorKind::RateLimited,
            OrchestratorError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            OrchestratorError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            OrchestratorError::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            OrchestratorError::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            OrchestratorError::AgentInvocationFailed { .. } => ErrorKind::AgentInvocationFailed,
            OrchestratorError::Config(_) => ErrorKind::Config,
        }
    }

    /// Per-attempt failures the router retries on another candidate
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AgentInvocationFailed
                | ErrorKind::TaskTimeout
                | ErrorKind::PoolExhausted
                | ErrorKind::ConnectionTimeout
        )
    }

    /// Failures that retrying the same task cannot resolve
    pub fn is_structural(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidMetadata | ErrorKind::CapacityExceeded | ErrorKind::NoCapableAgent
        )
    }

    /// Create invalid metadata error
    pub fn invalid_metadata<S: Into<String>>(message: S) -> Self {
        Self::InvalidMetadata {
            message: message.into(),
        }
    }

    /// Create rate limited error
    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        Self::RateLimited {
            message: message.into(),
        }
    }

    /// Create agent not found error
    pub fn agent_not_found<S: Into<String>>(agent_id: S) -> Self {
        Self::AgentNotFound {
            agent_id: agent_id.into(),
        }
    }

    /// Create no capable agent error from the required capability names
    pub fn no_capable_agent<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = required
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        names.sort();
        Self::NoCapableAgent {
            required: names.join(", "),
        }
    }

    /// Wrap a transport failure, redacting sensitive content
    pub fn invocation_failed<A: Into<String>>(agent_id: A, message: &str) -> Self {
        Self::AgentInvocationFailed {
            agent_id: agent_id.into(),
            message: sanitize_error_message(message),
        }
    }

    /// Wrap a connection establishment failure, redacting sensitive content
    pub fn connection_failed<A: Into<String>>(agent_id: A, message: &str) -> Self {
        Self::ConnectionTimeout {
            agent_id: agent_id.into(),
            message: sanitize_error_message(message),
        }
    }
}

/// Sanitize transport error messages so credentials and paths never leak to callers
pub(crate) fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(pattern) = SENSITIVE_PATH_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "/***REDACTED***/")
            .to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
