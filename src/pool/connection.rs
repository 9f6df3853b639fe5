//! Connection records owned by the pool

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle state of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    InUse,
    Unhealthy,
    Closed,
}

/// Handle identifying one lease of a connection
///
/// `lease` changes every time the connection is handed out, so releasing
/// with a handle from an earlier lease is detected and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub agent_id: String,
    pub lease: u64,
    pub created_at: Instant,
}

/// A reusable channel to one agent
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: Uuid,
    pub agent_id: String,
    pub state: ConnectionState,
    pub created_at: Instant,
    pub last_used_at: Instant,
    pub lease: u64,
    /// Close instead of returning to idle on the next release
    pub(crate) retire: bool,
}

impl Connection {
    pub(crate) fn new(agent_id: &str, state: ConnectionState, lease: u64) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.to_string(),
            state,
            created_at: now,
            last_used_at: now,
            lease,
            retire: false,
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            agent_id: self.agent_id.clone(),
            lease: self.lease,
            created_at: self.created_at,
        }
    }

    /// Idle for at least `timeout` as of `now`
    pub fn is_expired(&self, now: Instant, timeout: std::time::Duration) -> bool {
        self.state == ConnectionState::Idle
            && now.saturating_duration_since(self.last_used_at) >= timeout
    }

    /// Checked out by a task, healthy or not
    pub fn is_leased(&self) -> bool {
        matches!(self.state, ConnectionState::InUse | ConnectionState::Unhealthy)
    }
}

/// Aggregate pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub opening: usize,
    pub agents: usize,
    pub waiters: usize,
    pub created: u64,
    pub closed: u64,
    pub exhausted: u64,
}
