//! Bounded connection pool
//!
//! Connections are created lazily on first acquire and reused afterwards.
//! Per-agent lists sit behind their own mutex; the global count is an
//! atomic reserved before any connection is opened, so both caps hold even
//! while `AgentTransport::open` runs outside every lock.

use super::connection::{Connection, ConnectionInfo, ConnectionState, PoolStats};
use crate::config::ConnectionPoolConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::{EventBus, OrchestratorEvent};
use crate::pool_span;
use crate::transport::AgentTransport;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Default)]
struct AgentConnections {
    connections: Vec<Connection>,
    /// Slots reserved for connections still being opened
    opening: usize,
}

impl AgentConnections {
    fn occupied(&self) -> usize {
        self.connections.len() + self.opening
    }
}

type AgentSlot = Arc<Mutex<AgentConnections>>;

enum Checkout {
    Ready(ConnectionInfo),
    Open,
    AgentFull,
    PoolFull,
}

/// Connection pool shared by every task execution of one orchestrator
pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    transport: Arc<dyn AgentTransport>,
    events: EventBus,
    agents: RwLock<HashMap<String, AgentSlot>>,
    total: AtomicUsize,
    waiters: AtomicUsize,
    released: Notify,
    next_lease: AtomicU64,
    created: AtomicU64,
    closed: AtomicU64,
    exhausted: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        config: ConnectionPoolConfig,
        transport: Arc<dyn AgentTransport>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            agents: RwLock::new(HashMap::new()),
            total: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            released: Notify::new(),
            next_lease: AtomicU64::new(1),
            created: AtomicU64::new(0),
            closed: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    fn slot(&self, agent_id: &str) -> AgentSlot {
        if let Some(slot) = self.agents.read().get(agent_id) {
            return Arc::clone(slot);
        }
        let mut agents = self.agents.write();
        Arc::clone(agents.entry(agent_id.to_string()).or_default())
    }

    fn existing_slot(&self, agent_id: &str) -> Option<AgentSlot> {
        self.agents.read().get(agent_id).cloned()
    }

    fn lease(&self) -> u64 {
        self.next_lease.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve_global(&self) -> bool {
        let max = self.config.max_total_connections;
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn try_checkout(&self, slot: &AgentSlot) -> Checkout {
        let mut entry = slot.lock();
        if let Some(conn) = entry
            .connections
            .iter_mut()
            .find(|c| c.state == ConnectionState::Idle && !c.retire)
        {
            conn.state = ConnectionState::InUse;
            conn.lease = self.lease();
            conn.last_used_at = Instant::now();
            return Checkout::Ready(conn.info());
        }

        if entry.occupied() >= self.config.max_connections_per_agent {
            return Checkout::AgentFull;
        }
        if !self.reserve_global() {
            return Checkout::PoolFull;
        }
        entry.opening += 1;
        Checkout::Open
    }

    /// Acquire a connection, waiting up to `connection_timeout`
    pub async fn acquire(self: &Arc<Self>, agent_id: &str) -> OrchestratorResult<PooledConnection> {
        self.acquire_with_deadline(agent_id, None).await
    }

    /// Acquire a connection, waiting until `connection_timeout` or `deadline`, whichever is first
    pub async fn acquire_with_deadline(
        self: &Arc<Self>,
        agent_id: &str,
        deadline: Option<Instant>,
    ) -> OrchestratorResult<PooledConnection> {
        let span = pool_span!(operation = "acquire", agent_id = %agent_id);
        self.checkout(agent_id, deadline).instrument(span).await
    }

    async fn checkout(
        self: &Arc<Self>,
        agent_id: &str,
        deadline: Option<Instant>,
    ) -> OrchestratorResult<PooledConnection> {
        let timeout_end = Instant::now() + self.config.connection_timeout();
        let (until, deadline_first) = match deadline {
            Some(d) if d < timeout_end => (d, true),
            _ => (timeout_end, false),
        };
        let slot = self.slot(agent_id);

        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_checkout(&slot) {
                Checkout::Ready(info) => {
                    debug!(agent_id = %agent_id, connection_id = %info.id, "Reusing idle connection");
                    return Ok(PooledConnection::new(Arc::clone(self), info));
                }
                Checkout::Open => {
                    return self.open_reserved(agent_id, &slot, until, deadline_first).await;
                }
                Checkout::PoolFull => {
                    if self.reclaim_idle_elsewhere(agent_id) {
                        continue;
                    }
                }
                Checkout::AgentFull => {}
            }

            let waited = {
                let _waiting = WaiterGuard::new(&self.waiters);
                timeout_at(until, notified).await
            };

            if waited.is_err() {
                if deadline_first {
                    return Err(OrchestratorError::DeadlineExceeded);
                }
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(agent_id = %agent_id, "Connection pool exhausted");
                self.events.emit(OrchestratorEvent::PoolExhausted {
                    agent_id: agent_id.to_string(),
                });
                return Err(OrchestratorError::PoolExhausted {
                    agent_id: agent_id.to_string(),
                });
            }
        }
    }

    async fn open_reserved(
        self: &Arc<Self>,
        agent_id: &str,
        slot: &AgentSlot,
        until: Instant,
        deadline_first: bool,
    ) -> OrchestratorResult<PooledConnection> {
        let reservation = Reservation::new(self, slot);

        match timeout_at(until, self.transport.open(agent_id)).await {
            Ok(Ok(())) => {
                let info = reservation.commit(agent_id, ConnectionState::InUse);
                debug!(agent_id = %agent_id, connection_id = %info.id, "Opened new connection");
                Ok(PooledConnection::new(Arc::clone(self), info))
            }
            Ok(Err(e)) => {
                warn!(agent_id = %agent_id, "Failed to open connection: {}", e);
                Err(OrchestratorError::connection_failed(agent_id, &e.to_string()))
            }
            Err(_) if deadline_first => Err(OrchestratorError::DeadlineExceeded),
            Err(_) => Err(OrchestratorError::connection_failed(
                agent_id,
                &format!(
                    "timed out after {}ms opening connection",
                    self.config.connection_timeout_ms
                ),
            )),
        }
    }

    /// Close one idle connection owned by another agent to free a global slot
    fn reclaim_idle_elsewhere(&self, agent_id: &str) -> bool {
        let candidates: Vec<(String, AgentSlot)> = self
            .agents
            .read()
            .iter()
            .filter(|(id, _)| id.as_str() != agent_id)
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        for (owner, slot) in candidates {
            let reclaimed = {
                let mut entry = slot.lock();
                let oldest_idle = entry
                    .connections
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.state == ConnectionState::Idle)
                    .min_by_key(|(_, c)| c.last_used_at)
                    .map(|(idx, _)| idx);
                oldest_idle.map(|idx| entry.connections.swap_remove(idx))
            };
            if let Some(conn) = reclaimed {
                debug!(agent_id = %owner, for_agent = %agent_id, "Reclaiming idle connection");
                self.discard(conn);
                return true;
            }
        }
        false
    }

    fn discard(&self, mut conn: Connection) {
        conn.state = ConnectionState::Closed;
        self.total.fetch_sub(1, Ordering::AcqRel);
        self.closed.fetch_add(1, Ordering::Relaxed);
        self.transport.close(&conn.info());
    }

    /// Flag a leased connection so its release closes it
    pub fn mark_unhealthy(&self, info: &ConnectionInfo) {
        if let Some(slot) = self.existing_slot(&info.agent_id) {
            let mut entry = slot.lock();
            if let Some(conn) = entry
                .connections
                .iter_mut()
                .find(|c| c.id == info.id && c.lease == info.lease && c.is_leased())
            {
                conn.state = ConnectionState::Unhealthy;
            }
        }
    }

    /// Return a connection to the pool
    ///
    /// Returns false, logging a warning, for a release that does not match
    /// the current lease (double release or a stale handle).
    pub fn release(&self, info: &ConnectionInfo) -> bool {
        let Some(slot) = self.existing_slot(&info.agent_id) else {
            warn!(agent_id = %info.agent_id, connection_id = %info.id, "Release for unknown agent ignored");
            return false;
        };

        let to_close = {
            let mut entry = slot.lock();
            let Some(idx) = entry
                .connections
                .iter()
                .position(|c| c.id == info.id && c.lease == info.lease && c.is_leased())
            else {
                warn!(
                    agent_id = %info.agent_id,
                    connection_id = %info.id,
                    lease = info.lease,
                    "Duplicate or stale connection release ignored"
                );
                return false;
            };

            let close = {
                let conn = &entry.connections[idx];
                conn.retire || conn.state == ConnectionState::Unhealthy
            };
            if close {
                Some(entry.connections.swap_remove(idx))
            } else {
                let conn = &mut entry.connections[idx];
                conn.state = ConnectionState::Idle;
                conn.last_used_at = Instant::now();
                None
            }
        };

        if let Some(conn) = to_close {
            debug!(agent_id = %info.agent_id, connection_id = %info.id, "Closing connection on release");
            self.discard(conn);
        }
        self.released.notify_waiters();
        true
    }

    /// Eagerly open up to `count` idle connections within both caps
    pub async fn warmup(&self, agent_id: &str, count: usize) -> usize {
        let span = pool_span!(operation = "warmup", agent_id = %agent_id, count);
        self.open_idle(agent_id, count).instrument(span).await
    }

    async fn open_idle(&self, agent_id: &str, count: usize) -> usize {
        let slot = self.slot(agent_id);
        let mut opened = 0;

        for _ in 0..count {
            {
                let mut entry = slot.lock();
                if entry.occupied() >= self.config.max_connections_per_agent || !self.reserve_global() {
                    break;
                }
                entry.opening += 1;
            }
            let reservation = Reservation::new(self, &slot);

            match tokio::time::timeout(self.config.connection_timeout(), self.transport.open(agent_id)).await {
                Ok(Ok(())) => {
                    reservation.commit(agent_id, ConnectionState::Idle);
                    opened += 1;
                }
                Ok(Err(e)) => {
                    warn!(agent_id = %agent_id, "Warmup connection failed: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(agent_id = %agent_id, "Warmup connection timed out");
                    break;
                }
            }
        }

        if opened > 0 {
            info!(agent_id = %agent_id, opened, "Warmed up connections");
            self.released.notify_waiters();
        }
        opened
    }

    /// Close connections idle longer than `idle_timeout`
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout();
        let mut expired = Vec::new();

        {
            let mut agents = self.agents.write();
            agents.retain(|_, slot| {
                let mut entry = slot.lock();
                let (stale, keep): (Vec<_>, Vec<_>) = entry
                    .connections
                    .drain(..)
                    .partition(|c| c.is_expired(now, idle_timeout));
                entry.connections = keep;
                expired.extend(stale);
                !entry.connections.is_empty() || entry.opening > 0 || Arc::strong_count(slot) > 1
            });
        }

        let count = expired.len();
        for conn in expired {
            self.discard(conn);
        }
        if count > 0 {
            debug!(closed = count, "Swept idle connections");
            self.released.notify_waiters();
        }
        count
    }

    /// Close an agent's idle connections and retire its leased ones on release
    pub fn recycle_agent(&self, agent_id: &str) -> usize {
        let Some(slot) = self.existing_slot(agent_id) else {
            return 0;
        };

        let idle = {
            let mut entry = slot.lock();
            let (idle, leased): (Vec<_>, Vec<_>) = entry
                .connections
                .drain(..)
                .partition(|c| c.state == ConnectionState::Idle);
            entry.connections = leased;
            for conn in entry.connections.iter_mut() {
                conn.retire = true;
            }
            idle
        };

        let count = idle.len();
        for conn in idle {
            self.discard(conn);
        }
        if count > 0 {
            info!(agent_id = %agent_id, closed = count, "Recycled agent connections");
            self.released.notify_waiters();
        }
        count
    }

    /// Recycle every agent, used on shutdown
    pub fn close_all(&self) -> usize {
        let ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.iter().map(|id| self.recycle_agent(id)).sum()
    }

    /// Connections currently leased for an agent
    pub fn in_use_count(&self, agent_id: &str) -> usize {
        self.existing_slot(agent_id).map_or(0, |slot| {
            slot.lock().connections.iter().filter(|c| c.is_leased()).count()
        })
    }

    /// Snapshot of an agent's connection records
    pub fn connections(&self, agent_id: &str) -> Vec<Connection> {
        self.existing_slot(agent_id)
            .map(|slot| slot.lock().connections.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> PoolStats {
        let slots: Vec<AgentSlot> = self.agents.read().values().cloned().collect();
        let mut stats = PoolStats {
            agents: slots.len(),
            waiters: self.waiters.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            ..PoolStats::default()
        };
        for slot in slots {
            let entry = slot.lock();
            stats.opening += entry.opening;
            for conn in &entry.connections {
                match conn.state {
                    ConnectionState::Idle => stats.idle += 1,
                    ConnectionState::InUse | ConnectionState::Unhealthy => stats.in_use += 1,
                    ConnectionState::Closed => {}
                }
            }
        }
        stats.total = stats.idle + stats.in_use;
        stats
    }
}

/// Counts a caller parked in `acquire` for as long as it waits
struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn new(waiters: &'a AtomicUsize) -> Self {
        waiters.fetch_add(1, Ordering::Relaxed);
        Self(waiters)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Global and per-agent slot held while a connection is being opened
///
/// Dropping it without `commit` gives both slots back, so a cancelled or
/// failed open never leaks capacity.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    slot: &'a AgentSlot,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a ConnectionPool, slot: &'a AgentSlot) -> Self {
        Self {
            pool,
            slot,
            armed: true,
        }
    }

    fn commit(mut self, agent_id: &str, state: ConnectionState) -> ConnectionInfo {
        self.armed = false;
        let conn = Connection::new(agent_id, state, self.pool.lease());
        let info = conn.info();
        {
            let mut entry = self.slot.lock();
            entry.opening = entry.opening.saturating_sub(1);
            entry.connections.push(conn);
        }
        self.pool.created.fetch_add(1, Ordering::Relaxed);
        info
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut entry = self.slot.lock();
                entry.opening = entry.opening.saturating_sub(1);
            }
            self.pool.total.fetch_sub(1, Ordering::AcqRel);
            self.pool.released.notify_waiters();
        }
    }
}

/// Leased connection, returned to the pool when dropped
#[derive(Debug)]
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    info: ConnectionInfo,
    released: bool,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, info: ConnectionInfo) -> Self {
        Self {
            pool,
            info,
            released: false,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn agent_id(&self) -> &str {
        &self.info.agent_id
    }

    /// Close the connection instead of reusing it
    pub fn mark_unhealthy(&self) {
        self.pool.mark_unhealthy(&self.info);
    }

    /// Release now rather than at end of scope
    pub fn release(mut self) -> bool {
        self.released = true;
        self.pool.release(&self.info)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release(&self.info);
        }
    }
}
