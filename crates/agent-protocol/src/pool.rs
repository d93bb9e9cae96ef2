//! Per-agent connection pool.
//!
//! Each agent owns one [`AgentPool`] holding between `min_connections` and
//! `max_connections` live transports:
//!
//! - **Lazy growth**: connections are dialed on demand when every existing
//!   connection is busy, up to the maximum
//! - **Load balancing**: round-robin, least-connections, or health-based
//! - **Bounded concurrency**: a semaphore caps concurrent calls per agent;
//!   callers wait up to their deadline or fail fast
//! - **Maintenance**: closed connections are pruned, idle ones evicted down
//!   to the minimum, and the minimum is topped up
//!
//! Reverse-connection agents never dial: their connections are adopted from
//! the reverse listener.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::errors::AgentProtocolError;
use crate::transport::{AgentTransport, TransportEndpoint, TransportKind};

/// Consecutive errors after which a connection counts as unhealthy.
const UNHEALTHY_CONSECUTIVE_ERRORS: u64 = 3;

/// Load balancing strategy for the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// Round-robin across all healthy connections
    #[default]
    RoundRobin,
    /// Route to connection with fewest in-flight calls
    LeastConnections,
    /// Prefer connections with the lowest error rate
    HealthBased,
}

/// What a caller does when every call slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Block until a slot frees up or the call deadline passes
    #[default]
    Wait,
    /// Fail immediately
    FailFast,
}

/// Pool configuration for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Concurrent calls across all connections of this agent
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default)]
    pub acquire: AcquireMode,
}

fn default_max_connections() -> usize {
    4
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_concurrent_calls() -> usize {
    64
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: default_max_connections(),
            strategy: LoadBalanceStrategy::default(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
            acquire: AcquireMode::default(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// A pooled connection to an agent.
struct PooledConnection {
    id: u64,
    transport: AgentTransport,
    created_at: Instant,
    /// Milliseconds since created_at when last used
    last_used_offset_ms: AtomicU64,
    leases: AtomicUsize,
    request_count: AtomicU64,
    error_count: AtomicU64,
    consecutive_errors: AtomicU64,
}

impl PooledConnection {
    fn new(id: u64, transport: AgentTransport) -> Self {
        Self {
            id,
            transport,
            created_at: Instant::now(),
            last_used_offset_ms: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            request_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            consecutive_errors: AtomicU64::new(0),
        }
    }

    fn leases(&self) -> usize {
        self.leases.load(Ordering::Relaxed)
    }

    fn error_rate(&self) -> f64 {
        let requests = self.request_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        if requests == 0 {
            0.0
        } else {
            errors as f64 / requests as f64
        }
    }

    fn is_healthy(&self) -> bool {
        self.transport.is_connected()
            && self.consecutive_errors.load(Ordering::Relaxed) < UNHEALTHY_CONSECUTIVE_ERRORS
    }

    #[inline]
    fn touch(&self) {
        let offset = self.created_at.elapsed().as_millis() as u64;
        self.last_used_offset_ms.store(offset, Ordering::Relaxed);
    }

    fn last_used(&self) -> Instant {
        let offset_ms = self.last_used_offset_ms.load(Ordering::Relaxed);
        self.created_at + Duration::from_millis(offset_ms)
    }

    fn is_idle_for(&self, timeout: Duration) -> bool {
        self.leases() == 0 && self.last_used().elapsed() >= timeout
    }
}

/// Exclusive claim on one call slot plus a shared connection.
///
/// The connection stays in the pool while leased; dropping the lease frees
/// the slot.
pub struct PooledLease {
    conn: Arc<PooledConnection>,
    _permit: OwnedSemaphorePermit,
}

impl PooledLease {
    pub fn transport(&self) -> &AgentTransport {
        &self.conn.transport
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    pub fn record_success(&self) {
        self.conn.request_count.fetch_add(1, Ordering::Relaxed);
        self.conn.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.conn.request_count.fetch_add(1, Ordering::Relaxed);
        self.conn.error_count.fetch_add(1, Ordering::Relaxed);
        self.conn.consecutive_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for PooledLease {
    fn drop(&mut self) {
        self.conn.leases.fetch_sub(1, Ordering::Relaxed);
        self.conn.touch();
    }
}

impl std::fmt::Debug for PooledLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledLease")
            .field("connection_id", &self.conn.id)
            .field("kind", &self.conn.transport.kind())
            .finish()
    }
}

/// Statistics for one agent's pool.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub agent_id: String,
    pub connections: usize,
    pub healthy_connections: usize,
    /// Calls awaiting a response across all connections
    pub in_flight: usize,
    /// Call slots currently free
    pub available_slots: usize,
    pub total_requests: u64,
    pub total_errors: u64,
    pub connections_created: u64,
    pub connections_discarded: u64,
}

/// Why a dial slot is being reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    /// A caller found no idle connection
    Demand,
    /// Maintenance is filling up to `min_connections`
    Minimum,
}

/// A dial slot counted against `max_connections` until dropped.
struct DialReservation<'a> {
    pool: &'a AgentPool,
}

impl Drop for DialReservation<'_> {
    fn drop(&mut self) {
        self.pool.creating.fetch_sub(1, Ordering::AcqRel);
        // Dialed connections are inserted before this point
        self.pool.dialed.notify_waiters();
    }
}

/// Result of one [`AgentPool::maintain`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub pruned: usize,
    pub evicted: usize,
    pub created: usize,
}

/// Connection pool for one agent.
pub struct AgentPool {
    agent_id: String,
    endpoint: TransportEndpoint,
    config: PoolConfig,
    connections: RwLock<Vec<Arc<PooledConnection>>>,
    /// Dials in progress, counted against the maximum. Only changed while
    /// holding the `connections` write lock or by a dropped reservation.
    creating: AtomicUsize,
    /// Woken whenever a dial finishes, successfully or not
    dialed: Notify,
    round_robin_index: AtomicUsize,
    next_connection_id: AtomicU64,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    connections_created: AtomicU64,
    connections_discarded: AtomicU64,
}

impl AgentPool {
    pub fn new(agent_id: impl Into<String>, endpoint: TransportEndpoint, config: PoolConfig) -> Self {
        let agent_id = agent_id.into();
        debug!(
            agent_id = %agent_id,
            transport = %endpoint.kind(),
            min = config.min_connections,
            max = config.max_connections,
            strategy = ?config.strategy,
            "Creating agent pool"
        );
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_calls)),
            agent_id,
            endpoint,
            config,
            connections: RwLock::new(Vec::new()),
            creating: AtomicUsize::new(0),
            dialed: Notify::new(),
            round_robin_index: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            connections_created: AtomicU64::new(0),
            connections_discarded: AtomicU64::new(0),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn endpoint(&self) -> &TransportEndpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Claim a call slot and a connection, dialing a new one if every
    /// connection is busy and the pool has room.
    ///
    /// `deadline` bounds both the wait for a slot (in [`AcquireMode::Wait`])
    /// and any dial.
    pub async fn acquire(
        &self,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<PooledLease, AgentProtocolError> {
        if self.is_closed() {
            return Err(self.shut_down_error());
        }

        let permit = self.acquire_permit(deadline).await?;
        let conn = self.select_or_grow(deadline).await?;

        conn.leases.fetch_add(1, Ordering::Relaxed);
        conn.touch();
        trace!(agent_id = %self.agent_id, connection_id = conn.id, "Connection leased");

        Ok(PooledLease {
            conn,
            _permit: permit,
        })
    }

    async fn acquire_permit(
        &self,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<OwnedSemaphorePermit, AgentProtocolError> {
        let exhausted = AgentProtocolError::PoolExhausted {
            max_concurrent: self.config.max_concurrent_calls,
        };

        match self.config.acquire {
            AcquireMode::FailFast => match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => Ok(permit),
                Err(tokio::sync::TryAcquireError::NoPermits) => Err(exhausted),
                Err(tokio::sync::TryAcquireError::Closed) => Err(self.shut_down_error()),
            },
            AcquireMode::Wait => {
                let acquire = Arc::clone(&self.permits).acquire_owned();
                let result = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, acquire).await {
                        Ok(result) => result,
                        Err(_) => return Err(exhausted),
                    },
                    None => acquire.await,
                };
                result.map_err(|_| self.shut_down_error())
            }
        }
    }

    async fn select_or_grow(
        &self,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Arc<PooledConnection>, AgentProtocolError> {
        let started = tokio::time::Instant::now();
        loop {
            if self.is_closed() {
                return Err(self.shut_down_error());
            }
            self.prune_disconnected();

            // Registered before looking, so a dial finishing in between still wakes us
            let dialed = self.dialed.notified();
            tokio::pin!(dialed);
            dialed.as_mut().enable();

            if let Some(reservation) = self.reserve_dial(Growth::Demand) {
                let result = self.dial(deadline).await;
                drop(reservation);
                match result {
                    Ok(conn) => return Ok(conn),
                    Err(e) => {
                        if self.connection_count() == 0 {
                            return Err(e);
                        }
                        debug!(
                            agent_id = %self.agent_id,
                            error = %e,
                            "Failed to grow pool, reusing existing connection"
                        );
                    }
                }
            }

            if let Some(conn) = self.select() {
                return Ok(conn);
            }
            if self.creating.load(Ordering::Acquire) == 0 {
                return Err(AgentProtocolError::Unavailable(format!(
                    "No connections available for agent '{}'",
                    self.agent_id
                )));
            }

            trace!(agent_id = %self.agent_id, "Waiting for an in-progress dial");
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, dialed).await.is_err() {
                        return Err(AgentProtocolError::ConnectTimeout(
                            deadline.saturating_duration_since(started),
                        ));
                    }
                }
                None => dialed.await,
            }
        }
    }

    /// Reserve a dial slot if the pool should grow for `growth`.
    ///
    /// The check and the increment happen under the `connections` write
    /// lock, so concurrent callers can never reserve past the maximum.
    fn reserve_dial(&self, growth: Growth) -> Option<DialReservation<'_>> {
        if self.endpoint.kind() == TransportKind::Reverse {
            return None;
        }
        let connections = self.connections.write();
        let total = connections.len() + self.creating.load(Ordering::Acquire);
        if total >= self.config.max_connections {
            return None;
        }
        let wanted = total < self.config.min_connections
            || (growth == Growth::Demand
                && (connections.is_empty() || connections.iter().all(|c| c.leases() > 0)));
        if !wanted {
            return None;
        }
        self.creating.fetch_add(1, Ordering::AcqRel);
        Some(DialReservation { pool: self })
    }

    async fn dial(
        &self,
        deadline: Option<tokio::time::Instant>,
    ) -> Result<Arc<PooledConnection>, AgentProtocolError> {
        let connect = self.endpoint.connect(&self.agent_id);
        let transport = match deadline {
            Some(deadline) => {
                let budget = deadline.saturating_duration_since(tokio::time::Instant::now());
                match tokio::time::timeout_at(deadline, connect).await {
                    Ok(result) => result?,
                    Err(_) => return Err(AgentProtocolError::ConnectTimeout(budget)),
                }
            }
            None => connect.await?,
        };

        let conn = self.insert(transport);
        debug!(
            agent_id = %self.agent_id,
            connection_id = conn.id,
            connections = self.connection_count(),
            "Pool grew"
        );
        Ok(conn)
    }

    fn insert(&self, transport: AgentTransport) -> Arc<PooledConnection> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(PooledConnection::new(id, transport));
        self.connections.write().push(Arc::clone(&conn));
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        conn
    }

    fn select(&self) -> Option<Arc<PooledConnection>> {
        let connections = self.connections.read();
        let connected: Vec<&Arc<PooledConnection>> = connections
            .iter()
            .filter(|c| c.transport.is_connected())
            .collect();
        let healthy: Vec<&Arc<PooledConnection>> =
            connected.iter().copied().filter(|c| c.is_healthy()).collect();
        // With every connection unhealthy, still try one rather than fail
        let candidates = if healthy.is_empty() { connected } else { healthy };
        if candidates.is_empty() {
            return None;
        }

        let selected = match self.config.strategy {
            LoadBalanceStrategy::RoundRobin => {
                let idx = self.round_robin_index.fetch_add(1, Ordering::Relaxed);
                candidates[idx % candidates.len()]
            }
            LoadBalanceStrategy::LeastConnections => candidates
                .iter()
                .copied()
                .min_by_key(|c| c.leases())?,
            LoadBalanceStrategy::HealthBased => candidates.iter().copied().min_by(|a, b| {
                a.error_rate()
                    .partial_cmp(&b.error_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.leases().cmp(&b.leases()))
            })?,
        };
        Some(Arc::clone(selected))
    }

    /// Remove the lease's connection from the pool and close it.
    pub fn discard(&self, lease: &PooledLease) {
        let id = lease.conn.id;
        let removed = {
            let mut connections = self.connections.write();
            let before = connections.len();
            connections.retain(|c| c.id != id);
            before != connections.len()
        };
        if removed {
            self.connections_discarded.fetch_add(1, Ordering::Relaxed);
            lease.conn.transport.close();
            debug!(agent_id = %self.agent_id, connection_id = id, "Discarded connection");
        }
    }

    /// Adopt a connection established elsewhere (the reverse listener).
    pub fn adopt(&self, transport: AgentTransport) -> Result<u64, AgentProtocolError> {
        if self.is_closed() {
            transport.close();
            return Err(self.shut_down_error());
        }
        self.prune_disconnected();

        let current = self.connection_count();
        if current >= self.config.max_connections {
            transport.close();
            return Err(AgentProtocolError::Rejected(format!(
                "Agent '{}' already has {} connections (max {})",
                self.agent_id, current, self.config.max_connections
            )));
        }

        let conn = self.insert(transport);
        info!(
            agent_id = %self.agent_id,
            connection_id = conn.id,
            connections = current + 1,
            "Adopted connection"
        );
        Ok(conn.id)
    }

    /// Whether another connection would be accepted by [`adopt`](Self::adopt).
    pub fn has_room(&self) -> bool {
        !self.is_closed() && {
            self.prune_disconnected();
            self.connection_count() < self.config.max_connections
        }
    }

    fn prune_disconnected(&self) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|c| c.transport.is_connected());
        let pruned = before - connections.len();
        if pruned > 0 {
            self.connections_discarded
                .fetch_add(pruned as u64, Ordering::Relaxed);
            trace!(agent_id = %self.agent_id, pruned, "Pruned closed connections");
        }
        pruned
    }

    /// Prune closed connections, evict idle ones above the minimum, and dial
    /// back up to the minimum.
    pub async fn maintain(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_closed() {
            return report;
        }
        report.pruned = self.prune_disconnected();

        let idle_timeout = self.config.idle_timeout();
        let evicted: Vec<Arc<PooledConnection>> = {
            let mut connections = self.connections.write();
            let mut excess = connections.len().saturating_sub(self.config.min_connections);
            let mut evicted = Vec::new();
            connections.retain(|c| {
                if excess > 0 && c.is_idle_for(idle_timeout) {
                    excess -= 1;
                    evicted.push(Arc::clone(c));
                    false
                } else {
                    true
                }
            });
            evicted
        };
        for conn in &evicted {
            conn.transport.close();
        }
        report.evicted = evicted.len();
        self.connections_discarded
            .fetch_add(report.evicted as u64, Ordering::Relaxed);

        while let Some(reservation) = self.reserve_dial(Growth::Minimum) {
            let result = self.endpoint.connect(&self.agent_id).await;
            match result {
                Ok(transport) => {
                    self.insert(transport);
                    drop(reservation);
                    report.created += 1;
                }
                Err(e) => {
                    drop(reservation);
                    warn!(agent_id = %self.agent_id, error = %e, "Failed to top up pool");
                    break;
                }
            }
        }

        if report != MaintenanceReport::default() {
            debug!(
                agent_id = %self.agent_id,
                pruned = report.pruned,
                evicted = report.evicted,
                created = report.created,
                "Pool maintenance"
            );
        }
        report
    }

    pub fn stats(&self) -> PoolStats {
        let connections = self.connections.read();
        PoolStats {
            agent_id: self.agent_id.clone(),
            connections: connections.len(),
            healthy_connections: connections.iter().filter(|c| c.is_healthy()).count(),
            in_flight: connections.iter().map(|c| c.transport.in_flight()).sum(),
            available_slots: self.permits.available_permits(),
            total_requests: connections
                .iter()
                .map(|c| c.request_count.load(Ordering::Relaxed))
                .sum(),
            total_errors: connections
                .iter()
                .map(|c| c.error_count.load(Ordering::Relaxed))
                .sum(),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_discarded: self.connections_discarded.load(Ordering::Relaxed),
        }
    }

    /// Close every connection and refuse further acquisitions.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        self.dialed.notify_waiters();
        let drained: Vec<Arc<PooledConnection>> = self.connections.write().drain(..).collect();
        for conn in &drained {
            conn.transport.close();
        }
        info!(agent_id = %self.agent_id, closed = drained.len(), "Pool shut down");
    }

    fn shut_down_error(&self) -> AgentProtocolError {
        AgentProtocolError::Unavailable(format!("Pool for agent '{}' is shut down", self.agent_id))
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        for conn in self.connections.get_mut().drain(..) {
            conn.transport.close();
        }
    }
}

impl std::fmt::Debug for AgentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentPool")
            .field("agent_id", &self.agent_id)
            .field("transport", &self.endpoint.kind())
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameCodec;
    use crate::local::LocalStreamOptions;
    use crate::protocol::{Encoding, DEFAULT_MAX_MESSAGE_BYTES};
    use crate::server::{AgentHandler, AgentServer};
    use crate::session::FramedSession;
    use tokio::io::DuplexStream;

    struct AllowAll;

    #[async_trait::async_trait]
    impl AgentHandler for AllowAll {}

    /// A connected transport whose agent side is kept alive by the caller.
    fn duplex_transport() -> (AgentTransport, DuplexStream) {
        let (proxy_side, agent_side) = tokio::io::duplex(4096);
        let (r, w) = tokio::io::split(proxy_side);
        let session = FramedSession::spawn(
            "agent",
            "duplex",
            r,
            w,
            FrameCodec::new(Encoding::Json, DEFAULT_MAX_MESSAGE_BYTES),
        );
        (AgentTransport::Reverse(session), agent_side)
    }

    fn reverse_pool(config: PoolConfig, n: usize) -> (AgentPool, Vec<DuplexStream>) {
        let pool = AgentPool::new("agent", TransportEndpoint::Reverse, config);
        let mut keep = Vec::new();
        for _ in 0..n {
            let (transport, agent_side) = duplex_transport();
            pool.adopt(transport).unwrap();
            keep.push(agent_side);
        }
        (pool, keep)
    }

    fn local_pool(config: PoolConfig) -> (AgentPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.sock");
        AgentServer::new("agent", &path, Arc::new(AllowAll))
            .spawn()
            .unwrap();
        let endpoint = TransportEndpoint::LocalStream(LocalStreamOptions::new(&path));
        (AgentPool::new("agent", endpoint, config), dir)
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 0);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.strategy, LoadBalanceStrategy::RoundRobin);
        assert_eq!(config.acquire, AcquireMode::Wait);
    }

    #[tokio::test]
    async fn test_connections_created_lazily_and_reused() {
        let (pool, _dir) = local_pool(PoolConfig::default());
        assert_eq!(pool.connection_count(), 0);

        let lease = pool.acquire(None).await.unwrap();
        let first = lease.connection_id();
        drop(lease);
        assert_eq!(pool.connection_count(), 1);

        let lease = pool.acquire(None).await.unwrap();
        assert_eq!(lease.connection_id(), first);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_grows_under_load_up_to_max() {
        let config = PoolConfig {
            max_connections: 2,
            ..Default::default()
        };
        let (pool, _dir) = local_pool(config);

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        assert_ne!(a.connection_id(), b.connection_id());
        assert_eq!(pool.connection_count(), 2);

        // At the maximum, further calls share existing connections
        let c = pool.acquire(None).await.unwrap();
        assert_eq!(pool.connection_count(), 2);
        assert!(c.connection_id() == a.connection_id() || c.connection_id() == b.connection_id());
    }

    #[tokio::test]
    async fn test_fail_fast_when_exhausted() {
        let config = PoolConfig {
            max_concurrent_calls: 1,
            acquire: AcquireMode::FailFast,
            ..Default::default()
        };
        let (pool, _keep) = reverse_pool(config, 1);

        let _held = pool.acquire(None).await.unwrap();
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, AgentProtocolError::PoolExhausted { max_concurrent: 1 }));
    }

    #[tokio::test]
    async fn test_wait_bounded_by_deadline() {
        let config = PoolConfig {
            max_concurrent_calls: 1,
            ..Default::default()
        };
        let (pool, _keep) = reverse_pool(config, 1);
        let pool = Arc::new(pool);

        let held = pool.acquire(None).await.unwrap();
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(50);
        let err = pool.acquire(Some(deadline)).await.unwrap_err();
        assert!(matches!(err, AgentProtocolError::PoolExhausted { .. }));
        assert!(start.elapsed() >= Duration::from_millis(45));

        // A slot freed while waiting is handed over
        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
                pool.acquire(Some(deadline)).await.map(|l| l.connection_id())
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let (pool, _keep) = reverse_pool(PoolConfig::default(), 2);
        let a = pool.acquire(None).await.unwrap().connection_id();
        let b = pool.acquire(None).await.unwrap().connection_id();
        let c = pool.acquire(None).await.unwrap().connection_id();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[tokio::test]
    async fn test_least_connections_prefers_idle() {
        let config = PoolConfig {
            strategy: LoadBalanceStrategy::LeastConnections,
            ..Default::default()
        };
        let (pool, _keep) = reverse_pool(config, 2);
        let first = pool.acquire(None).await.unwrap();
        let second = pool.acquire(None).await.unwrap();
        assert_ne!(first.connection_id(), second.connection_id());
    }

    #[tokio::test]
    async fn test_health_based_avoids_failing_connection() {
        let config = PoolConfig {
            strategy: LoadBalanceStrategy::HealthBased,
            ..Default::default()
        };
        let (pool, _keep) = reverse_pool(config, 2);

        let bad = pool.acquire(None).await.unwrap();
        let bad_id = bad.connection_id();
        bad.record_failure();
        bad.record_failure();
        bad.record_failure();
        drop(bad);

        for _ in 0..4 {
            let lease = pool.acquire(None).await.unwrap();
            assert_ne!(lease.connection_id(), bad_id);
            lease.record_success();
        }
        assert_eq!(pool.stats().healthy_connections, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_connection() {
        let (pool, _keep) = reverse_pool(PoolConfig::default(), 2);
        let lease = pool.acquire(None).await.unwrap();
        pool.discard(&lease);
        assert!(!lease.transport().is_connected());
        drop(lease);
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.stats().connections_discarded, 1);
    }

    #[tokio::test]
    async fn test_closed_connections_pruned_on_acquire() {
        let (pool, mut keep) = reverse_pool(PoolConfig::default(), 2);
        // Agent side of the first connection hangs up
        drop(keep.remove(0));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let lease = pool.acquire(None).await.unwrap();
        assert!(lease.transport().is_connected());
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_reverse_pool_does_not_dial() {
        let (pool, _keep) = reverse_pool(PoolConfig::default(), 0);
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, AgentProtocolError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_adopt_enforces_max_connections() {
        let config = PoolConfig {
            max_connections: 1,
            ..Default::default()
        };
        let (pool, _keep) = reverse_pool(config, 1);
        assert!(!pool.has_room());
        let (extra, _agent_side) = duplex_transport();
        let err = pool.adopt(extra).unwrap_err();
        assert!(matches!(err, AgentProtocolError::Rejected(_)));
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_maintain_evicts_idle_above_min_and_tops_up() {
        let config = PoolConfig {
            min_connections: 1,
            idle_timeout_ms: 0,
            ..Default::default()
        };
        let (pool, _dir) = local_pool(config);

        let report = pool.maintain().await;
        assert_eq!(report.created, 1);
        assert_eq!(pool.connection_count(), 1);

        let a = pool.acquire(None).await.unwrap();
        let b = pool.acquire(None).await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.connection_count(), 2);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = pool.maintain().await;
        assert_eq!(report.evicted, 1);
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_respect_max_connections() {
        let config = PoolConfig {
            max_connections: 1,
            ..Default::default()
        };
        let (pool, _dir) = local_pool(config);
        let pool = Arc::new(pool);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let pool = Arc::clone(&pool);
            tasks.spawn(async move {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
                let lease = pool.acquire(Some(deadline)).await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<u64, AgentProtocolError>(lease.connection_id())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            assert!(joined.unwrap().is_ok());
            assert!(pool.connection_count() <= 1);
        }
        assert_eq!(pool.connection_count(), 1);
        assert_eq!(pool.stats().connections_created, 1);
    }

    #[tokio::test]
    async fn test_maintain_tops_up_to_min_without_overshoot() {
        let config = PoolConfig {
            min_connections: 2,
            max_connections: 2,
            ..Default::default()
        };
        let (pool, _dir) = local_pool(config);

        let (first, second) = tokio::join!(pool.maintain(), pool.maintain());
        assert_eq!(first.created + second.created, 2);
        assert_eq!(pool.connection_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_eviction_follows_tokio_clock() {
        let config = PoolConfig {
            idle_timeout_ms: 1_000,
            ..Default::default()
        };
        let (pool, _keep) = reverse_pool(config, 2);
        drop(pool.acquire(None).await.unwrap());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(pool.maintain().await.evicted, 0);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(pool.maintain().await.evicted, 2);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_surfaces() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint =
            TransportEndpoint::LocalStream(LocalStreamOptions::new(dir.path().join("none.sock")));
        let pool = AgentPool::new("agent", endpoint, PoolConfig::default());
        let err = pool.acquire(None).await.unwrap_err();
        assert!(matches!(err, AgentProtocolError::ConnectionFailed(_)));
        assert_eq!(pool.stats().available_slots, 64);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_acquire() {
        let (pool, _keep) = reverse_pool(PoolConfig::default(), 1);
        pool.shutdown();
        assert_eq!(pool.connection_count(), 0);
        assert!(matches!(
            pool.acquire(None).await,
            Err(AgentProtocolError::Unavailable(_))
        ));
    }
}
