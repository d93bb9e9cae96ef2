//! Copy-on-write agent registry.
//!
//! The registry publishes an immutable [`RegistrySnapshot`] through an
//! [`ArcSwap`]. Requests pin the snapshot they started with; a reload builds
//! a new snapshot and swaps it in atomically. The previous snapshot stays
//! alive until every request holding it has finished, and is tracked as
//! retiring until then.
//!
//! Circuit breakers carry over a reload by agent id unless the agent's
//! breaker thresholds changed. Pools carry over when the transport and pool
//! settings are unchanged, so live connections survive unrelated edits.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use agentgate_agent_protocol::{
    AgentPool, AgentProtocolError, AgentTransport, ConnectionAdopter, EventType,
    MaintenanceReport, PoolStats, RegistrationRequest, ReverseListener, ReverseListenerConfig,
    TransportKind,
};
use agentgate_common::{CircuitBreaker, GateError, GateResult};

use crate::agent::AgentHandle;
use crate::config::{AgentDefinition, PipelineConfig, RouteConfig};
use crate::metrics::{AgentMetrics, PipelineMetrics};

/// Poll interval while waiting for retired snapshots to drain
const RETIREMENT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One immutable generation of agents and routes.
#[derive(Debug)]
pub struct RegistrySnapshot {
    generation: u64,
    agents: HashMap<String, Arc<AgentHandle>>,
    routes: HashMap<String, RouteConfig>,
}

impl RegistrySnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn agent(&self, id: &str) -> Option<&Arc<AgentHandle>> {
        self.agents.get(id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<AgentHandle>> {
        self.agents.values()
    }

    pub fn route(&self, id: &str) -> Option<&RouteConfig> {
        self.routes.get(id)
    }

    /// Agents subscribed to `event` on `route_id`, in configured order.
    pub fn agents_for(&self, route_id: &str, event: EventType) -> Vec<Arc<AgentHandle>> {
        let Some(route) = self.routes.get(route_id) else {
            debug!(route_id = %route_id, "No agents bound to unknown route");
            return Vec::new();
        };

        route
            .agents_for(event)
            .iter()
            .filter_map(|id| self.agents.get(id))
            .filter(|agent| agent.handles(event))
            .cloned()
            .collect()
    }
}

/// What a reload changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadReport {
    pub generation: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
    /// Agents whose breaker state survived the reload
    pub breakers_carried: usize,
    /// Agents whose connections survived the reload
    pub pools_carried: usize,
}

/// Process-wide registry of agents and routes.
pub struct AgentRegistry {
    current: ArcSwap<RegistrySnapshot>,
    retiring: Mutex<Vec<Weak<RegistrySnapshot>>>,
    reload_lock: Mutex<()>,
    metrics: Option<Arc<PipelineMetrics>>,
    /// Cancelled by [`shutdown`](AgentRegistry::shutdown)
    stopping: CancellationToken,
}

impl AgentRegistry {
    pub fn new(config: PipelineConfig) -> GateResult<Self> {
        Self::build(config, None)
    }

    /// Registry whose breakers export transitions into `metrics`.
    pub fn with_metrics(config: PipelineConfig, metrics: Arc<PipelineMetrics>) -> GateResult<Self> {
        Self::build(config, Some(metrics))
    }

    fn build(config: PipelineConfig, metrics: Option<Arc<PipelineMetrics>>) -> GateResult<Self> {
        config.validate_all()?;
        let (snapshot, report) = assemble(&config, None, 1, metrics.as_ref());

        info!(
            generation = 1,
            agents = report.added.len(),
            routes = snapshot.routes.len(),
            "Agent registry initialized"
        );

        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            retiring: Mutex::new(Vec::new()),
            reload_lock: Mutex::new(()),
            metrics,
            stopping: CancellationToken::new(),
        })
    }

    /// The current generation. Hold the returned `Arc` for the lifetime of a
    /// request so a reload cannot pull agents out from under it.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Validate `config` and atomically replace the current generation.
    ///
    /// On validation failure the current generation stays in place.
    pub fn reload(&self, config: PipelineConfig) -> GateResult<ReloadReport> {
        config.validate_all()?;

        let _guard = self.reload_lock.lock();
        let previous = self.current.load_full();
        let generation = previous.generation + 1;
        let (snapshot, report) =
            assemble(&config, Some(&previous), generation, self.metrics.as_ref());
        drop(previous);

        let retired = self.current.swap(Arc::new(snapshot));
        {
            let mut retiring = self.retiring.lock();
            retiring.retain(|weak| weak.strong_count() > 0);
            retiring.push(Arc::downgrade(&retired));
        }
        drop(retired);

        info!(
            generation = report.generation,
            added = ?report.added,
            removed = ?report.removed,
            updated = ?report.updated,
            breakers_carried = report.breakers_carried,
            pools_carried = report.pools_carried,
            "Agent registry reloaded"
        );

        Ok(report)
    }

    /// Retired generations still pinned by in-flight requests.
    pub fn pending_retirements(&self) -> usize {
        let mut retiring = self.retiring.lock();
        retiring.retain(|weak| weak.strong_count() > 0);
        retiring.len()
    }

    /// Wait until every retired generation has drained. Returns `false` if
    /// some are still pinned when `timeout` passes.
    pub async fn wait_for_retirement(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            let pending = self.pending_retirements();
            if pending == 0 {
                return true;
            }
            if started.elapsed() >= timeout {
                warn!(
                    pending = pending,
                    timeout_ms = timeout.as_millis() as u64,
                    "Retired registry generations still in use"
                );
                return false;
            }
            tokio::time::sleep(RETIREMENT_POLL_INTERVAL).await;
        }
    }

    /// Run pool maintenance for every current agent.
    pub async fn maintain(&self) -> Vec<(String, MaintenanceReport)> {
        let snapshot = self.snapshot();
        let mut reports = Vec::new();
        for agent in snapshot.agents() {
            let report = agent.pool().maintain().await;
            if report != MaintenanceReport::default() {
                debug!(
                    agent_id = %agent.id(),
                    pruned = report.pruned,
                    evicted = report.evicted,
                    created = report.created,
                    "Pool maintenance"
                );
            }
            reports.push((agent.id().to_string(), report));
        }
        reports
    }

    /// Run [`maintain`](Self::maintain) every `every` in the background.
    ///
    /// The loop holds only a weak reference and ends on
    /// [`shutdown`](Self::shutdown) or when the registry is dropped.
    pub fn spawn_maintenance(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let stopping = self.stopping.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopping.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.maintain().await;
            }
            trace!("Pool maintenance loop stopped");
        })
    }

    pub fn pool_stats(&self) -> Vec<PoolStats> {
        let snapshot = self.snapshot();
        let mut stats: Vec<_> = snapshot.agents().map(|a| a.pool().stats()).collect();
        stats.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        stats
    }

    /// Close every connection of the current generation and stop the
    /// maintenance loop.
    pub fn shutdown(&self) {
        self.stopping.cancel();
        let snapshot = self.snapshot();
        info!(
            generation = snapshot.generation,
            agents = snapshot.agents.len(),
            "Shutting down agent registry"
        );
        for agent in snapshot.agents() {
            agent.pool().shutdown();
        }
    }

    /// Bind the reverse-connection listener and adopt registered agents
    /// into this registry's pools.
    pub fn listen_reverse(
        self: &Arc<Self>,
        config: ReverseListenerConfig,
    ) -> GateResult<JoinHandle<()>> {
        let listener = ReverseListener::bind(config).map_err(|e| {
            GateError::config_with_source("Failed to bind reverse agent listener", e)
        })?;
        let adopter: Arc<dyn ConnectionAdopter> = self.clone();
        Ok(listener.spawn(adopter))
    }
}

impl ConnectionAdopter for AgentRegistry {
    fn admit(&self, registration: &RegistrationRequest) -> Result<(), AgentProtocolError> {
        let snapshot = self.snapshot();
        let agent = snapshot.agent(&registration.agent_id).ok_or_else(|| {
            AgentProtocolError::Rejected(format!(
                "agent '{}' is not configured",
                registration.agent_id
            ))
        })?;

        if agent.definition().transport.kind() != TransportKind::Reverse {
            return Err(AgentProtocolError::Rejected(format!(
                "agent '{}' is not configured for reverse connections",
                registration.agent_id
            )));
        }

        if !agent.pool().has_room() {
            return Err(AgentProtocolError::Rejected(format!(
                "connection limit reached for agent '{}'",
                registration.agent_id
            )));
        }

        Ok(())
    }

    fn adopt(&self, agent_id: &str, transport: AgentTransport) -> Result<u64, AgentProtocolError> {
        let snapshot = self.snapshot();
        let agent = snapshot.agent(agent_id).ok_or_else(|| {
            transport.close();
            AgentProtocolError::Rejected(format!("agent '{}' is not configured", agent_id))
        })?;
        agent.pool().adopt(transport)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// Build a generation from `config`, reusing state from `previous`.
fn assemble(
    config: &PipelineConfig,
    previous: Option<&Arc<RegistrySnapshot>>,
    generation: u64,
    metrics: Option<&Arc<PipelineMetrics>>,
) -> (RegistrySnapshot, ReloadReport) {
    let mut report = ReloadReport {
        generation,
        ..Default::default()
    };
    let mut agents = HashMap::with_capacity(config.agents.len());

    for definition in &config.agents {
        let prior = previous.and_then(|p| p.agents.get(&definition.id));

        let breaker = match prior {
            Some(prior) if prior.definition().circuit_breaker == definition.circuit_breaker => {
                report.breakers_carried += 1;
                Arc::clone(prior.breaker())
            }
            _ => new_breaker(definition, metrics),
        };

        let pool = match prior {
            Some(prior) if prior.definition().same_connections(definition) => {
                report.pools_carried += 1;
                Arc::clone(prior.pool())
            }
            _ => Arc::new(AgentPool::new(
                definition.id.clone(),
                definition.transport.clone(),
                definition.pool.clone(),
            )),
        };

        let agent_metrics = prior
            .map(|p| Arc::clone(p.metrics()))
            .unwrap_or_else(|| Arc::new(AgentMetrics::new()));

        match prior {
            None => report.added.push(definition.id.clone()),
            Some(prior) if prior.definition() != definition => {
                report.updated.push(definition.id.clone())
            }
            Some(_) => {}
        }

        debug!(
            agent_id = %definition.id,
            transport = %definition.transport.kind(),
            timeout_ms = definition.timeout_ms,
            failure_mode = %definition.failure_mode,
            breaker = %breaker.state(),
            "Configured agent"
        );

        agents.insert(
            definition.id.clone(),
            Arc::new(AgentHandle::new(
                definition.clone(),
                pool,
                breaker,
                agent_metrics,
            )),
        );
    }

    if let Some(previous) = previous {
        report.removed = previous
            .agents
            .keys()
            .filter(|id| !agents.contains_key(*id))
            .cloned()
            .collect();
        report.removed.sort();
    }
    report.added.sort();
    report.updated.sort();

    let routes = config
        .routes
        .iter()
        .map(|r| (r.id.clone(), r.clone()))
        .collect();

    (
        RegistrySnapshot {
            generation,
            agents,
            routes,
        },
        report,
    )
}

fn new_breaker(definition: &AgentDefinition, metrics: Option<&Arc<PipelineMetrics>>) -> Arc<CircuitBreaker> {
    let breaker = CircuitBreaker::with_name(definition.circuit_breaker.clone(), definition.id.clone());
    let breaker = match metrics {
        Some(metrics) => {
            metrics.set_breaker_state(&definition.id, breaker.state());
            breaker.with_listener(metrics.transition_listener())
        }
        None => breaker,
    };
    Arc::new(breaker)
}
