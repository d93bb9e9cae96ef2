//! Agent call metrics.
//!
//! [`AgentMetrics`] is a lock-free per-agent tally that survives reloads and
//! backs stats endpoints. [`PipelineMetrics`] exports the same events as
//! Prometheus collectors into a registry owned by the caller.

use anyhow::{Context, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentgate_agent_protocol::EventType;
use agentgate_common::{CircuitBreakerState, TransitionListener};

/// Per-agent call counters.
#[derive(Debug, Default)]
pub struct AgentMetrics {
    calls_total: AtomicU64,
    calls_success: AtomicU64,
    calls_failed: AtomicU64,
    calls_timeout: AtomicU64,
    circuit_open_skips: AtomicU64,
    calls_cancelled: AtomicU64,
    /// Total duration of answered calls (microseconds)
    duration_total_us: AtomicU64,
}

/// Point-in-time copy of [`AgentMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentMetricsSnapshot {
    pub calls_total: u64,
    pub calls_success: u64,
    pub calls_failed: u64,
    pub calls_timeout: u64,
    pub circuit_open_skips: u64,
    pub calls_cancelled: u64,
    pub duration_total_us: u64,
}

impl AgentMetricsSnapshot {
    pub fn average_duration_us(&self) -> f64 {
        if self.calls_success == 0 {
            0.0
        } else {
            self.duration_total_us as f64 / self.calls_success as f64
        }
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration: Duration) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        self.calls_success.fetch_add(1, Ordering::Relaxed);
        self.duration_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Timeouts are counted separately from other failures.
    pub fn record_failure(&self, timeout: bool) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.calls_timeout.fetch_add(1, Ordering::Relaxed);
        } else {
            self.calls_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_circuit_open(&self) {
        self.circuit_open_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.calls_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentMetricsSnapshot {
        AgentMetricsSnapshot {
            calls_total: self.calls_total.load(Ordering::Relaxed),
            calls_success: self.calls_success.load(Ordering::Relaxed),
            calls_failed: self.calls_failed.load(Ordering::Relaxed),
            calls_timeout: self.calls_timeout.load(Ordering::Relaxed),
            circuit_open_skips: self.circuit_open_skips.load(Ordering::Relaxed),
            calls_cancelled: self.calls_cancelled.load(Ordering::Relaxed),
            duration_total_us: self.duration_total_us.load(Ordering::Relaxed),
        }
    }
}

/// Prometheus collectors for the agent pipeline.
pub struct PipelineMetrics {
    /// Call latency by agent, event and outcome
    call_duration: HistogramVec,
    /// Calls by agent and outcome
    calls: IntCounterVec,
    /// Breaker state (0=closed, 1=open, 2=half_open)
    breaker_state: IntGaugeVec,
    /// Breaker transitions by target state
    breaker_transitions: IntCounterVec,
    /// Aggregated decision per phase
    phase_decisions: IntCounterVec,
    /// Bodies whose inspection stopped at the limit
    body_truncations: IntCounterVec,
}

impl PipelineMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self> {
        let latency_buckets = vec![
            0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
        ];

        let call_duration = HistogramVec::new(
            HistogramOpts::new(
                "agentgate_agent_call_duration_seconds",
                "Agent call latency in seconds",
            )
            .buckets(latency_buckets),
            &["agent", "event", "outcome"],
        )
        .context("Failed to create agent_call_duration metric")?;

        let calls = IntCounterVec::new(
            Opts::new("agentgate_agent_calls_total", "Agent calls by outcome"),
            &["agent", "outcome"],
        )
        .context("Failed to create agent_calls_total metric")?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "agentgate_agent_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            ),
            &["agent"],
        )
        .context("Failed to create circuit_breaker_state metric")?;

        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "agentgate_agent_circuit_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["agent", "to"],
        )
        .context("Failed to create circuit_breaker_transitions metric")?;

        let phase_decisions = IntCounterVec::new(
            Opts::new(
                "agentgate_phase_decisions_total",
                "Aggregated decision per lifecycle phase",
            ),
            &["event", "decision"],
        )
        .context("Failed to create phase_decisions metric")?;

        let body_truncations = IntCounterVec::new(
            Opts::new(
                "agentgate_body_inspection_truncated_total",
                "Bodies whose inspection stopped at the agent's limit",
            ),
            &["agent"],
        )
        .context("Failed to create body_truncations metric")?;

        registry
            .register(Box::new(call_duration.clone()))
            .context("Failed to register agent_call_duration metric")?;
        registry
            .register(Box::new(calls.clone()))
            .context("Failed to register agent_calls_total metric")?;
        registry
            .register(Box::new(breaker_state.clone()))
            .context("Failed to register circuit_breaker_state metric")?;
        registry
            .register(Box::new(breaker_transitions.clone()))
            .context("Failed to register circuit_breaker_transitions metric")?;
        registry
            .register(Box::new(phase_decisions.clone()))
            .context("Failed to register phase_decisions metric")?;
        registry
            .register(Box::new(body_truncations.clone()))
            .context("Failed to register body_truncations metric")?;

        Ok(Self {
            call_duration,
            calls,
            breaker_state,
            breaker_transitions,
            phase_decisions,
            body_truncations,
        })
    }

    /// Record one settled call. `outcome` is `success` or a failure kind.
    pub fn observe_call(&self, agent: &str, event: EventType, outcome: &str, duration: Duration) {
        self.call_duration
            .with_label_values(&[agent, event.as_str(), outcome])
            .observe(duration.as_secs_f64());
        self.calls.with_label_values(&[agent, outcome]).inc();
    }

    pub fn set_breaker_state(&self, agent: &str, state: CircuitBreakerState) {
        self.breaker_state
            .with_label_values(&[agent])
            .set(state.as_gauge());
    }

    pub fn record_transition(&self, agent: &str, to: CircuitBreakerState) {
        self.breaker_transitions
            .with_label_values(&[agent, to.as_str()])
            .inc();
        self.set_breaker_state(agent, to);
    }

    pub fn record_phase(&self, event: EventType, decision: &str) {
        self.phase_decisions
            .with_label_values(&[event.as_str(), decision])
            .inc();
    }

    pub fn record_truncation(&self, agent: &str) {
        self.body_truncations.with_label_values(&[agent]).inc();
    }

    /// Breaker listener that exports transitions into these collectors.
    pub fn transition_listener(self: &Arc<Self>) -> TransitionListener {
        let metrics = Arc::clone(self);
        Arc::new(move |agent, _from, to| metrics.record_transition(agent, to))
    }
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_snapshot() {
        let metrics = AgentMetrics::new();
        metrics.record_success(Duration::from_micros(300));
        metrics.record_success(Duration::from_micros(100));
        metrics.record_failure(true);
        metrics.record_failure(false);
        metrics.record_circuit_open();
        metrics.record_cancelled();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.calls_total, 4);
        assert_eq!(snapshot.calls_success, 2);
        assert_eq!(snapshot.calls_timeout, 1);
        assert_eq!(snapshot.calls_failed, 1);
        assert_eq!(snapshot.circuit_open_skips, 1);
        assert_eq!(snapshot.calls_cancelled, 1);
        assert_eq!(snapshot.average_duration_us(), 200.0);
    }

    #[test]
    fn test_pipeline_metrics_export() {
        let registry = Registry::new();
        let metrics = Arc::new(PipelineMetrics::new(&registry).unwrap());

        metrics.observe_call("waf", EventType::RequestHeaders, "success", Duration::from_millis(2));
        metrics.record_phase(EventType::RequestHeaders, "allow");
        metrics.record_truncation("waf");
        let listener = metrics.transition_listener();
        listener("waf", CircuitBreakerState::Closed, CircuitBreakerState::Open);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"agentgate_agent_call_duration_seconds".to_string()));
        assert!(names.contains(&"agentgate_agent_circuit_breaker_transitions_total".to_string()));

        let state = families
            .iter()
            .find(|f| f.get_name() == "agentgate_agent_circuit_breaker_state")
            .unwrap();
        assert_eq!(state.get_metric()[0].get_gauge().get_value(), 1.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        PipelineMetrics::new(&registry).unwrap();
        assert!(PipelineMetrics::new(&registry).is_err());
    }
}
