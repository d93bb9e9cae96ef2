//! Bounded, cancellable agent calls.
//!
//! One [`CallExecutor::execute`] is one logical call: breaker admission,
//! pool acquisition, the exchange itself and at most one retry on a fresh
//! connection, all inside the agent's timeout. The breaker sees the call
//! exactly once, when it settles. Calls the proxy abandons itself are not
//! counted either way.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use agentgate_agent_protocol::{
    AcquireMode, AgentProtocolError, AgentRequest, AgentResponse, AgentTransport, CancelReason,
    EventType,
};
use agentgate_common::{Admission, CorrelationId};

use crate::agent::AgentHandle;
use crate::context::CallContext;
use crate::errors::{CallFailure, FailureKind};
use crate::metrics::PipelineMetrics;

/// Upper bound on delivering a cancel notice to an agent
const CANCEL_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// An answered call.
#[derive(Debug, Clone)]
pub struct CallSuccess {
    pub response: AgentResponse,
    pub latency: Duration,
    pub connection_id: u64,
    /// 2 when the first connection failed and the call was retried
    pub attempts: u32,
}

/// Issues agent calls and settles them with the breaker and metrics.
#[derive(Debug, Clone, Default)]
pub struct CallExecutor {
    metrics: Option<Arc<PipelineMetrics>>,
}

impl CallExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
        }
    }

    /// Call `agent` with `requests` as one logical call.
    ///
    /// Several requests form a sequence (body chunks of one flush) that the
    /// agent answers with a single decision.
    pub async fn execute(
        &self,
        agent: &AgentHandle,
        ctx: &CallContext,
        requests: &[AgentRequest],
    ) -> Result<CallSuccess, CallFailure> {
        let started = Instant::now();
        let Some(first) = requests.first() else {
            return Err(CallFailure::new(
                FailureKind::AgentProtocolError,
                "empty call",
                Duration::ZERO,
            ));
        };
        let event = first.event_type();

        if ctx.is_cancelled() {
            agent.metrics().record_cancelled();
            return Err(cancelled(ctx, started));
        }

        let Some(_slot) = ctx.begin_call(agent.id(), event) else {
            error!(
                correlation_id = %ctx.correlation_id(),
                agent_id = %agent.id(),
                event = %event,
                "Call already in flight for this agent and phase"
            );
            return Err(CallFailure::new(
                FailureKind::AgentProtocolError,
                format!("call for {event} already in flight"),
                Duration::ZERO,
            ));
        };

        let admission = agent.breaker().try_acquire();
        if admission == Admission::Rejected {
            agent.metrics().record_circuit_open();
            self.observe(agent, event, FailureKind::CircuitOpen.as_str(), Duration::ZERO);
            debug!(
                correlation_id = %ctx.correlation_id(),
                agent_id = %agent.id(),
                event = %event,
                "Circuit breaker open, skipping agent"
            );
            return Err(CallFailure::circuit_open(agent.id()));
        }

        let mut deadline = started + agent.timeout();
        if let Some(phase_deadline) = ctx.phase_deadline() {
            deadline = deadline.min(phase_deadline);
        }

        trace!(
            correlation_id = %ctx.correlation_id(),
            agent_id = %agent.id(),
            event = %event,
            messages = requests.len(),
            trial = admission == Admission::Trial,
            timeout_ms = agent.definition().timeout_ms,
            "Calling agent"
        );

        let result = self.attempt(agent, ctx, requests, deadline, started).await;
        self.settle(agent, ctx, event, admission, result)
    }

    async fn attempt(
        &self,
        agent: &AgentHandle,
        ctx: &CallContext,
        requests: &[AgentRequest],
        deadline: Instant,
        started: Instant,
    ) -> Result<CallSuccess, CallFailure> {
        let max_attempts = if agent.definition().retry_on_connection_error {
            2
        } else {
            1
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            let may_retry = |error: &AgentProtocolError| {
                error.is_retryable()
                    && attempts < max_attempts
                    && Instant::now() < deadline
                    && !ctx.is_cancelled()
            };

            let acquired = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(cancelled(ctx, started)),
                acquired = agent.pool().acquire(Some(deadline)) => acquired,
            };
            let lease = match acquired {
                Ok(lease) => lease,
                Err(error) if may_retry(&error) => {
                    debug!(
                        correlation_id = %ctx.correlation_id(),
                        agent_id = %agent.id(),
                        error = %error,
                        "Connection unavailable, retrying once"
                    );
                    continue;
                }
                Err(error) => return Err(acquire_failure(agent, &error, started)),
            };

            let transport = lease.transport();
            let call = async {
                match requests {
                    [single] => transport.call(single).await,
                    sequence => transport.call_sequence(sequence).await,
                }
            };

            let outcome = tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    let reason = ctx.cancel_reason().unwrap_or(CancelReason::Manual);
                    send_cancel(transport, ctx.correlation_id(), reason).await;
                    return Err(cancelled(ctx, started));
                }
                outcome = tokio::time::timeout_at(deadline, call) => outcome,
            };

            match outcome {
                Ok(Ok(response)) => {
                    lease.record_success();
                    return Ok(CallSuccess {
                        response,
                        latency: started.elapsed(),
                        connection_id: lease.connection_id(),
                        attempts,
                    });
                }
                Ok(Err(error)) => {
                    lease.record_failure();
                    if !transport.is_connected() {
                        agent.pool().discard(&lease);
                    }
                    if may_retry(&error) {
                        debug!(
                            correlation_id = %ctx.correlation_id(),
                            agent_id = %agent.id(),
                            connection_id = lease.connection_id(),
                            error = %error,
                            "Connection failed mid-call, retrying once"
                        );
                        continue;
                    }
                    return Err(CallFailure::from_protocol(&error, started.elapsed()));
                }
                Err(_) => {
                    send_cancel(transport, ctx.correlation_id(), CancelReason::Timeout).await;
                    lease.record_failure();
                    return Err(CallFailure::new(
                        FailureKind::CallTimeout,
                        format!("no decision within {}ms", agent.definition().timeout_ms),
                        started.elapsed(),
                    ));
                }
            }
        }
    }

    fn settle(
        &self,
        agent: &AgentHandle,
        ctx: &CallContext,
        event: EventType,
        admission: Admission,
        result: Result<CallSuccess, CallFailure>,
    ) -> Result<CallSuccess, CallFailure> {
        match &result {
            Ok(success) => {
                agent.breaker().record_success();
                agent.metrics().record_success(success.latency);
                self.observe(agent, event, "success", success.latency);
                trace!(
                    correlation_id = %ctx.correlation_id(),
                    agent_id = %agent.id(),
                    event = %event,
                    decision = success.response.decision.as_str(),
                    duration_ms = success.latency.as_millis() as u64,
                    attempts = success.attempts,
                    "Agent call succeeded"
                );
            }
            Err(failure) if failure.kind == FailureKind::Cancelled => {
                if admission == Admission::Trial {
                    agent.breaker().release_trial();
                }
                agent.metrics().record_cancelled();
                self.observe(agent, event, failure.kind.as_str(), failure.elapsed);
                debug!(
                    correlation_id = %ctx.correlation_id(),
                    agent_id = %agent.id(),
                    event = %event,
                    reason = ?ctx.cancel_reason(),
                    "Agent call cancelled"
                );
            }
            Err(failure) => {
                agent.breaker().record_failure();
                agent.metrics().record_failure(failure.kind.is_timeout());
                self.observe(agent, event, failure.kind.as_str(), failure.elapsed);
                warn!(
                    correlation_id = %ctx.correlation_id(),
                    agent_id = %agent.id(),
                    event = %event,
                    kind = %failure.kind,
                    error = %failure.message,
                    duration_ms = failure.elapsed.as_millis() as u64,
                    "Agent call failed"
                );
            }
        }
        result
    }

    fn observe(&self, agent: &AgentHandle, event: EventType, outcome: &str, latency: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_call(agent.id(), event, outcome, latency);
        }
    }
}

fn cancelled(ctx: &CallContext, started: Instant) -> CallFailure {
    let reason = ctx.cancel_reason().unwrap_or(CancelReason::Manual);
    CallFailure::new(
        FailureKind::Cancelled,
        format!("cancelled: {reason}"),
        started.elapsed(),
    )
}

/// A wait for a call slot that ran into the deadline is a call timeout.
fn acquire_failure(agent: &AgentHandle, error: &AgentProtocolError, started: Instant) -> CallFailure {
    let kind = match error {
        AgentProtocolError::PoolExhausted { .. }
            if agent.definition().pool.acquire == AcquireMode::Wait =>
        {
            FailureKind::CallTimeout
        }
        other => FailureKind::from(other),
    };
    CallFailure::new(kind, error.to_string(), started.elapsed())
}

async fn send_cancel(transport: &AgentTransport, correlation_id: &CorrelationId, reason: CancelReason) {
    match tokio::time::timeout(CANCEL_SEND_TIMEOUT, transport.cancel(correlation_id, reason)).await {
        Ok(Ok(())) => trace!(correlation_id = %correlation_id, reason = %reason, "Cancel sent"),
        Ok(Err(e)) => {
            trace!(correlation_id = %correlation_id, error = %e, "Cancel not delivered")
        }
        Err(_) => trace!(correlation_id = %correlation_id, "Cancel delivery timed out"),
    }
}
