//! Event dispatch: which agents run for a phase, in what order, and how
//! their results combine.
//!
//! Header and frame phases call agents one after another in configured
//! order. Every agent is sent the event as the client produced it; their
//! mutations merge in call order and a terminal decision stops the chain. The audit-only `complete` phase calls
//! every subscribed agent concurrently, in its own cancellation scope, so a
//! blocked or abandoned request is still reported.
//!
//! Bodies go through a [`BodySession`], which slices each chunk into every
//! agent's view according to its body mode and inspection limit.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, trace};

use agentgate_agent_protocol::{
    AgentRequest, BodyChunkEvent, CancelReason, CompleteEvent, Decision, EventPayload,
    EventType, FrameEvent, RequestHeadersEvent, ResponseHeadersEvent,
};

use crate::agent::AgentHandle;
use crate::aggregator::{AggregatedOutcome, PhaseAggregator};
use crate::config::BodyMode;
use crate::context::CallContext;
use crate::executor::CallExecutor;
use crate::metrics::PipelineMetrics;
use crate::policy::{FailurePolicy, Resolution};
use crate::registry::{AgentRegistry, RegistrySnapshot};

/// Drives agent calls for every lifecycle phase of a request.
#[derive(Debug)]
pub struct EventDispatcher {
    registry: Arc<AgentRegistry>,
    executor: CallExecutor,
    policy: FailurePolicy,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl EventDispatcher {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            executor: CallExecutor::new(),
            policy: FailurePolicy,
            metrics: None,
        }
    }

    pub fn with_metrics(registry: Arc<AgentRegistry>, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            registry,
            executor: CallExecutor::with_metrics(Arc::clone(&metrics)),
            policy: FailurePolicy,
            metrics: Some(metrics),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Agents subscribed to `event` on `route_id`, in invocation order.
    pub fn agents_for(&self, route_id: &str, event: EventType) -> Vec<Arc<AgentHandle>> {
        self.registry.snapshot().agents_for(route_id, event)
    }

    pub async fn request_headers(
        &self,
        ctx: &CallContext,
        event: RequestHeadersEvent,
    ) -> AggregatedOutcome {
        self.run_sequential(ctx, EventPayload::RequestHeaders(event))
            .await
    }

    pub async fn response_headers(
        &self,
        ctx: &CallContext,
        event: ResponseHeadersEvent,
    ) -> AggregatedOutcome {
        self.run_sequential(ctx, EventPayload::ResponseHeaders(event))
            .await
    }

    pub async fn frame(&self, ctx: &CallContext, event: FrameEvent) -> AggregatedOutcome {
        self.run_sequential(ctx, EventPayload::Frame(event)).await
    }

    /// Report the finished exchange to every subscribed agent. Decisions
    /// are recorded but never applied.
    pub async fn complete(&self, ctx: &CallContext, event: CompleteEvent) -> AggregatedOutcome {
        let snapshot = self.registry.snapshot();
        let agents = snapshot.agents_for(ctx.route_id(), EventType::Complete);
        if agents.is_empty() {
            return AggregatedOutcome::allow(EventType::Complete);
        }

        let audit_ctx = ctx.detached();
        let request = AgentRequest::new(
            audit_ctx.correlation_id().clone(),
            audit_ctx.metadata().clone(),
            EventPayload::Complete(event),
        );
        let requests = std::slice::from_ref(&request);

        let results = join_all(agents.iter().map(|agent| {
            let audit_ctx = &audit_ctx;
            async move { self.executor.execute(agent, audit_ctx, requests).await }
        }))
        .await;

        let mut aggregator = PhaseAggregator::new(EventType::Complete);
        for (agent, result) in agents.iter().zip(results) {
            match result {
                Ok(success) => aggregator.record_response(
                    agent.id(),
                    success.response,
                    success.latency,
                    false,
                ),
                Err(failure) => aggregator.record_failure(
                    agent.id(),
                    &failure,
                    Resolution {
                        decision: Decision::Allow,
                        mode: agent.failure_mode(),
                    },
                    false,
                ),
            }
        }

        let outcome = aggregator.finish();
        self.record_phase(ctx, &outcome);
        outcome
    }

    /// Start inspecting the request body.
    pub fn request_body<'a>(&'a self, ctx: &'a CallContext) -> BodySession<'a> {
        BodySession::new(self, ctx, EventType::RequestBodyChunk)
    }

    /// Start inspecting the response body.
    pub fn response_body<'a>(&'a self, ctx: &'a CallContext) -> BodySession<'a> {
        BodySession::new(self, ctx, EventType::ResponseBodyChunk)
    }

    async fn run_sequential(&self, ctx: &CallContext, payload: EventPayload) -> AggregatedOutcome {
        let event = payload.event_type();
        let snapshot = self.registry.snapshot();
        let agents = snapshot.agents_for(ctx.route_id(), event);

        if agents.is_empty() {
            trace!(
                correlation_id = %ctx.correlation_id(),
                route_id = %ctx.route_id(),
                event = %event,
                "No agents for phase, allowing"
            );
            return AggregatedOutcome::allow(event);
        }

        debug!(
            correlation_id = %ctx.correlation_id(),
            event = %event,
            agent_ids = ?agents.iter().map(|a| a.id()).collect::<Vec<_>>(),
            "Dispatching phase to agents"
        );

        let request = AgentRequest::new(ctx.correlation_id().clone(), ctx.metadata().clone(), payload);
        let mut aggregator = PhaseAggregator::new(event);

        for agent in &agents {
            if aggregator.is_terminal() {
                aggregator.record_short_circuit(agent.id());
                continue;
            }
            self.invoke(agent, ctx, std::slice::from_ref(&request), &mut aggregator, false)
                .await;
            if aggregator.is_terminal() {
                debug!(
                    correlation_id = %ctx.correlation_id(),
                    agent_id = %agent.id(),
                    event = %event,
                    "Agent returned terminal decision, stopping agent chain"
                );
                ctx.cancel(CancelReason::BlockedByAgent);
            }
        }

        let outcome = aggregator.finish();
        self.record_phase(ctx, &outcome);
        outcome
    }

    /// Call one agent and record the result. Returns whether it answered.
    async fn invoke(
        &self,
        agent: &AgentHandle,
        ctx: &CallContext,
        requests: &[AgentRequest],
        aggregator: &mut PhaseAggregator,
        truncated: bool,
    ) -> bool {
        match self.executor.execute(agent, ctx, requests).await {
            Ok(success) => {
                aggregator.record_response(agent.id(), success.response, success.latency, truncated);
                true
            }
            Err(failure) => {
                let resolution = self
                    .policy
                    .resolve(agent.definition(), ctx.correlation_id(), &failure);
                aggregator.record_failure(agent.id(), &failure, resolution, truncated);
                false
            }
        }
    }

    fn record_phase(&self, ctx: &CallContext, outcome: &AggregatedOutcome) {
        if let Some(metrics) = &self.metrics {
            metrics.record_phase(outcome.event, outcome.decision.as_str());
        }
        trace!(
            correlation_id = %ctx.correlation_id(),
            event = %outcome.event,
            decision = outcome.decision.as_str(),
            decided_by = ?outcome.decided_by,
            agents = %outcome.audit_summary(),
            "Phase complete"
        );
    }

    fn record_truncation(&self, agent_id: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_truncation(agent_id);
        }
    }
}

/// What the proxy does with a body chunk it just pushed.
#[derive(Debug, Clone, PartialEq)]
pub enum BodyStep {
    /// Keep the chunk; an agent is still buffering
    Hold,
    /// Forward everything held so far, then this chunk
    Forward(AggregatedOutcome),
    /// Do not forward; answer the client per the outcome's decision
    Reject(AggregatedOutcome),
}

/// Body inspection for one direction of one request.
///
/// Each agent sees a prefix of the body no longer than its limit, as chunks
/// with a monotonic index. The chunk that reaches the limit is cut short and
/// marked `is_last` and `truncated`; bytes past it are forwarded without
/// inspection. An agent that fails stops receiving chunks.
pub struct BodySession<'a> {
    dispatcher: &'a EventDispatcher,
    ctx: &'a CallContext,
    event: EventType,
    _snapshot: Arc<RegistrySnapshot>,
    agents: Vec<BodyAgent>,
    pending: PhaseAggregator,
    bytes_seen: u64,
    finished: bool,
    rejected: Option<AggregatedOutcome>,
}

impl<'a> BodySession<'a> {
    fn new(dispatcher: &'a EventDispatcher, ctx: &'a CallContext, event: EventType) -> Self {
        let snapshot = dispatcher.registry.snapshot();
        let agents = snapshot
            .agents_for(ctx.route_id(), event)
            .into_iter()
            .map(|handle| BodyAgent::new(handle, event))
            .collect::<Vec<_>>();

        trace!(
            correlation_id = %ctx.correlation_id(),
            event = %event,
            agents = agents.len(),
            "Body session started"
        );

        Self {
            dispatcher,
            ctx,
            event,
            _snapshot: snapshot,
            agents,
            pending: PhaseAggregator::new(event),
            bytes_seen: 0,
            finished: false,
            rejected: None,
        }
    }

    pub fn event(&self) -> EventType {
        self.event
    }

    /// Total body bytes pushed so far.
    pub fn bytes_seen(&self) -> u64 {
        self.bytes_seen
    }

    /// Whether any agent's view stopped at its limit.
    pub fn truncated(&self) -> bool {
        self.agents.iter().any(|a| a.truncated)
    }

    /// Push the next chunk of the body, in order.
    pub async fn push(&mut self, data: &[u8], is_last: bool) -> BodyStep {
        if let Some(rejected) = &self.rejected {
            return BodyStep::Reject(rejected.clone());
        }
        if self.finished {
            return BodyStep::Forward(AggregatedOutcome::allow(self.event));
        }

        self.bytes_seen += data.len() as u64;

        for i in 0..self.agents.len() {
            let chunks = self.agents[i].accept(data, is_last, self.bytes_seen);
            if chunks.is_empty() {
                continue;
            }

            let handle = Arc::clone(&self.agents[i].handle);
            let truncated = chunks.last().is_some_and(|c| c.truncated);
            let requests: Vec<AgentRequest> = chunks
                .into_iter()
                .map(|chunk| {
                    AgentRequest::new(
                        self.ctx.correlation_id().clone(),
                        self.ctx.metadata().clone(),
                        self.payload(chunk),
                    )
                })
                .collect();

            if truncated {
                debug!(
                    correlation_id = %self.ctx.correlation_id(),
                    agent_id = %handle.id(),
                    limit = self.agents[i].limit,
                    bytes_seen = self.bytes_seen,
                    "Body exceeds inspection limit, forwarding remainder unexamined"
                );
                self.dispatcher.record_truncation(handle.id());
            }

            let answered = self
                .dispatcher
                .invoke(&handle, self.ctx, &requests, &mut self.pending, truncated)
                .await;
            if !answered {
                self.agents[i].stop();
            }

            if self.pending.is_terminal() {
                for later in &self.agents[i + 1..] {
                    if !later.done {
                        self.pending.record_short_circuit(later.handle.id());
                    }
                }
                self.ctx.cancel(CancelReason::BlockedByAgent);

                let outcome =
                    std::mem::replace(&mut self.pending, PhaseAggregator::new(self.event)).finish();
                self.dispatcher.record_phase(self.ctx, &outcome);
                self.rejected = Some(outcome.clone());
                return BodyStep::Reject(outcome);
            }
        }

        if is_last {
            self.finished = true;
        }
        if self.agents.iter().any(BodyAgent::holding) {
            return BodyStep::Hold;
        }

        let outcome = std::mem::replace(&mut self.pending, PhaseAggregator::new(self.event)).finish();
        if !outcome.agents.is_empty() {
            self.dispatcher.record_phase(self.ctx, &outcome);
        }
        BodyStep::Forward(outcome)
    }

    fn payload(&self, chunk: BodyChunkEvent) -> EventPayload {
        match self.event {
            EventType::ResponseBodyChunk => EventPayload::ResponseBodyChunk(chunk),
            _ => EventPayload::RequestBodyChunk(chunk),
        }
    }
}

/// One agent's view of a body.
struct BodyAgent {
    handle: Arc<AgentHandle>,
    mode: BodyMode,
    limit: usize,
    inspected: usize,
    next_index: u64,
    buffered: Vec<BodyChunkEvent>,
    buffered_bytes: usize,
    /// Hybrid agents switch to streaming once the threshold is crossed
    streaming: bool,
    /// No further chunks go to this agent
    done: bool,
    truncated: bool,
}

impl BodyAgent {
    fn new(handle: Arc<AgentHandle>, event: EventType) -> Self {
        let (mode, limit) = handle.definition().body_policy(event);
        Self {
            handle,
            mode,
            limit,
            inspected: 0,
            next_index: 0,
            buffered: Vec::new(),
            buffered_bytes: 0,
            streaming: matches!(mode, BodyMode::Stream),
            done: false,
            truncated: false,
        }
    }

    /// Take this agent's slice of the next chunk. Returns the chunks to
    /// deliver now, empty while buffering.
    fn accept(&mut self, data: &[u8], is_last: bool, bytes_seen: u64) -> Vec<BodyChunkEvent> {
        if self.done {
            return Vec::new();
        }

        let take = data.len().min(self.limit.saturating_sub(self.inspected));
        let truncated = take < data.len();
        let last = is_last || truncated;
        if take == 0 && !last {
            return Vec::new();
        }

        let chunk = BodyChunkEvent {
            chunk_index: self.next_index,
            is_last: last,
            truncated,
            bytes_seen,
            data: data[..take].to_vec(),
        };
        self.next_index += 1;
        self.inspected += take;
        self.truncated |= truncated;
        self.done = last;

        if self.streaming {
            return vec![chunk];
        }

        self.buffered.push(chunk);
        self.buffered_bytes += take;
        let flush = match self.mode {
            BodyMode::Hybrid { buffer_threshold } => last || self.buffered_bytes >= buffer_threshold,
            _ => last,
        };
        if flush {
            self.streaming = !last && matches!(self.mode, BodyMode::Hybrid { .. });
            self.buffered_bytes = 0;
            std::mem::take(&mut self.buffered)
        } else {
            Vec::new()
        }
    }

    fn holding(&self) -> bool {
        !self.buffered.is_empty()
    }

    fn stop(&mut self) {
        self.done = true;
        self.buffered.clear();
        self.buffered_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentDefinition, PipelineConfig, RouteConfig};
    use crate::metrics::AgentMetrics;
    use agentgate_agent_protocol::{AgentPool, RequestMetadata, TransportEndpoint};
    use agentgate_common::{CircuitBreaker, CorrelationId};

    fn body_agent(mode: BodyMode, limit: usize) -> BodyAgent {
        let definition = AgentDefinition::new("inspect", TransportEndpoint::Reverse)
            .with_events([EventType::RequestBodyChunk])
            .with_request_body(mode, limit);
        let handle = AgentHandle::new(
            definition.clone(),
            Arc::new(AgentPool::new("inspect", TransportEndpoint::Reverse, definition.pool.clone())),
            Arc::new(CircuitBreaker::new(definition.circuit_breaker.clone())),
            Arc::new(AgentMetrics::new()),
        );
        BodyAgent::new(Arc::new(handle), EventType::RequestBodyChunk)
    }

    fn sizes(chunks: &[BodyChunkEvent]) -> Vec<usize> {
        chunks.iter().map(|c| c.data.len()).collect()
    }

    #[test]
    fn test_stream_mode_delivers_each_chunk_with_monotonic_index() {
        let mut agent = body_agent(BodyMode::Stream, 100);

        let first = agent.accept(&[1; 10], false, 10);
        let second = agent.accept(&[2; 10], true, 20);

        assert_eq!(first[0].chunk_index, 0);
        assert_eq!(second[0].chunk_index, 1);
        assert!(second[0].is_last);
        assert!(!second[0].truncated);
        assert_eq!(second[0].bytes_seen, 20);
        assert!(agent.accept(&[3; 10], true, 30).is_empty());
    }

    #[test]
    fn test_stream_mode_cuts_at_limit() {
        let mut agent = body_agent(BodyMode::Stream, 15);

        assert_eq!(sizes(&agent.accept(&[0; 10], false, 10)), [10]);
        let cut = agent.accept(&[0; 10], false, 20);
        assert_eq!(sizes(&cut), [5]);
        assert!(cut[0].is_last && cut[0].truncated);
        assert!(agent.truncated);
        assert!(agent.accept(&[0; 10], false, 30).is_empty());
    }

    #[test]
    fn test_buffer_mode_holds_until_end() {
        let mut agent = body_agent(BodyMode::Buffer, 100);

        assert!(agent.accept(&[0; 10], false, 10).is_empty());
        assert!(agent.holding());
        assert!(agent.accept(&[0; 10], false, 20).is_empty());

        let flushed = agent.accept(&[0; 5], true, 25);
        assert_eq!(sizes(&flushed), [10, 10, 5]);
        assert_eq!(
            flushed.iter().map(|c| c.chunk_index).collect::<Vec<_>>(),
            [0, 1, 2]
        );
        assert!(flushed[2].is_last && !flushed[2].truncated);
        assert!(!agent.holding());
    }

    #[test]
    fn test_buffer_mode_exact_limit_then_more() {
        let mut agent = body_agent(BodyMode::Buffer, 20);

        assert!(agent.accept(&[0; 20], false, 20).is_empty());
        let flushed = agent.accept(&[0; 7], false, 27);
        assert_eq!(sizes(&flushed), [20, 0]);
        assert!(flushed[1].truncated && flushed[1].is_last);
    }

    #[test]
    fn test_hybrid_mode_switches_to_streaming() {
        let mut agent = body_agent(BodyMode::Hybrid { buffer_threshold: 15 }, 100);

        assert!(agent.accept(&[0; 10], false, 10).is_empty());
        assert_eq!(sizes(&agent.accept(&[0; 10], false, 20)), [10, 10]);
        assert_eq!(sizes(&agent.accept(&[0; 10], false, 30)), [10]);
        let last = agent.accept(&[0; 3], true, 33);
        assert_eq!(last[0].chunk_index, 3);
        assert!(last[0].is_last);
    }

    #[test]
    fn test_hybrid_small_body_is_sent_whole() {
        let mut agent = body_agent(BodyMode::Hybrid { buffer_threshold: 64 }, 100);
        assert!(agent.accept(&[0; 10], false, 10).is_empty());
        assert_eq!(sizes(&agent.accept(&[0; 10], true, 20)), [10, 10]);
    }

    #[test]
    fn test_empty_intermediate_chunk_is_skipped() {
        let mut agent = body_agent(BodyMode::Stream, 100);
        assert!(agent.accept(&[], false, 0).is_empty());
        let last = agent.accept(&[], true, 0);
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].chunk_index, 0);
    }

    #[tokio::test]
    async fn test_phase_without_agents_allows() {
        let registry = Arc::new(
            AgentRegistry::new(PipelineConfig::new(
                vec![AgentDefinition::new("edge", TransportEndpoint::Reverse)
                    .with_events([EventType::ResponseHeaders])],
                vec![RouteConfig::new("api", ["edge"])],
            ))
            .unwrap(),
        );
        let dispatcher = EventDispatcher::new(registry);
        let ctx = CallContext::new(
            CorrelationId::new(),
            "api",
            RequestMetadata::new("127.0.0.1", 1),
        );

        let outcome = dispatcher
            .request_headers(
                &ctx,
                RequestHeadersEvent {
                    method: "GET".into(),
                    uri: "/".into(),
                    headers: vec![],
                },
            )
            .await;
        assert!(outcome.is_allow());
        assert!(outcome.agents.is_empty());

        let mut body = dispatcher.request_body(&ctx);
        match body.push(b"hello", true).await {
            BodyStep::Forward(outcome) => assert!(outcome.agents.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reverse_agent_without_connection_fails_closed() {
        let registry = Arc::new(
            AgentRegistry::new(PipelineConfig::new(
                vec![AgentDefinition::new("edge", TransportEndpoint::Reverse)
                    .with_fail_closed(502, None)],
                vec![RouteConfig::new("api", ["edge"])],
            ))
            .unwrap(),
        );
        let dispatcher = EventDispatcher::new(registry);
        let ctx = CallContext::new(
            CorrelationId::new(),
            "api",
            RequestMetadata::new("127.0.0.1", 1),
        );

        let outcome = dispatcher
            .request_headers(
                &ctx,
                RequestHeadersEvent {
                    method: "GET".into(),
                    uri: "/".into(),
                    headers: vec![],
                },
            )
            .await;

        assert_eq!(outcome.decision, Decision::block(502));
        assert_eq!(outcome.decided_by.as_deref(), Some("edge"));
        assert_eq!(ctx.cancel_reason(), Some(CancelReason::BlockedByAgent));
    }
}
