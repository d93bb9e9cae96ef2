//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use agentgate_agent_protocol::{
    AgentHandler, AgentResponse, AgentServer, BodyChunkEvent, CancelReason, CompleteEvent,
    Decision, EventContext, FrameEvent, HeaderOp, LocalStreamOptions, RequestHeadersEvent,
    RequestMetadata, ResponseHeadersEvent, TransportEndpoint,
};
use agentgate_common::CorrelationId;
use agentgate_pipeline::CallContext;

/// What a scripted agent has been asked to do so far.
#[derive(Debug, Default)]
pub struct Counters {
    pub header_calls: AtomicUsize,
    pub response_header_calls: AtomicUsize,
    pub body_chunks: AtomicUsize,
    pub body_bytes: AtomicUsize,
    pub truncated_chunks: AtomicUsize,
    pub last_chunks: AtomicUsize,
    pub frames: AtomicUsize,
    pub completes: AtomicUsize,
    pub cancels: AtomicUsize,
    /// Request header names of the latest headers event
    pub seen_request_headers: Mutex<Vec<String>>,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Agent whose answers are fixed up front.
pub struct ScriptedAgent {
    counters: Arc<Counters>,
    delay: Duration,
    decision: Decision,
    request_ops: Vec<HeaderOp>,
    response_ops: Vec<HeaderOp>,
    routing: Vec<(String, String)>,
    body_marker: Option<Vec<u8>>,
}

impl ScriptedAgent {
    pub fn allow() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            delay: Duration::ZERO,
            decision: Decision::Allow,
            request_ops: Vec::new(),
            response_ops: Vec::new(),
            routing: Vec::new(),
            body_marker: None,
        }
    }

    pub fn deciding(decision: Decision) -> Self {
        Self {
            decision,
            ..Self::allow()
        }
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Duration::from_millis(ms);
        self
    }

    pub fn with_request_header(mut self, op: HeaderOp) -> Self {
        self.request_ops.push(op);
        self
    }

    pub fn with_response_header(mut self, op: HeaderOp) -> Self {
        self.response_ops.push(op);
        self
    }

    pub fn with_routing(mut self, key: &str, value: &str) -> Self {
        self.routing.push((key.to_string(), value.to_string()));
        self
    }

    /// Block any body chunk that contains `marker`.
    pub fn blocking_body_containing(mut self, marker: &[u8]) -> Self {
        self.body_marker = Some(marker.to_vec());
        self
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    fn respond(&self, ctx: &EventContext) -> AgentResponse {
        let mut response = AgentResponse::with_decision(ctx.correlation_id.clone(), self.decision.clone());
        for op in &self.request_ops {
            response = response.add_request_header(op.clone());
        }
        for op in &self.response_ops {
            response = response.add_response_header(op.clone());
        }
        for (key, value) in &self.routing {
            response = response.with_routing_metadata(key.clone(), value.clone());
        }
        response
    }

    async fn body(&self, ctx: &EventContext, event: BodyChunkEvent) -> AgentResponse {
        self.counters.body_chunks.fetch_add(1, Ordering::SeqCst);
        self.counters
            .body_bytes
            .fetch_add(event.data.len(), Ordering::SeqCst);
        if event.truncated {
            self.counters.truncated_chunks.fetch_add(1, Ordering::SeqCst);
        }
        if event.is_last {
            self.counters.last_chunks.fetch_add(1, Ordering::SeqCst);
        }

        let blocked = self
            .body_marker
            .as_ref()
            .is_some_and(|marker| event.data.windows(marker.len()).any(|w| w == marker.as_slice()));
        if blocked {
            AgentResponse::block(ctx.correlation_id.clone(), 403, Some("body rejected".into()))
        } else {
            ctx.allow()
        }
    }
}

#[async_trait]
impl AgentHandler for ScriptedAgent {
    async fn on_request_headers(&self, ctx: &EventContext, event: RequestHeadersEvent) -> AgentResponse {
        self.counters.header_calls.fetch_add(1, Ordering::SeqCst);
        *self.counters.seen_request_headers.lock() =
            event.headers.iter().map(|h| h.name.clone()).collect();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.respond(ctx)
    }

    async fn on_response_headers(&self, ctx: &EventContext, _event: ResponseHeadersEvent) -> AgentResponse {
        self.counters
            .response_header_calls
            .fetch_add(1, Ordering::SeqCst);
        self.respond(ctx)
    }

    async fn on_request_body_chunk(&self, ctx: &EventContext, event: BodyChunkEvent) -> AgentResponse {
        self.body(ctx, event).await
    }

    async fn on_response_body_chunk(&self, ctx: &EventContext, event: BodyChunkEvent) -> AgentResponse {
        self.body(ctx, event).await
    }

    async fn on_frame(&self, ctx: &EventContext, _event: FrameEvent) -> AgentResponse {
        self.counters.frames.fetch_add(1, Ordering::SeqCst);
        self.respond(ctx)
    }

    /// Audit answers are ignored by the proxy; block to prove it.
    async fn on_complete(&self, ctx: &EventContext, _event: CompleteEvent) -> AgentResponse {
        self.counters.completes.fetch_add(1, Ordering::SeqCst);
        AgentResponse::block(ctx.correlation_id.clone(), 500, None)
    }

    async fn on_cancel(&self, _correlation_id: &CorrelationId, _reason: CancelReason) {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// A running local-stream agent.
pub struct RunningAgent {
    pub endpoint: TransportEndpoint,
    pub counters: Arc<Counters>,
    _server: JoinHandle<()>,
}

/// Serve `agent` on a socket under `dir`.
pub fn serve(dir: &Path, id: &str, agent: ScriptedAgent) -> RunningAgent {
    let socket = dir.join(format!("{id}.sock"));
    let counters = agent.counters();
    let server = AgentServer::new(id, &socket, Arc::new(agent))
        .spawn()
        .expect("agent server binds");
    RunningAgent {
        endpoint: TransportEndpoint::LocalStream(LocalStreamOptions::new(&socket)),
        counters,
        _server: server,
    }
}

pub fn ctx(route: &str) -> CallContext {
    CallContext::new(
        CorrelationId::new(),
        route,
        RequestMetadata::new("192.0.2.10", 41000),
    )
}

pub fn get(uri: &str) -> RequestHeadersEvent {
    RequestHeadersEvent {
        method: "GET".into(),
        uri: uri.into(),
        headers: vec![],
    }
}

pub fn complete(status: u16) -> CompleteEvent {
    CompleteEvent {
        status,
        duration_ms: 12,
        request_body_bytes: 0,
        response_body_bytes: 0,
        outcome: None,
        error: None,
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
