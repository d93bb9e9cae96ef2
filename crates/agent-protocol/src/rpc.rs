//! Remote RPC transport: one bidirectional gRPC stream per connection.
//!
//! The service exposes a single streaming method,
//! `/agentgate.v2.AgentProcessor/Process`. The proxy sends [`ProxyMessage`]s
//! (handshake, events, cancels, pings) and the agent answers with
//! [`AgentMessage`]s. Each event call is answered by exactly one terminal
//! `Decision`, optionally preceded by `BodyChunk` messages carrying
//! replacement body bytes for that call.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Endpoint;
use tracing::{debug, error, info, trace, warn};

use agentgate_common::CorrelationId;

use crate::errors::AgentProtocolError;
use crate::pending::PendingCalls;
use crate::protocol::{
    now_ms, AgentRequest, AgentResponse, AuditMetadata, BodyChunkEvent, CancelReason,
    CompleteEvent, Decision, EventPayload, EventType, FrameEvent, Header, HeaderOp,
    RequestHeadersEvent, RequestMetadata, ResponseHeadersEvent, DEFAULT_MAX_MESSAGE_BYTES,
    PROTOCOL_VERSION,
};
use crate::session::CHANNEL_BUFFER_SIZE;

/// Fully-qualified path of the streaming method.
pub const PROCESS_PATH: &str = "/agentgate.v2.AgentProcessor/Process";

/// Protobuf messages of the RPC binding.
pub mod wire {
    use std::collections::BTreeMap;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct ProxyMessage {
        #[prost(oneof = "proxy_message::Kind", tags = "1, 2, 3, 4")]
        pub kind: Option<proxy_message::Kind>,
    }

    pub mod proxy_message {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            Handshake(super::RpcHandshake),
            #[prost(message, tag = "2")]
            Event(super::RpcEvent),
            #[prost(message, tag = "3")]
            Cancel(super::RpcCancel),
            #[prost(message, tag = "4")]
            Ping(super::RpcPing),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct AgentMessage {
        #[prost(oneof = "agent_message::Kind", tags = "1, 2, 3, 4, 5")]
        pub kind: Option<agent_message::Kind>,
    }

    pub mod agent_message {
        #[derive(Clone, PartialEq, prost::Oneof)]
        pub enum Kind {
            #[prost(message, tag = "1")]
            HandshakeAck(super::RpcHandshakeAck),
            #[prost(message, tag = "2")]
            Decision(super::RpcDecision),
            #[prost(message, tag = "3")]
            BodyChunk(super::RpcBodyChunk),
            #[prost(message, tag = "4")]
            Pong(super::RpcPing),
            #[prost(message, tag = "5")]
            CallError(super::RpcCallError),
        }
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcHandshake {
        #[prost(uint32, tag = "1")]
        pub protocol_version: u32,
        #[prost(string, tag = "2")]
        pub agent_id: String,
        #[prost(string, tag = "3")]
        pub client_name: String,
        #[prost(string, tag = "4")]
        pub client_version: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcHandshakeAck {
        #[prost(bool, tag = "1")]
        pub accepted: bool,
        #[prost(uint32, tag = "2")]
        pub protocol_version: u32,
        #[prost(string, tag = "3")]
        pub agent_id: String,
        #[prost(string, tag = "4")]
        pub agent_name: String,
        #[prost(int32, repeated, tag = "5")]
        pub supported_events: Vec<i32>,
        #[prost(string, optional, tag = "6")]
        pub error: Option<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcHeader {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcMetadata {
        #[prost(string, tag = "1")]
        pub client_ip: String,
        #[prost(uint32, tag = "2")]
        pub client_port: u32,
        #[prost(string, optional, tag = "3")]
        pub server_name: Option<String>,
        #[prost(string, tag = "4")]
        pub protocol: String,
        #[prost(string, optional, tag = "5")]
        pub route_id: Option<String>,
        #[prost(string, optional, tag = "6")]
        pub upstream_id: Option<String>,
        #[prost(string, tag = "7")]
        pub timestamp: String,
    }

    /// One request message: the phase plus its headers, body chunk, frame,
    /// or completion summary. `more_follows` marks a message that is part of
    /// a sequence answered by a single decision.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcEvent {
        #[prost(uint64, tag = "1")]
        pub call_id: u64,
        #[prost(string, tag = "2")]
        pub correlation_id: String,
        #[prost(int32, tag = "3")]
        pub event_type: i32,
        #[prost(message, optional, tag = "4")]
        pub metadata: Option<RpcMetadata>,
        #[prost(string, tag = "5")]
        pub method: String,
        #[prost(string, tag = "6")]
        pub uri: String,
        #[prost(uint32, tag = "7")]
        pub status: u32,
        #[prost(message, repeated, tag = "8")]
        pub headers: Vec<RpcHeader>,
        #[prost(bytes = "vec", tag = "9")]
        pub body: Vec<u8>,
        #[prost(uint64, tag = "10")]
        pub chunk_index: u64,
        #[prost(bool, tag = "11")]
        pub is_last: bool,
        #[prost(bool, tag = "12")]
        pub truncated: bool,
        #[prost(uint64, tag = "13")]
        pub bytes_seen: u64,
        #[prost(uint32, tag = "14")]
        pub opcode: u32,
        #[prost(bool, tag = "15")]
        pub client_to_server: bool,
        #[prost(uint64, tag = "16")]
        pub duration_ms: u64,
        #[prost(uint64, tag = "17")]
        pub request_body_bytes: u64,
        #[prost(uint64, tag = "18")]
        pub response_body_bytes: u64,
        #[prost(string, optional, tag = "19")]
        pub outcome: Option<String>,
        #[prost(string, optional, tag = "20")]
        pub error: Option<String>,
        #[prost(bool, tag = "21")]
        pub more_follows: bool,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcHeaderOp {
        /// 1 = set, 2 = add, 3 = remove
        #[prost(int32, tag = "1")]
        pub op: i32,
        #[prost(string, tag = "2")]
        pub name: String,
        #[prost(string, tag = "3")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcAudit {
        #[prost(string, repeated, tag = "1")]
        pub tags: Vec<String>,
        #[prost(string, repeated, tag = "2")]
        pub rule_ids: Vec<String>,
        #[prost(float, optional, tag = "3")]
        pub confidence: Option<f32>,
        #[prost(string, repeated, tag = "4")]
        pub reason_codes: Vec<String>,
        #[prost(btree_map = "string, string", tag = "5")]
        pub custom: BTreeMap<String, String>,
    }

    /// Terminal response for one call.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcDecision {
        #[prost(uint64, tag = "1")]
        pub call_id: u64,
        #[prost(string, tag = "2")]
        pub correlation_id: String,
        /// 1 = allow, 2 = block, 3 = redirect, 4 = challenge
        #[prost(int32, tag = "3")]
        pub kind: i32,
        #[prost(uint32, tag = "4")]
        pub status: u32,
        #[prost(string, optional, tag = "5")]
        pub body: Option<String>,
        #[prost(string, tag = "6")]
        pub location: String,
        #[prost(string, tag = "7")]
        pub challenge_type: String,
        #[prost(btree_map = "string, string", tag = "8")]
        pub params: BTreeMap<String, String>,
        #[prost(message, repeated, tag = "9")]
        pub block_headers: Vec<RpcHeader>,
        #[prost(message, repeated, tag = "10")]
        pub request_headers: Vec<RpcHeaderOp>,
        #[prost(message, repeated, tag = "11")]
        pub response_headers: Vec<RpcHeaderOp>,
        #[prost(btree_map = "string, string", tag = "12")]
        pub routing_metadata: BTreeMap<String, String>,
        #[prost(message, optional, tag = "13")]
        pub audit: Option<RpcAudit>,
    }

    /// Replacement body bytes streamed ahead of a call's decision.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcBodyChunk {
        #[prost(uint64, tag = "1")]
        pub call_id: u64,
        #[prost(bytes = "vec", tag = "2")]
        pub data: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcCallError {
        #[prost(uint64, tag = "1")]
        pub call_id: u64,
        #[prost(string, tag = "2")]
        pub message: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcCancel {
        #[prost(string, tag = "1")]
        pub correlation_id: String,
        #[prost(int32, tag = "2")]
        pub reason: i32,
        #[prost(uint64, tag = "3")]
        pub timestamp_ms: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct RpcPing {
        #[prost(uint64, tag = "1")]
        pub nonce: u64,
    }
}

use wire::{agent_message, proxy_message, AgentMessage, ProxyMessage};

// ============================================================================
// Conversions
// ============================================================================

fn headers_to_wire(headers: &[Header]) -> Vec<wire::RpcHeader> {
    headers
        .iter()
        .map(|h| wire::RpcHeader {
            name: h.name.clone(),
            value: h.value.clone(),
        })
        .collect()
}

fn headers_from_wire(headers: Vec<wire::RpcHeader>) -> Vec<Header> {
    headers
        .into_iter()
        .map(|h| Header {
            name: h.name,
            value: h.value,
        })
        .collect()
}

fn metadata_to_wire(metadata: &RequestMetadata) -> wire::RpcMetadata {
    wire::RpcMetadata {
        client_ip: metadata.client_ip.clone(),
        client_port: metadata.client_port as u32,
        server_name: metadata.server_name.clone(),
        protocol: metadata.protocol.clone(),
        route_id: metadata.route_id.clone(),
        upstream_id: metadata.upstream_id.clone(),
        timestamp: metadata.timestamp.clone(),
    }
}

fn metadata_from_wire(metadata: wire::RpcMetadata) -> RequestMetadata {
    RequestMetadata {
        client_ip: metadata.client_ip,
        client_port: u16::try_from(metadata.client_port).unwrap_or_default(),
        server_name: metadata.server_name,
        protocol: metadata.protocol,
        route_id: metadata.route_id,
        upstream_id: metadata.upstream_id,
        timestamp: metadata.timestamp,
    }
}

/// Build the request message for one event.
pub fn request_to_wire(call_id: u64, request: &AgentRequest, more_follows: bool) -> wire::RpcEvent {
    let mut event = wire::RpcEvent {
        call_id,
        correlation_id: request.correlation_id.to_string(),
        event_type: request.event_type().to_wire(),
        metadata: Some(metadata_to_wire(&request.metadata)),
        more_follows,
        ..Default::default()
    };

    match &request.event {
        EventPayload::RequestHeaders(e) => {
            event.method = e.method.clone();
            event.uri = e.uri.clone();
            event.headers = headers_to_wire(&e.headers);
        }
        EventPayload::ResponseHeaders(e) => {
            event.status = e.status as u32;
            event.headers = headers_to_wire(&e.headers);
        }
        EventPayload::RequestBodyChunk(c) | EventPayload::ResponseBodyChunk(c) => {
            event.body = c.data.clone();
            event.chunk_index = c.chunk_index;
            event.is_last = c.is_last;
            event.truncated = c.truncated;
            event.bytes_seen = c.bytes_seen;
        }
        EventPayload::Frame(f) => {
            event.body = f.data.clone();
            event.opcode = f.opcode as u32;
            event.client_to_server = f.client_to_server;
            event.chunk_index = f.frame_index;
        }
        EventPayload::Complete(c) => {
            event.status = c.status as u32;
            event.duration_ms = c.duration_ms;
            event.request_body_bytes = c.request_body_bytes;
            event.response_body_bytes = c.response_body_bytes;
            event.outcome = c.outcome.clone();
            event.error = c.error.clone();
        }
    }
    event
}

/// Decode a request message (agent side, and for tests).
pub fn request_from_wire(event: wire::RpcEvent) -> Result<(u64, AgentRequest), AgentProtocolError> {
    let event_type = EventType::from_wire(event.event_type).ok_or_else(|| {
        AgentProtocolError::InvalidMessage(format!("Unknown event type {}", event.event_type))
    })?;
    let status = u16::try_from(event.status)
        .map_err(|_| AgentProtocolError::InvalidMessage(format!("Bad status {}", event.status)))?;

    let chunk = |data: Vec<u8>| BodyChunkEvent {
        chunk_index: event.chunk_index,
        is_last: event.is_last,
        truncated: event.truncated,
        bytes_seen: event.bytes_seen,
        data,
    };

    let payload = match event_type {
        EventType::RequestHeaders => EventPayload::RequestHeaders(RequestHeadersEvent {
            method: event.method,
            uri: event.uri,
            headers: headers_from_wire(event.headers),
        }),
        EventType::ResponseHeaders => EventPayload::ResponseHeaders(ResponseHeadersEvent {
            status,
            headers: headers_from_wire(event.headers),
        }),
        EventType::RequestBodyChunk => EventPayload::RequestBodyChunk(chunk(event.body)),
        EventType::ResponseBodyChunk => EventPayload::ResponseBodyChunk(chunk(event.body)),
        EventType::Frame => EventPayload::Frame(FrameEvent {
            opcode: u8::try_from(event.opcode).unwrap_or_default(),
            client_to_server: event.client_to_server,
            frame_index: event.chunk_index,
            data: event.body,
        }),
        EventType::Complete => EventPayload::Complete(CompleteEvent {
            status,
            duration_ms: event.duration_ms,
            request_body_bytes: event.request_body_bytes,
            response_body_bytes: event.response_body_bytes,
            outcome: event.outcome,
            error: event.error,
        }),
    };

    let metadata = event.metadata.map(metadata_from_wire).unwrap_or_default();
    Ok((
        event.call_id,
        AgentRequest::new(CorrelationId::from(event.correlation_id), metadata, payload),
    ))
}

fn header_op_to_wire(op: &HeaderOp) -> wire::RpcHeaderOp {
    match op {
        HeaderOp::Set { name, value } => wire::RpcHeaderOp {
            op: 1,
            name: name.clone(),
            value: value.clone(),
        },
        HeaderOp::Add { name, value } => wire::RpcHeaderOp {
            op: 2,
            name: name.clone(),
            value: value.clone(),
        },
        HeaderOp::Remove { name } => wire::RpcHeaderOp {
            op: 3,
            name: name.clone(),
            value: String::new(),
        },
    }
}

fn header_op_from_wire(op: wire::RpcHeaderOp) -> Result<HeaderOp, AgentProtocolError> {
    match op.op {
        1 => Ok(HeaderOp::Set {
            name: op.name,
            value: op.value,
        }),
        2 => Ok(HeaderOp::Add {
            name: op.name,
            value: op.value,
        }),
        3 => Ok(HeaderOp::Remove { name: op.name }),
        other => Err(AgentProtocolError::InvalidMessage(format!(
            "Unknown header op {}",
            other
        ))),
    }
}

/// Build the terminal response message (agent side, and for tests).
pub fn response_to_wire(call_id: u64, response: &AgentResponse) -> wire::RpcDecision {
    let mut decision = wire::RpcDecision {
        call_id,
        correlation_id: response.correlation_id.to_string(),
        request_headers: response.request_headers.iter().map(header_op_to_wire).collect(),
        response_headers: response.response_headers.iter().map(header_op_to_wire).collect(),
        routing_metadata: response.routing_metadata.clone(),
        audit: (!response.audit.is_empty()).then(|| wire::RpcAudit {
            tags: response.audit.tags.clone(),
            rule_ids: response.audit.rule_ids.clone(),
            confidence: response.audit.confidence,
            reason_codes: response.audit.reason_codes.clone(),
            custom: response.audit.custom.clone(),
        }),
        ..Default::default()
    };

    match &response.decision {
        Decision::Allow => decision.kind = 1,
        Decision::Block {
            status,
            body,
            headers,
        } => {
            decision.kind = 2;
            decision.status = *status as u32;
            decision.body = body.clone();
            decision.block_headers = headers_to_wire(headers);
        }
        Decision::Redirect { location, status } => {
            decision.kind = 3;
            decision.status = *status as u32;
            decision.location = location.clone();
        }
        Decision::Challenge {
            challenge_type,
            params,
        } => {
            decision.kind = 4;
            decision.challenge_type = challenge_type.clone();
            decision.params = params.clone();
        }
    }
    decision
}

/// Decode a terminal response message.
pub fn response_from_wire(
    decision: wire::RpcDecision,
    body_replacement: Option<Vec<u8>>,
) -> Result<AgentResponse, AgentProtocolError> {
    let status = u16::try_from(decision.status).map_err(|_| {
        AgentProtocolError::InvalidMessage(format!("Bad status {}", decision.status))
    })?;

    let verdict = match decision.kind {
        1 => Decision::Allow,
        2 => Decision::Block {
            status,
            body: decision.body,
            headers: headers_from_wire(decision.block_headers),
        },
        3 => Decision::Redirect {
            location: decision.location,
            status,
        },
        4 => Decision::Challenge {
            challenge_type: decision.challenge_type,
            params: decision.params,
        },
        other => {
            return Err(AgentProtocolError::InvalidMessage(format!(
                "Unknown decision kind {}",
                other
            )))
        }
    };

    let audit = decision
        .audit
        .map(|a| AuditMetadata {
            tags: a.tags,
            rule_ids: a.rule_ids,
            confidence: a.confidence,
            reason_codes: a.reason_codes,
            custom: a.custom,
        })
        .unwrap_or_default();

    Ok(AgentResponse {
        version: PROTOCOL_VERSION,
        correlation_id: CorrelationId::from(decision.correlation_id),
        decision: verdict,
        request_headers: decision
            .request_headers
            .into_iter()
            .map(header_op_from_wire)
            .collect::<Result<_, _>>()?,
        response_headers: decision
            .response_headers
            .into_iter()
            .map(header_op_from_wire)
            .collect::<Result<_, _>>()?,
        routing_metadata: decision.routing_metadata,
        audit,
        body_replacement,
    })
}

// ============================================================================
// Session
// ============================================================================

/// Connection options for an RPC agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOptions {
    /// e.g. `http://10.0.0.5:50051`
    pub endpoint: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl RpcOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_message_bytes: default_max_message_bytes(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// One established gRPC stream to an agent.
pub struct RpcSession {
    agent_id: String,
    endpoint: String,
    max_message_bytes: usize,
    outbound: mpsc::Sender<ProxyMessage>,
    pending: Arc<PendingCalls>,
    pings: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>,
    next_nonce: AtomicU64,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl RpcSession {
    /// Open the channel and stream and complete the handshake.
    pub async fn connect(agent_id: &str, options: &RpcOptions) -> Result<Self, AgentProtocolError> {
        let timeout = options.connect_timeout();
        match tokio::time::timeout(timeout, Self::connect_inner(agent_id, options)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    agent_id = %agent_id,
                    endpoint = %options.endpoint,
                    timeout_ms = options.connect_timeout_ms,
                    "Timed out connecting to agent"
                );
                Err(AgentProtocolError::ConnectTimeout(timeout))
            }
        }
    }

    async fn connect_inner(agent_id: &str, options: &RpcOptions) -> Result<Self, AgentProtocolError> {
        debug!(agent_id = %agent_id, endpoint = %options.endpoint, "Connecting to agent via RPC");

        let channel = Endpoint::from_shared(options.endpoint.clone())
            .map_err(|e| AgentProtocolError::ConnectionFailed(format!("Invalid endpoint: {}", e)))?
            .connect_timeout(options.connect_timeout())
            .tcp_nodelay(true)
            .connect()
            .await
            .map_err(|e| {
                error!(agent_id = %agent_id, endpoint = %options.endpoint, error = %e, "Failed to connect to agent");
                AgentProtocolError::ConnectionFailed(format!("Failed to connect: {}", e))
            })?;

        let mut grpc = tonic::client::Grpc::new(channel)
            .max_decoding_message_size(options.max_message_bytes)
            .max_encoding_message_size(options.max_message_bytes);
        grpc.ready()
            .await
            .map_err(|e| AgentProtocolError::ConnectionFailed(format!("Service not ready: {}", e)))?;

        let (tx, rx) = mpsc::channel::<ProxyMessage>(CHANNEL_BUFFER_SIZE);
        let handshake = ProxyMessage {
            kind: Some(proxy_message::Kind::Handshake(wire::RpcHandshake {
                protocol_version: PROTOCOL_VERSION,
                agent_id: agent_id.to_string(),
                client_name: "agentgate".to_string(),
                client_version: env!("CARGO_PKG_VERSION").to_string(),
            })),
        };
        tx.send(handshake)
            .await
            .map_err(|_| AgentProtocolError::ConnectionClosed)?;

        let codec = tonic::codec::ProstCodec::<ProxyMessage, AgentMessage>::default();
        let response = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(rx)),
                PathAndQuery::from_static(PROCESS_PATH),
                codec,
            )
            .await?;
        let mut inbound = response.into_inner();

        let ack = match inbound.message().await? {
            Some(AgentMessage {
                kind: Some(agent_message::Kind::HandshakeAck(ack)),
            }) => ack,
            Some(_) => {
                return Err(AgentProtocolError::InvalidMessage(
                    "Expected handshake ack".to_string(),
                ))
            }
            None => return Err(AgentProtocolError::ConnectionClosed),
        };

        if !ack.accepted {
            return Err(AgentProtocolError::ConnectionFailed(
                ack.error.unwrap_or_else(|| "Handshake rejected".to_string()),
            ));
        }
        if ack.protocol_version != PROTOCOL_VERSION {
            return Err(AgentProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: ack.protocol_version,
            });
        }

        info!(
            agent_id = %agent_id,
            agent_name = %ack.agent_name,
            endpoint = %options.endpoint,
            "RPC handshake successful"
        );

        let pending = Arc::new(PendingCalls::default());
        let pings: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>> = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(run_reader(
            agent_id.to_string(),
            inbound,
            Arc::clone(&pending),
            Arc::clone(&pings),
            Arc::clone(&connected),
        ));

        Ok(Self {
            agent_id: agent_id.to_string(),
            endpoint: options.endpoint.clone(),
            max_message_bytes: options.max_message_bytes,
            outbound: tx,
            pending,
            pings,
            next_nonce: AtomicU64::new(0),
            connected,
            reader_task,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send one event and wait for its decision.
    pub async fn call(&self, request: &AgentRequest) -> Result<AgentResponse, AgentProtocolError> {
        self.call_sequence(std::slice::from_ref(request)).await
    }

    /// Send a headers message followed by body-chunk messages as one call,
    /// answered by a single decision.
    pub async fn call_sequence(
        &self,
        requests: &[AgentRequest],
    ) -> Result<AgentResponse, AgentProtocolError> {
        let last = requests
            .last()
            .ok_or_else(|| AgentProtocolError::InvalidMessage("Empty call sequence".to_string()))?;
        if !self.is_connected() {
            return Err(AgentProtocolError::ConnectionClosed);
        }

        let (call_id, rx, _guard) = self.pending.register(&last.correlation_id);

        // Size-check the whole sequence first; a rejected sequence sends nothing
        let mut events = Vec::with_capacity(requests.len());
        for (i, request) in requests.iter().enumerate() {
            let event = request_to_wire(call_id, request, i + 1 < requests.len());
            let size = prost::Message::encoded_len(&event);
            if size > self.max_message_bytes {
                return Err(AgentProtocolError::MessageTooLarge {
                    size,
                    max: self.max_message_bytes,
                });
            }
            events.push(event);
        }

        for (request, event) in requests.iter().zip(events) {
            trace!(
                agent_id = %self.agent_id,
                correlation_id = %request.correlation_id,
                call_id,
                event = %request.event_type(),
                "Sending event"
            );
            self.outbound
                .send(ProxyMessage {
                    kind: Some(proxy_message::Kind::Event(event)),
                })
                .await
                .map_err(|_| AgentProtocolError::ConnectionClosed)?;
        }

        rx.await.map_err(|_| AgentProtocolError::ConnectionClosed)?
    }

    /// Ask the agent to abandon every call for one request.
    pub async fn cancel(
        &self,
        correlation_id: &CorrelationId,
        reason: CancelReason,
    ) -> Result<(), AgentProtocolError> {
        self.pending.forget_request(correlation_id);
        self.outbound
            .send(ProxyMessage {
                kind: Some(proxy_message::Kind::Cancel(wire::RpcCancel {
                    correlation_id: correlation_id.to_string(),
                    reason: reason.to_wire(),
                    timestamp_ms: now_ms(),
                })),
            })
            .await
            .map_err(|_| AgentProtocolError::ConnectionClosed)?;
        debug!(agent_id = %self.agent_id, correlation_id = %correlation_id, reason = %reason, "Cancel sent");
        Ok(())
    }

    pub async fn ping(&self, timeout: Duration) -> Result<Duration, AgentProtocolError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(nonce, tx);
        let start = Instant::now();

        let sent = self
            .outbound
            .send(ProxyMessage {
                kind: Some(proxy_message::Kind::Ping(wire::RpcPing { nonce })),
            })
            .await;
        if sent.is_err() {
            self.pings.lock().remove(&nonce);
            return Err(AgentProtocolError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(_)) => Err(AgentProtocolError::ConnectionClosed),
            Err(_) => {
                self.pings.lock().remove(&nonce);
                Err(AgentProtocolError::CallTimeout(timeout))
            }
        }
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.reader_task.abort();
        self.pending.fail_all(&AgentProtocolError::ConnectionClosed);
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl std::fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcSession")
            .field("agent_id", &self.agent_id)
            .field("endpoint", &self.endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn run_reader(
    agent_id: String,
    mut inbound: tonic::Streaming<AgentMessage>,
    pending: Arc<PendingCalls>,
    pings: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>,
    connected: Arc<AtomicBool>,
) {
    // Replacement body bytes received ahead of each call's decision
    let mut bodies: HashMap<u64, Vec<u8>> = HashMap::new();

    let cause = loop {
        let message = match inbound.message().await {
            Ok(Some(message)) => message,
            Ok(None) => break AgentProtocolError::ConnectionClosed,
            Err(status) => break AgentProtocolError::from(status),
        };

        match message.kind {
            Some(agent_message::Kind::Decision(decision)) => {
                let call_id = decision.call_id;
                let body = bodies.remove(&call_id);
                if !pending.complete(call_id, response_from_wire(decision, body)) {
                    trace!(agent_id = %agent_id, call_id, "Discarding late decision");
                }
            }
            Some(agent_message::Kind::BodyChunk(chunk)) => {
                bodies.entry(chunk.call_id).or_default().extend_from_slice(&chunk.data);
            }
            Some(agent_message::Kind::CallError(err)) => {
                bodies.remove(&err.call_id);
                pending.complete(err.call_id, Err(AgentProtocolError::Rejected(err.message)));
            }
            Some(agent_message::Kind::Pong(pong)) => {
                if let Some(tx) = pings.lock().remove(&pong.nonce) {
                    let _ = tx.send(());
                }
            }
            Some(agent_message::Kind::HandshakeAck(_)) | None => {
                break AgentProtocolError::InvalidMessage("Unexpected message from agent".into());
            }
        }
    };

    connected.store(false, Ordering::Release);
    match &cause {
        AgentProtocolError::ConnectionClosed => debug!(agent_id = %agent_id, "Agent closed stream"),
        e => warn!(agent_id = %agent_id, error = %e, "RPC stream failed"),
    }
    pending.fail_all(&cause);
    pings.lock().clear();
}
