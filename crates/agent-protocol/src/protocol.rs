//! Agent protocol types and constants.
//!
//! These are the messages exchanged between the proxy and external agents.
//! They are transport-neutral: the local stream transport encodes them with
//! JSON or MessagePack inside length-prefixed frames, and the RPC transport
//! converts them to protobuf messages (see [`crate::rpc`]).
//!
//! Headers are carried as ordered `(name, value)` pairs so an agent sees them
//! in the order the client sent them.

use agentgate_common::CorrelationId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Agent protocol version
pub const PROTOCOL_VERSION: u32 = 2;

/// Default maximum encoded message size (10MB)
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Lifecycle phase an agent may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Request headers received
    RequestHeaders,
    /// Request body chunk received
    RequestBodyChunk,
    /// Response headers received
    ResponseHeaders,
    /// Response body chunk received
    ResponseBodyChunk,
    /// Frame of a message-oriented protocol (e.g. WebSocket)
    Frame,
    /// Request/response complete; audit only
    Complete,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::RequestHeaders,
        EventType::RequestBodyChunk,
        EventType::ResponseHeaders,
        EventType::ResponseBodyChunk,
        EventType::Frame,
        EventType::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RequestHeaders => "request_headers",
            EventType::RequestBodyChunk => "request_body_chunk",
            EventType::ResponseHeaders => "response_headers",
            EventType::ResponseBodyChunk => "response_body_chunk",
            EventType::Frame => "frame",
            EventType::Complete => "complete",
        }
    }

    pub fn is_body(&self) -> bool {
        matches!(
            self,
            EventType::RequestBodyChunk | EventType::ResponseBodyChunk
        )
    }

    /// Decisions returned for audit-only phases never affect the request.
    pub fn is_audit_only(&self) -> bool {
        matches!(self, EventType::Complete)
    }

    pub(crate) fn to_wire(self) -> i32 {
        match self {
            EventType::RequestHeaders => 1,
            EventType::RequestBodyChunk => 2,
            EventType::ResponseHeaders => 3,
            EventType::ResponseBodyChunk => 4,
            EventType::Frame => 5,
            EventType::Complete => 6,
        }
    }

    pub(crate) fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(EventType::RequestHeaders),
            2 => Some(EventType::RequestBodyChunk),
            3 => Some(EventType::ResponseHeaders),
            4 => Some(EventType::ResponseBodyChunk),
            5 => Some(EventType::Frame),
            6 => Some(EventType::Complete),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP header, kept in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request context sent with every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    /// Client IP address
    pub client_ip: String,
    /// Client port
    pub client_port: u16,
    /// Server name (SNI or Host header)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Protocol (HTTP/1.1, HTTP/2, etc.)
    pub protocol: String,
    /// Route ID that matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    /// Upstream ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    /// Request start timestamp (RFC3339)
    pub timestamp: String,
}

impl RequestMetadata {
    pub fn new(client_ip: impl Into<String>, client_port: u16) -> Self {
        Self {
            client_ip: client_ip.into(),
            client_port,
            protocol: "HTTP/1.1".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            ..Default::default()
        }
    }

    pub fn with_route(mut self, route_id: impl Into<String>) -> Self {
        self.route_id = Some(route_id.into());
        self
    }
}

/// Request headers event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeadersEvent {
    pub method: String,
    pub uri: String,
    pub headers: Vec<Header>,
}

/// Response headers event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeadersEvent {
    pub status: u16,
    pub headers: Vec<Header>,
}

/// Body chunk event, for either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyChunkEvent {
    /// Monotonic index of this chunk as delivered to this agent
    pub chunk_index: u64,
    /// No further chunks will be delivered to this agent
    pub is_last: bool,
    /// Inspection stopped at the configured limit; the rest of the body
    /// was not (and will not be) shown to the agent
    #[serde(default)]
    pub truncated: bool,
    /// Total body bytes observed by the proxy so far
    pub bytes_seen: u64,
    /// Chunk bytes (base64 in JSON)
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Frame of a message-oriented protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEvent {
    pub opcode: u8,
    pub client_to_server: bool,
    pub frame_index: u64,
    #[serde(with = "b64")]
    pub data: Vec<u8>,
}

/// Terminal audit event sent once the exchange is over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub status: u16,
    pub duration_ms: u64,
    pub request_body_bytes: u64,
    pub response_body_bytes: u64,
    /// Summary of the decision the pipeline applied, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Phase-specific payload of a lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    RequestHeaders(RequestHeadersEvent),
    RequestBodyChunk(BodyChunkEvent),
    ResponseHeaders(ResponseHeadersEvent),
    ResponseBodyChunk(BodyChunkEvent),
    Frame(FrameEvent),
    Complete(CompleteEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::RequestHeaders(_) => EventType::RequestHeaders,
            EventPayload::RequestBodyChunk(_) => EventType::RequestBodyChunk,
            EventPayload::ResponseHeaders(_) => EventType::ResponseHeaders,
            EventPayload::ResponseBodyChunk(_) => EventType::ResponseBodyChunk,
            EventPayload::Frame(_) => EventType::Frame,
            EventPayload::Complete(_) => EventType::Complete,
        }
    }
}

/// One lifecycle event addressed to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub version: u32,
    pub correlation_id: CorrelationId,
    pub metadata: RequestMetadata,
    pub event: EventPayload,
}

impl AgentRequest {
    pub fn new(correlation_id: CorrelationId, metadata: RequestMetadata, event: EventPayload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            metadata,
            event,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.event.event_type()
    }
}

/// Agent decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// Allow the request/response to continue
    #[default]
    Allow,
    /// Block the request/response
    Block {
        /// HTTP status code to return
        status: u16,
        /// Optional response body
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Extra response headers
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        headers: Vec<Header>,
    },
    /// Redirect the request
    Redirect {
        location: String,
        /// HTTP status code (301, 302, 303, 307, 308)
        status: u16,
    },
    /// Challenge the client (e.g., CAPTCHA)
    Challenge {
        challenge_type: String,
        #[serde(default)]
        params: BTreeMap<String, String>,
    },
}

impl Decision {
    pub fn block(status: u16) -> Self {
        Decision::Block {
            status,
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block { .. } => "block",
            Decision::Redirect { .. } => "redirect",
            Decision::Challenge { .. } => "challenge",
        }
    }
}

/// Header mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HeaderOp {
    /// Set a header (replace all existing values)
    Set { name: String, value: String },
    /// Add a header value (append)
    Add { name: String, value: String },
    /// Remove a header
    Remove { name: String },
}

impl HeaderOp {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderOp::Set {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn add(name: impl Into<String>, value: impl Into<String>) -> Self {
        HeaderOp::Add {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        HeaderOp::Remove { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            HeaderOp::Set { name, .. } | HeaderOp::Add { name, .. } | HeaderOp::Remove { name } => {
                name
            }
        }
    }
}

/// Audit metadata attached to a response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, String>,
}

impl AuditMetadata {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.rule_ids.is_empty()
            && self.confidence.is_none()
            && self.reason_codes.is_empty()
            && self.custom.is_empty()
    }
}

/// Agent response to one event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub version: u32,
    pub correlation_id: CorrelationId,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<HeaderOp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_headers: Vec<HeaderOp>,
    /// Request-metadata mutations (later agents override earlier ones)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub routing_metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub audit: AuditMetadata,
    /// Replacement bytes for the inspected body
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64::option")]
    pub body_replacement: Option<Vec<u8>>,
}

impl AgentResponse {
    /// Create a default allow response
    pub fn default_allow(correlation_id: CorrelationId) -> Self {
        Self::with_decision(correlation_id, Decision::Allow)
    }

    /// Create a block response
    pub fn block(correlation_id: CorrelationId, status: u16, body: Option<String>) -> Self {
        Self::with_decision(
            correlation_id,
            Decision::Block {
                status,
                body,
                headers: Vec::new(),
            },
        )
    }

    /// Create a redirect response
    pub fn redirect(correlation_id: CorrelationId, location: impl Into<String>, status: u16) -> Self {
        Self::with_decision(
            correlation_id,
            Decision::Redirect {
                location: location.into(),
                status,
            },
        )
    }

    pub fn with_decision(correlation_id: CorrelationId, decision: Decision) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            decision,
            request_headers: Vec::new(),
            response_headers: Vec::new(),
            routing_metadata: BTreeMap::new(),
            audit: AuditMetadata::default(),
            body_replacement: None,
        }
    }

    /// Add a request header modification
    pub fn add_request_header(mut self, op: HeaderOp) -> Self {
        self.request_headers.push(op);
        self
    }

    /// Add a response header modification
    pub fn add_response_header(mut self, op: HeaderOp) -> Self {
        self.response_headers.push(op);
        self
    }

    pub fn with_routing_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.routing_metadata.insert(key.into(), value.into());
        self
    }

    /// Add audit metadata
    pub fn with_audit(mut self, audit: AuditMetadata) -> Self {
        self.audit = audit;
        self
    }
}

/// Why the proxy cancelled an in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Downstream client went away
    ClientDisconnect,
    /// Call exceeded its deadline
    Timeout,
    /// An earlier agent reached a terminal decision
    BlockedByAgent,
    /// Upstream failed; the request will not continue
    UpstreamError,
    /// Proxy is shutting down
    ProxyShutdown,
    /// Operator-initiated
    Manual,
}

impl CancelReason {
    /// Cancellations initiated by the proxy say nothing about agent health
    /// and are excluded from circuit breaker accounting.
    pub fn is_proxy_initiated(&self) -> bool {
        !matches!(self, CancelReason::Timeout)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::ClientDisconnect => "client_disconnect",
            CancelReason::Timeout => "timeout",
            CancelReason::BlockedByAgent => "blocked_by_agent",
            CancelReason::UpstreamError => "upstream_error",
            CancelReason::ProxyShutdown => "proxy_shutdown",
            CancelReason::Manual => "manual",
        }
    }

    pub(crate) fn to_wire(self) -> i32 {
        match self {
            CancelReason::ClientDisconnect => 1,
            CancelReason::Timeout => 2,
            CancelReason::BlockedByAgent => 3,
            CancelReason::UpstreamError => 4,
            CancelReason::ProxyShutdown => 5,
            CancelReason::Manual => 6,
        }
    }

    pub(crate) fn from_wire(value: i32) -> Self {
        match value {
            1 => CancelReason::ClientDisconnect,
            2 => CancelReason::Timeout,
            3 => CancelReason::BlockedByAgent,
            4 => CancelReason::UpstreamError,
            5 => CancelReason::ProxyShutdown,
            _ => CancelReason::Manual,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cancellation notice for every in-flight call of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub correlation_id: CorrelationId,
    pub reason: CancelReason,
    pub timestamp_ms: u64,
}

impl CancelRequest {
    pub fn new(correlation_id: CorrelationId, reason: CancelReason) -> Self {
        Self {
            correlation_id,
            reason,
            timestamp_ms: now_ms(),
        }
    }
}

/// Payload encoding for the local stream transport.
///
/// The proxy offers its preferred encoding in the handshake; the agent
/// answers with the one it will use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON encoding (default, always supported)
    #[default]
    Json,
    /// MessagePack binary encoding
    #[serde(rename = "msgpack")]
    MessagePack,
}

/// First message on every proxy-initiated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    /// Agent id the proxy expects to reach
    pub agent_id: String,
    pub client_name: String,
    pub client_version: String,
    /// Encodings the proxy accepts, most preferred first
    pub encodings: Vec<Encoding>,
}

/// Agent's answer to a [`HandshakeRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub accepted: bool,
    pub protocol_version: u32,
    pub agent_id: String,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub supported_events: Vec<EventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Base64 representation of byte fields, so JSON payloads stay compact.
mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_payload_tags() {
        let payload = EventPayload::ResponseHeaders(ResponseHeadersEvent {
            status: 200,
            headers: vec![Header::new("content-type", "text/html")],
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["event_type"], "response_headers");
        assert_eq!(json["payload"]["status"], 200);
        assert_eq!(payload.event_type(), EventType::ResponseHeaders);
    }

    #[test]
    fn test_body_bytes_are_base64_in_json() {
        let chunk = BodyChunkEvent {
            chunk_index: 0,
            is_last: true,
            truncated: false,
            bytes_seen: 3,
            data: vec![0x00, 0xff, 0x10],
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["data"], "AP8Q");
        let back: BodyChunkEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.data, vec![0x00, 0xff, 0x10]);
    }

    #[test]
    fn test_response_body_replacement_roundtrip() {
        let mut response = AgentResponse::default_allow(CorrelationId::from("c1"));
        response.body_replacement = Some(b"redacted".to_vec());
        let json = serde_json::to_string(&response).unwrap();
        let back: AgentResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body_replacement.as_deref(), Some(&b"redacted"[..]));

        let plain = AgentResponse::default_allow(CorrelationId::from("c2"));
        let json = serde_json::to_string(&plain).unwrap();
        assert!(!json.contains("body_replacement"));
        let back: AgentResponse = serde_json::from_str(&json).unwrap();
        assert!(back.body_replacement.is_none());
    }

    #[test]
    fn test_decision_serialization() {
        let decision = Decision::Redirect {
            location: "https://login.example.com".into(),
            status: 302,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json["type"], "redirect");
        assert_eq!(json["location"], "https://login.example.com");
        assert_eq!(Decision::block(403).as_str(), "block");
    }

    #[test]
    fn test_cancel_reason_accounting() {
        assert!(!CancelReason::Timeout.is_proxy_initiated());
        assert!(CancelReason::ClientDisconnect.is_proxy_initiated());
        assert!(CancelReason::BlockedByAgent.is_proxy_initiated());
        for reason in [
            CancelReason::ClientDisconnect,
            CancelReason::Timeout,
            CancelReason::BlockedByAgent,
            CancelReason::UpstreamError,
            CancelReason::ProxyShutdown,
            CancelReason::Manual,
        ] {
            assert_eq!(CancelReason::from_wire(reason.to_wire()), reason);
        }
    }

    #[test]
    fn test_event_type_wire_values() {
        for event in EventType::ALL {
            assert_eq!(EventType::from_wire(event.to_wire()), Some(event));
        }
        assert_eq!(EventType::from_wire(0), None);
    }
}
