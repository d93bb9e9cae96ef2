//! Agent protocol for the agentgate proxy
//!
//! Defines how the proxy dataplane talks to external processing agents (WAF,
//! auth, rate limiting, custom logic) and how those connections are managed.
//!
//! # Transports
//!
//! - **Local stream**: length-prefixed frames over a Unix socket, JSON or
//!   MessagePack payloads ([`local`], [`framing`], [`session`])
//! - **Remote RPC**: one bidirectional gRPC stream per connection ([`rpc`])
//! - **Reverse**: the agent dials the proxy and registers; the connection is
//!   adopted into the agent's pool ([`reverse`])
//!
//! Every transport multiplexes concurrent calls over one connection and
//! supports mid-flight cancellation. Calls carry no deadline of their own:
//! the caller bounds them.
//!
//! # Building agents
//!
//! Implement [`AgentHandler`] and run it with [`AgentServer`] (local stream)
//! or [`ReverseDialer`] (reverse connection).

pub mod errors;
pub mod framing;
pub mod local;
pub mod pool;
pub mod protocol;
pub mod reverse;
pub mod rpc;
pub mod server;
pub mod session;
pub mod transport;

mod pending;

pub use errors::AgentProtocolError;
pub use framing::FrameCodec;
pub use local::LocalStreamOptions;
pub use pool::{
    AcquireMode, AgentPool, LoadBalanceStrategy, MaintenanceReport, PoolConfig, PoolStats,
    PooledLease,
};
pub use protocol::{
    AgentRequest, AgentResponse, AuditMetadata, BodyChunkEvent, CancelReason, CancelRequest,
    CompleteEvent, Decision, Encoding, EventPayload, EventType, FrameEvent, Header, HeaderOp,
    RequestHeadersEvent, RequestMetadata, ResponseHeadersEvent, DEFAULT_MAX_MESSAGE_BYTES,
    PROTOCOL_VERSION,
};
pub use reverse::{
    AgentCapabilities, Backoff, ConnectionAdopter, RegistrationRequest, RegistrationResponse,
    ReverseDialer, ReverseListener, ReverseListenerConfig,
};
pub use rpc::{RpcOptions, RpcSession};
pub use server::{AgentHandler, AgentServer, EventContext};
pub use session::FramedSession;
pub use transport::{AgentTransport, TransportEndpoint, TransportKind};
