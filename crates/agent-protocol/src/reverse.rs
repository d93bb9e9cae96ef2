//! Reverse connections: the agent dials the proxy.
//!
//! Useful for agents that cannot expose a socket of their own (sandboxed or
//! dynamically scaled agents).
//!
//! # Protocol
//!
//! 1. Proxy binds a [`ReverseListener`]
//! 2. Agent connects and sends a `Register` frame with a [`RegistrationRequest`]
//! 3. Proxy validates it and answers `RegisterAck` with a [`RegistrationResponse`]
//! 4. On success the connection is handed to a [`ConnectionAdopter`] (the
//!    agent's pool) and used exactly like a proxy-initiated connection
//!
//! The agent side is [`ReverseDialer`], which re-registers with exponential
//! backoff whenever the connection drops.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::AgentProtocolError;
use crate::framing::{decode, encode, read_frame, write_frame, FrameCodec, MessageType, MAX_HANDSHAKE_BYTES};
use crate::protocol::{Encoding, EventType, DEFAULT_MAX_MESSAGE_BYTES, PROTOCOL_VERSION};
use crate::server::{serve_connection, AgentHandler};
use crate::session::FramedSession;
use crate::transport::AgentTransport;

/// Configuration for the reverse connection listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseListenerConfig {
    pub socket_path: PathBuf,
    /// Timeout for the registration handshake
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Allowed agent IDs (empty = allow all)
    #[serde(default)]
    pub allowed_agents: HashSet<String>,
    /// Reject registrations without an auth token
    #[serde(default)]
    pub require_auth: bool,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl ReverseListenerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            allowed_agents: HashSet::new(),
            require_auth: false,
            max_message_bytes: default_max_message_bytes(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// What a registering agent can do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub events: Vec<EventType>,
    /// Encodings the agent accepts, most preferred first
    #[serde(default)]
    pub encodings: Vec<Encoding>,
}

/// Registration request sent by agent when connecting to proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub protocol_version: u32,
    pub agent_id: String,
    #[serde(default)]
    pub capabilities: AgentCapabilities,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Registration response sent by proxy to agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Connection id assigned by the proxy (for debugging)
    #[serde(default)]
    pub assigned_id: String,
    /// Encoding used on this connection after registration
    #[serde(default)]
    pub encoding: Encoding,
}

impl RegistrationResponse {
    fn rejected(error: &AgentProtocolError) -> Self {
        Self {
            accepted: false,
            error: Some(error.to_string()),
            assigned_id: String::new(),
            encoding: Encoding::Json,
        }
    }
}

/// Receives connections registered through a [`ReverseListener`].
pub trait ConnectionAdopter: Send + Sync {
    /// Checked before the registration is acknowledged, so an agent that
    /// would be refused learns why.
    fn admit(&self, registration: &RegistrationRequest) -> Result<(), AgentProtocolError>;

    /// Take ownership of an established connection.
    fn adopt(&self, agent_id: &str, transport: AgentTransport) -> Result<u64, AgentProtocolError>;
}

/// Listener for reverse agent connections over a Unix socket.
pub struct ReverseListener {
    listener: UnixListener,
    config: ReverseListenerConfig,
    next_connection: AtomicU64,
}

impl ReverseListener {
    /// Bind the socket, replacing a stale socket file.
    pub fn bind(config: ReverseListenerConfig) -> Result<Self, AgentProtocolError> {
        if config.socket_path.exists() {
            std::fs::remove_file(&config.socket_path)?;
        }
        let listener = UnixListener::bind(&config.socket_path)?;
        info!(
            path = %config.socket_path.display(),
            allowed = config.allowed_agents.len(),
            "Reverse connection listener bound"
        );
        Ok(Self {
            listener,
            config,
            next_connection: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ReverseListenerConfig {
        &self.config
    }

    /// Accept a single connection and hand it to the adopter.
    ///
    /// Returns the agent_id of the registered agent on success.
    pub async fn accept_one(&self, adopter: &dyn ConnectionAdopter) -> Result<String, AgentProtocolError> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| AgentProtocolError::ConnectionFailed(format!("Accept failed: {}", e)))?;
        debug!("Accepted reverse connection");
        self.handle_connection(stream, adopter).await
    }

    /// Run the accept loop on a background task.
    pub fn spawn(self, adopter: Arc<dyn ConnectionAdopter>) -> JoinHandle<()> {
        let listener = Arc::new(self);
        tokio::spawn(async move {
            info!(path = %listener.config.socket_path.display(), "Starting reverse connection accept loop");
            loop {
                match listener.listener.accept().await {
                    Ok((stream, _addr)) => {
                        let listener = Arc::clone(&listener);
                        let adopter = Arc::clone(&adopter);
                        tokio::spawn(async move {
                            if let Err(e) = listener.handle_connection(stream, adopter.as_ref()).await {
                                warn!(error = %e, "Failed to handle reverse connection");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }

    async fn handle_connection(
        &self,
        stream: UnixStream,
        adopter: &dyn ConnectionAdopter,
    ) -> Result<String, AgentProtocolError> {
        let (mut reader, mut writer) = stream.into_split();

        let timeout = self.config.handshake_timeout();
        let (msg_type, payload) = tokio::time::timeout(timeout, read_frame(&mut reader, MAX_HANDSHAKE_BYTES))
            .await
            .map_err(|_| AgentProtocolError::ConnectTimeout(timeout))??;
        if msg_type != MessageType::Register {
            return Err(AgentProtocolError::InvalidMessage(format!(
                "Expected Register, got {:?}",
                msg_type
            )));
        }
        let registration: RegistrationRequest = decode(Encoding::Json, &payload)?;
        let agent_id = registration.agent_id.clone();

        if let Err(e) = self
            .validate_registration(&registration)
            .and_then(|_| adopter.admit(&registration))
        {
            warn!(agent_id = %agent_id, error = %e, "Rejected reverse registration");
            let response = encode(Encoding::Json, &RegistrationResponse::rejected(&e))?;
            write_frame(&mut writer, MessageType::RegisterAck, &response, MAX_HANDSHAKE_BYTES).await?;
            return Err(e);
        }

        let encoding = registration
            .capabilities
            .encodings
            .first()
            .copied()
            .unwrap_or_default();
        let assigned_id = format!(
            "{}-{}",
            agent_id,
            self.next_connection.fetch_add(1, Ordering::Relaxed) + 1
        );
        let response = RegistrationResponse {
            accepted: true,
            error: None,
            assigned_id: assigned_id.clone(),
            encoding,
        };
        let payload = encode(Encoding::Json, &response)?;
        write_frame(&mut writer, MessageType::RegisterAck, &payload, MAX_HANDSHAKE_BYTES).await?;

        let session = FramedSession::spawn(
            agent_id.clone(),
            assigned_id.clone(),
            reader,
            writer,
            FrameCodec::new(encoding, self.config.max_message_bytes),
        );
        adopter.adopt(&agent_id, AgentTransport::Reverse(session))?;

        info!(
            agent_id = %agent_id,
            connection_id = %assigned_id,
            encoding = ?encoding,
            "Agent registration successful"
        );
        Ok(agent_id)
    }

    fn validate_registration(&self, registration: &RegistrationRequest) -> Result<(), AgentProtocolError> {
        if registration.protocol_version != PROTOCOL_VERSION {
            return Err(AgentProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: registration.protocol_version,
            });
        }

        if registration.agent_id.is_empty() {
            return Err(AgentProtocolError::InvalidMessage(
                "Agent ID cannot be empty".to_string(),
            ));
        }

        if !self.config.allowed_agents.is_empty()
            && !self.config.allowed_agents.contains(&registration.agent_id)
        {
            return Err(AgentProtocolError::Rejected(format!(
                "Agent '{}' is not in the allowed list",
                registration.agent_id
            )));
        }

        if self.config.require_auth && registration.auth_token.is_none() {
            return Err(AgentProtocolError::Rejected(
                "Authentication required but no token provided".to_string(),
            ));
        }

        Ok(())
    }
}

impl Drop for ReverseListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.config.socket_path) {
            debug!(path = %self.config.socket_path.display(), error = %e, "Failed to remove socket file on drop");
        }
    }
}

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub const INITIAL: Duration = Duration::from_millis(100);
    pub const MAX: Duration = Duration::from_secs(30);

    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles each call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Self::INITIAL, Self::MAX)
    }
}

/// Agent-side client that registers with a proxy's reverse listener and
/// serves calls on the resulting connection.
pub struct ReverseDialer {
    agent_id: String,
    proxy_socket: PathBuf,
    handler: Arc<dyn AgentHandler>,
    encodings: Vec<Encoding>,
    auth_token: Option<String>,
    max_message_bytes: usize,
    backoff: Backoff,
}

impl ReverseDialer {
    pub fn new(
        agent_id: impl Into<String>,
        proxy_socket: impl Into<PathBuf>,
        handler: Arc<dyn AgentHandler>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            proxy_socket: proxy_socket.into(),
            handler,
            encodings: vec![Encoding::Json],
            auth_token: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            backoff: Backoff::default(),
        }
    }

    pub fn with_encodings(mut self, encodings: Vec<Encoding>) -> Self {
        self.encodings = encodings;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Register once and serve until the connection drops.
    ///
    /// `on_registered` runs after the proxy accepts the registration.
    pub async fn serve_once(&self, on_registered: impl FnOnce()) -> Result<(), AgentProtocolError> {
        let stream = UnixStream::connect(&self.proxy_socket)
            .await
            .map_err(|e| AgentProtocolError::ConnectionFailed(e.to_string()))?;
        let (mut reader, mut writer) = stream.into_split();

        let registration = RegistrationRequest {
            protocol_version: PROTOCOL_VERSION,
            agent_id: self.agent_id.clone(),
            capabilities: AgentCapabilities {
                events: self.handler.events(),
                encodings: self.encodings.clone(),
            },
            auth_token: self.auth_token.clone(),
        };
        let payload = encode(Encoding::Json, &registration)?;
        write_frame(&mut writer, MessageType::Register, &payload, MAX_HANDSHAKE_BYTES).await?;

        let (msg_type, payload) = read_frame(&mut reader, MAX_HANDSHAKE_BYTES).await?;
        if msg_type != MessageType::RegisterAck {
            return Err(AgentProtocolError::InvalidMessage(format!(
                "Expected RegisterAck, got {:?}",
                msg_type
            )));
        }
        let response: RegistrationResponse = decode(Encoding::Json, &payload)?;
        if !response.accepted {
            return Err(AgentProtocolError::Rejected(
                response
                    .error
                    .unwrap_or_else(|| "Registration rejected".to_string()),
            ));
        }

        info!(
            agent_id = %self.agent_id,
            connection_id = %response.assigned_id,
            proxy = %self.proxy_socket.display(),
            "Registered with proxy"
        );
        on_registered();

        serve_connection(
            &self.agent_id,
            reader,
            writer,
            FrameCodec::new(response.encoding, self.max_message_bytes),
            Arc::clone(&self.handler),
        )
        .await
    }

    /// Keep a registration alive forever, backing off between attempts.
    pub async fn run(mut self) {
        loop {
            let mut registered = false;
            let result = self.serve_once(|| registered = true).await;
            if registered {
                self.backoff.reset();
            }
            match result {
                Ok(()) => debug!(agent_id = %self.agent_id, "Proxy closed connection"),
                Err(e) => warn!(agent_id = %self.agent_id, error = %e, "Reverse connection failed"),
            }

            let delay = self.backoff.next_delay();
            debug!(agent_id = %self.agent_id, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AgentRequest, EventPayload, RequestHeadersEvent, RequestMetadata};
    use crate::server::EventContext;
    use crate::protocol::{AgentResponse, HeaderOp};
    use agentgate_common::CorrelationId;
    use parking_lot::Mutex;

    struct Tagger;

    #[async_trait::async_trait]
    impl AgentHandler for Tagger {
        async fn on_request_headers(&self, ctx: &EventContext, _event: RequestHeadersEvent) -> AgentResponse {
            ctx.allow().add_request_header(HeaderOp::set("x-reverse", "yes"))
        }
    }

    #[derive(Default)]
    struct Collector {
        adopted: Mutex<Vec<AgentTransport>>,
        max: usize,
    }

    impl ConnectionAdopter for Collector {
        fn admit(&self, registration: &RegistrationRequest) -> Result<(), AgentProtocolError> {
            if self.max > 0 && self.adopted.lock().len() >= self.max {
                return Err(AgentProtocolError::Rejected(format!(
                    "Agent '{}' is at its connection limit",
                    registration.agent_id
                )));
            }
            Ok(())
        }

        fn adopt(&self, _agent_id: &str, transport: AgentTransport) -> Result<u64, AgentProtocolError> {
            let mut adopted = self.adopted.lock();
            adopted.push(transport);
            Ok(adopted.len() as u64)
        }
    }

    fn request() -> AgentRequest {
        AgentRequest::new(
            CorrelationId::from("rev"),
            RequestMetadata::default(),
            EventPayload::RequestHeaders(RequestHeadersEvent {
                method: "GET".into(),
                uri: "/".into(),
                headers: vec![],
            }),
        )
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_registration_serialization() {
        let request = RegistrationRequest {
            protocol_version: PROTOCOL_VERSION,
            agent_id: "waf".into(),
            capabilities: AgentCapabilities {
                events: vec![EventType::RequestHeaders],
                encodings: vec![Encoding::MessagePack],
            },
            auth_token: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"agent_id\":\"waf\""));
        assert!(json.contains("\"msgpack\""));
        assert!(!json.contains("auth_token"));
        let back: RegistrationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, request);
    }

    #[tokio::test]
    async fn test_dialer_registers_and_serves_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverse.sock");
        let listener = ReverseListener::bind(ReverseListenerConfig::new(&path)).unwrap();
        let collector = Arc::new(Collector::default());

        let dialer = ReverseDialer::new("waf", &path, Arc::new(Tagger))
            .with_encodings(vec![Encoding::MessagePack]);
        let agent = tokio::spawn(dialer.run());

        let agent_id = listener.accept_one(collector.as_ref()).await.unwrap();
        assert_eq!(agent_id, "waf");

        let transport = collector.adopted.lock().pop().unwrap();
        assert_eq!(transport.kind(), crate::transport::TransportKind::Reverse);
        let response = transport.call(&request()).await.unwrap();
        assert_eq!(response.request_headers, vec![HeaderOp::set("x-reverse", "yes")]);

        agent.abort();
    }

    #[tokio::test]
    async fn test_allowlist_rejects_unknown_agent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverse.sock");
        let mut config = ReverseListenerConfig::new(&path);
        config.allowed_agents.insert("waf".to_string());
        let listener = ReverseListener::bind(config).unwrap();
        let collector = Arc::new(Collector::default());

        let dialer = ReverseDialer::new("intruder", &path, Arc::new(Tagger));
        let (accepted, dialed) = tokio::join!(
            listener.accept_one(collector.as_ref()),
            dialer.serve_once(|| {})
        );
        assert!(matches!(accepted, Err(AgentProtocolError::Rejected(_))));
        assert!(matches!(dialed, Err(AgentProtocolError::Rejected(m)) if m.contains("allowed list")));
        assert!(collector.adopted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_adopter_limit_is_reported_to_agent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverse.sock");
        let listener = ReverseListener::bind(ReverseListenerConfig::new(&path)).unwrap();
        let collector = Arc::new(Collector {
            max: 1,
            ..Default::default()
        });

        let first = tokio::spawn(ReverseDialer::new("waf", &path, Arc::new(Tagger)).run());
        listener.accept_one(collector.as_ref()).await.unwrap();

        let second = ReverseDialer::new("waf", &path, Arc::new(Tagger));
        let (accepted, dialed) = tokio::join!(
            listener.accept_one(collector.as_ref()),
            second.serve_once(|| {})
        );
        assert!(accepted.is_err());
        assert!(matches!(dialed, Err(AgentProtocolError::Rejected(m)) if m.contains("connection limit")));
        first.abort();
    }

    #[tokio::test]
    async fn test_dialer_reconnects_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverse.sock");
        let listener = ReverseListener::bind(ReverseListenerConfig::new(&path)).unwrap();
        let collector = Arc::new(Collector::default());

        let dialer = ReverseDialer::new("waf", &path, Arc::new(Tagger))
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(50)));
        let agent = tokio::spawn(dialer.run());

        listener.accept_one(collector.as_ref()).await.unwrap();
        let first = collector.adopted.lock().pop().unwrap();
        first.close();
        drop(first);

        let again = tokio::time::timeout(Duration::from_secs(2), listener.accept_one(collector.as_ref()))
            .await
            .unwrap();
        assert_eq!(again.unwrap(), "waf");
        agent.abort();
    }

    #[tokio::test]
    async fn test_registration_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reverse.sock");
        let mut config = ReverseListenerConfig::new(&path);
        config.handshake_timeout_ms = 50;
        let listener = ReverseListener::bind(config).unwrap();
        let collector = Collector::default();

        // Connects but never registers
        let _silent = UnixStream::connect(&path).await.unwrap();
        let err = listener.accept_one(&collector).await.unwrap_err();
        assert!(matches!(err, AgentProtocolError::ConnectTimeout(_)));
    }
}
