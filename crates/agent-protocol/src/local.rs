//! Local stream transport: the proxy dials an agent's Unix socket.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::UnixStream;
use tracing::{debug, error, info};

use crate::errors::AgentProtocolError;
use crate::framing::{
    decode, encode, read_frame, write_frame, FrameCodec, MessageType, MAX_HANDSHAKE_BYTES,
};
use crate::protocol::{
    Encoding, HandshakeRequest, HandshakeResponse, DEFAULT_MAX_MESSAGE_BYTES, PROTOCOL_VERSION,
};
use crate::session::FramedSession;

/// Connection options for a local stream agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalStreamOptions {
    pub path: PathBuf,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl LocalStreamOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            encoding: Encoding::default(),
            max_message_bytes: default_max_message_bytes(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Encodings offered in the handshake, preferred first.
    fn offered_encodings(&self) -> Vec<Encoding> {
        let mut offered = vec![self.encoding];
        if self.encoding != Encoding::Json {
            offered.push(Encoding::Json);
        }
        offered
    }
}

/// Dial the agent and perform the handshake, bounded by the connect timeout.
pub async fn connect(
    agent_id: &str,
    options: &LocalStreamOptions,
) -> Result<(FramedSession, HandshakeResponse), AgentProtocolError> {
    let timeout = options.connect_timeout();
    match tokio::time::timeout(timeout, connect_inner(agent_id, options)).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                agent_id = %agent_id,
                socket_path = %options.path.display(),
                timeout_ms = options.connect_timeout_ms,
                "Timed out connecting to agent"
            );
            Err(AgentProtocolError::ConnectTimeout(timeout))
        }
    }
}

async fn connect_inner(
    agent_id: &str,
    options: &LocalStreamOptions,
) -> Result<(FramedSession, HandshakeResponse), AgentProtocolError> {
    debug!(
        agent_id = %agent_id,
        socket_path = %options.path.display(),
        "Connecting to agent via local stream"
    );

    let stream = UnixStream::connect(&options.path).await.map_err(|e| {
        error!(
            agent_id = %agent_id,
            socket_path = %options.path.display(),
            error = %e,
            "Failed to connect to agent"
        );
        AgentProtocolError::ConnectionFailed(e.to_string())
    })?;

    let (mut read_half, mut write_half) = stream.into_split();

    let offered = options.offered_encodings();
    let request = HandshakeRequest {
        protocol_version: PROTOCOL_VERSION,
        agent_id: agent_id.to_string(),
        client_name: "agentgate".to_string(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
        encodings: offered.clone(),
    };

    // Handshake always uses JSON (before encoding is negotiated)
    let payload = encode(Encoding::Json, &request)?;
    write_frame(&mut write_half, MessageType::Handshake, &payload, MAX_HANDSHAKE_BYTES).await?;

    let (msg_type, bytes) = read_frame(&mut read_half, MAX_HANDSHAKE_BYTES).await?;
    if msg_type != MessageType::HandshakeAck {
        return Err(AgentProtocolError::InvalidMessage(format!(
            "Expected HandshakeAck, got {:?}",
            msg_type
        )));
    }

    let response: HandshakeResponse = decode(Encoding::Json, &bytes)?;
    verify_handshake(agent_id, &offered, &response)?;

    info!(
        agent_id = %agent_id,
        agent_name = %response.agent_name,
        encoding = ?response.encoding,
        "Local stream handshake successful"
    );

    let session = FramedSession::spawn(
        agent_id,
        options.path.display().to_string(),
        read_half,
        write_half,
        FrameCodec::new(response.encoding, options.max_message_bytes),
    );
    Ok((session, response))
}

pub(crate) fn verify_handshake(
    agent_id: &str,
    offered: &[Encoding],
    response: &HandshakeResponse,
) -> Result<(), AgentProtocolError> {
    if !response.accepted {
        return Err(AgentProtocolError::ConnectionFailed(
            response
                .error
                .clone()
                .unwrap_or_else(|| "Handshake rejected".to_string()),
        ));
    }
    if response.protocol_version != PROTOCOL_VERSION {
        return Err(AgentProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: response.protocol_version,
        });
    }
    if !offered.contains(&response.encoding) {
        return Err(AgentProtocolError::InvalidMessage(format!(
            "Agent chose unoffered encoding {:?}",
            response.encoding
        )));
    }
    if !response.agent_id.is_empty() && response.agent_id != agent_id {
        return Err(AgentProtocolError::ConnectionFailed(format!(
            "Expected agent '{}', reached '{}'",
            agent_id, response.agent_id
        )));
    }
    Ok(())
}
