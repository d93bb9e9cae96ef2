//! Classification of failed agent calls.
//!
//! A failed call never becomes a request error. It is classified here and
//! then resolved to an effective decision by the failure policy.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

use agentgate_agent_protocol::AgentProtocolError;

/// Why an agent call produced no decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// No connection could be established in time
    ConnectTimeout,
    /// The agent did not answer before the deadline
    CallTimeout,
    /// Reset, refused, closed, or otherwise broken connection
    TransportError,
    /// A message exceeded the configured size limit
    MessageTooLarge,
    /// The breaker is open; no call was attempted
    CircuitOpen,
    /// The agent answered with something other than a decision
    AgentProtocolError,
    /// The proxy abandoned the call
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ConnectTimeout => "connect_timeout",
            FailureKind::CallTimeout => "call_timeout",
            FailureKind::TransportError => "transport_error",
            FailureKind::MessageTooLarge => "message_too_large",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::AgentProtocolError => "agent_protocol_error",
            FailureKind::Cancelled => "cancelled",
        }
    }

    /// Whether the failure counts against the agent's breaker.
    pub fn counts_against_breaker(&self) -> bool {
        !matches!(self, FailureKind::CircuitOpen | FailureKind::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FailureKind::ConnectTimeout | FailureKind::CallTimeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AgentProtocolError> for FailureKind {
    fn from(error: &AgentProtocolError) -> Self {
        match error {
            AgentProtocolError::ConnectTimeout(_) => FailureKind::ConnectTimeout,
            AgentProtocolError::CallTimeout(_) => FailureKind::CallTimeout,
            AgentProtocolError::MessageTooLarge { .. } => FailureKind::MessageTooLarge,
            AgentProtocolError::InvalidMessage(_)
            | AgentProtocolError::Serialization(_)
            | AgentProtocolError::Rejected(_) => FailureKind::AgentProtocolError,
            AgentProtocolError::Cancelled => FailureKind::Cancelled,
            AgentProtocolError::ConnectionFailed(_)
            | AgentProtocolError::ConnectionClosed
            | AgentProtocolError::VersionMismatch { .. }
            | AgentProtocolError::PoolExhausted { .. }
            | AgentProtocolError::Unavailable(_)
            | AgentProtocolError::Rpc(_)
            | AgentProtocolError::Io(_) => FailureKind::TransportError,
        }
    }
}

/// A classified call failure with the detail needed for logs and audit.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Time spent before the failure was known
    pub elapsed: Duration,
}

impl CallFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            kind,
            message: message.into(),
            elapsed,
        }
    }

    pub fn from_protocol(error: &AgentProtocolError, elapsed: Duration) -> Self {
        Self::new(FailureKind::from(error), error.to_string(), elapsed)
    }

    pub fn circuit_open(agent_id: &str) -> Self {
        Self::new(
            FailureKind::CircuitOpen,
            format!("circuit breaker open for agent '{agent_id}'"),
            Duration::ZERO,
        )
    }
}
