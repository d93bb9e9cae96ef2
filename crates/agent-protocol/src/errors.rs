//! Transport-level errors.

use std::time::Duration;
use thiserror::Error;

/// Agent protocol errors
#[derive(Error, Debug)]
pub enum AgentProtocolError {
    #[error("Connection to agent timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Agent call timed out after {0:?}")]
    CallTimeout(Duration),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The agent answered the call with an error instead of a decision
    #[error("Agent rejected call: {0}")]
    Rejected(String),

    #[error("Connection pool exhausted ({max_concurrent} concurrent calls)")]
    PoolExhausted { max_concurrent: usize },

    #[error("Agent unavailable: {0}")]
    Unavailable(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentProtocolError {
    /// Errors after which the connection that produced them must be discarded.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::ConnectionClosed
                | Self::Io(_)
                | Self::Rpc(_)
                | Self::InvalidMessage(_)
                | Self::MessageTooLarge { .. }
        )
    }

    /// Connection-level errors that a fresh connection could plausibly avoid.
    ///
    /// Oversized and malformed messages are excluded: the same payload would
    /// fail again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::ConnectionClosed | Self::Io(_) | Self::Rpc(_)
        )
    }
}

impl AgentProtocolError {
    /// Copy of this error for fanning one connection failure out to every
    /// call waiting on that connection. IO errors collapse to their message.
    pub fn replicate(&self) -> Self {
        match self {
            Self::ConnectTimeout(d) => Self::ConnectTimeout(*d),
            Self::CallTimeout(d) => Self::CallTimeout(*d),
            Self::ConnectionFailed(m) => Self::ConnectionFailed(m.clone()),
            Self::ConnectionClosed => Self::ConnectionClosed,
            Self::VersionMismatch { expected, actual } => Self::VersionMismatch {
                expected: *expected,
                actual: *actual,
            },
            Self::MessageTooLarge { size, max } => Self::MessageTooLarge {
                size: *size,
                max: *max,
            },
            Self::InvalidMessage(m) => Self::InvalidMessage(m.clone()),
            Self::Serialization(m) => Self::Serialization(m.clone()),
            Self::Rejected(m) => Self::Rejected(m.clone()),
            Self::PoolExhausted { max_concurrent } => Self::PoolExhausted {
                max_concurrent: *max_concurrent,
            },
            Self::Unavailable(m) => Self::Unavailable(m.clone()),
            Self::Cancelled => Self::Cancelled,
            Self::Rpc(m) => Self::Rpc(m.clone()),
            Self::Io(e) => Self::ConnectionFailed(e.to_string()),
        }
    }
}

impl From<tonic::Status> for AgentProtocolError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::DeadlineExceeded => Self::CallTimeout(Duration::ZERO),
            tonic::Code::Cancelled => Self::Cancelled,
            tonic::Code::ResourceExhausted => Self::MessageTooLarge { size: 0, max: 0 },
            tonic::Code::InvalidArgument => Self::InvalidMessage(status.message().to_string()),
            _ => Self::Rpc(format!("{}: {}", status.code(), status.message())),
        }
    }
}

impl From<tonic::transport::Error> for AgentProtocolError {
    fn from(err: tonic::transport::Error) -> Self {
        Self::ConnectionFailed(err.to_string())
    }
}
