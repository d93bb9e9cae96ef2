//! Length-prefixed framing for the local stream transport.
//!
//! Wire format of one frame:
//!
//! ```text
//! +----------------+-----------+---------------------+
//! | length (u32 BE)| type (u8) | payload (length - 1)|
//! +----------------+-----------+---------------------+
//! ```
//!
//! The length covers the type byte and the payload. A frame whose length
//! exceeds the configured maximum is rejected before its payload is read;
//! callers must then drop the connection since the stream can no longer be
//! resynchronised.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::AgentProtocolError;
use crate::protocol::{AgentRequest, AgentResponse, Encoding};

/// Size of the length prefix.
pub const LENGTH_PREFIX_BYTES: usize = 4;

/// Handshake and registration frames are small; cap them well below the
/// message limit.
pub(crate) const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// Message type identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection setup
    Handshake = 0x01,
    HandshakeAck = 0x02,
    Register = 0x03,
    RegisterAck = 0x04,

    // Calls
    Event = 0x10,
    Response = 0x20,
    CallError = 0x21,

    // Management
    Cancel = 0x40,
    Ping = 0x41,
    Pong = 0x42,
}

impl TryFrom<u8> for MessageType {
    type Error = AgentProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::Handshake),
            0x02 => Ok(MessageType::HandshakeAck),
            0x03 => Ok(MessageType::Register),
            0x04 => Ok(MessageType::RegisterAck),
            0x10 => Ok(MessageType::Event),
            0x20 => Ok(MessageType::Response),
            0x21 => Ok(MessageType::CallError),
            0x40 => Ok(MessageType::Cancel),
            0x41 => Ok(MessageType::Ping),
            0x42 => Ok(MessageType::Pong),
            _ => Err(AgentProtocolError::InvalidMessage(format!(
                "Unknown message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Event frame body: one call on a multiplexed connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub call_id: u64,
    pub request: AgentRequest,
}

/// Borrowing form of [`CallEnvelope`] used on the send path.
#[derive(Debug, Serialize)]
pub(crate) struct CallEnvelopeRef<'a> {
    pub call_id: u64,
    pub request: &'a AgentRequest,
}

/// Response frame body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReply {
    pub call_id: u64,
    pub response: AgentResponse,
}

/// Call error frame body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFailure {
    pub call_id: u64,
    pub message: String,
}

/// Ping/Pong frame body.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PingFrame {
    pub nonce: u64,
}

/// Encoding plus size limit for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    pub encoding: Encoding,
    pub max_message_bytes: usize,
}

impl FrameCodec {
    pub fn new(encoding: Encoding, max_message_bytes: usize) -> Self {
        Self {
            encoding,
            max_message_bytes,
        }
    }

    /// Serialize a value using this codec's encoding.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, AgentProtocolError> {
        encode(self.encoding, value)
    }

    /// Deserialize a value using this codec's encoding.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, AgentProtocolError> {
        decode(self.encoding, bytes)
    }

    /// Reject a payload that would produce an oversized frame.
    pub fn check_size(&self, payload_len: usize) -> Result<(), AgentProtocolError> {
        let frame_len = payload_len + 1;
        if frame_len > self.max_message_bytes {
            return Err(AgentProtocolError::MessageTooLarge {
                size: frame_len,
                max: self.max_message_bytes,
            });
        }
        Ok(())
    }
}

pub fn encode<T: Serialize>(encoding: Encoding, value: &T) -> Result<Vec<u8>, AgentProtocolError> {
    match encoding {
        Encoding::Json => {
            serde_json::to_vec(value).map_err(|e| AgentProtocolError::Serialization(e.to_string()))
        }
        Encoding::MessagePack => rmp_serde::to_vec_named(value)
            .map_err(|e| AgentProtocolError::Serialization(e.to_string())),
    }
}

pub fn decode<T: DeserializeOwned>(encoding: Encoding, bytes: &[u8]) -> Result<T, AgentProtocolError> {
    match encoding {
        Encoding::Json => serde_json::from_slice(bytes)
            .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string())),
        Encoding::MessagePack => rmp_serde::from_slice(bytes)
            .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string())),
    }
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
    max_message_bytes: usize,
) -> Result<(), AgentProtocolError> {
    let total_len = payload.len() + 1;
    if total_len > max_message_bytes || total_len > u32::MAX as usize {
        return Err(AgentProtocolError::MessageTooLarge {
            size: total_len,
            max: max_message_bytes,
        });
    }

    writer.write_all(&(total_len as u32).to_be_bytes()).await?;
    writer.write_all(&[msg_type as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read one frame.
///
/// Partial reads are absorbed by `read_exact`; EOF at a frame boundary maps
/// to [`AgentProtocolError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_bytes: usize,
) -> Result<(MessageType, Vec<u8>), AgentProtocolError> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(AgentProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let total_len = u32::from_be_bytes(len_bytes) as usize;

    if total_len == 0 {
        return Err(AgentProtocolError::InvalidMessage(
            "Zero-length message".to_string(),
        ));
    }

    if total_len > max_message_bytes {
        return Err(AgentProtocolError::MessageTooLarge {
            size: total_len,
            max: max_message_bytes,
        });
    }

    let mut type_byte = [0u8; 1];
    reader.read_exact(&mut type_byte).await.map_err(eof_is_closed)?;
    let msg_type = MessageType::try_from(type_byte[0])?;

    let mut payload = vec![0u8; total_len - 1];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(eof_is_closed)?;
    }

    Ok((msg_type, payload))
}

fn eof_is_closed(e: std::io::Error) -> AgentProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        AgentProtocolError::ConnectionClosed
    } else {
        e.into()
    }
}
