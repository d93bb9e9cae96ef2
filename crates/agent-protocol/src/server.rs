//! Agent-side runtime for implementing external agents.
//!
//! An [`AgentHandler`] receives one callback per lifecycle event. The
//! [`AgentServer`] accepts proxy connections on a Unix socket, performs the
//! handshake and then serves multiplexed calls through [`serve_connection`],
//! which the reverse dialer reuses after registering with the proxy.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use agentgate_common::CorrelationId;

use crate::errors::AgentProtocolError;
use crate::framing::{
    decode, encode, read_frame, write_frame, CallEnvelope, CallFailure, CallReply, FrameCodec,
    MessageType, MAX_HANDSHAKE_BYTES,
};
use crate::protocol::{
    AgentRequest, AgentResponse, BodyChunkEvent, CancelReason, CancelRequest, CompleteEvent,
    Encoding, EventPayload, EventType, FrameEvent, HandshakeRequest, HandshakeResponse,
    RequestHeadersEvent, RequestMetadata, ResponseHeadersEvent, DEFAULT_MAX_MESSAGE_BYTES,
    PROTOCOL_VERSION,
};
use crate::session::CHANNEL_BUFFER_SIZE;

/// Identity of the request an event belongs to.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub correlation_id: CorrelationId,
    pub metadata: RequestMetadata,
}

impl EventContext {
    /// An allow response addressed to this request.
    pub fn allow(&self) -> AgentResponse {
        AgentResponse::default_allow(self.correlation_id.clone())
    }
}

/// Trait for implementing agent logic
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Events this agent wants to receive, announced in the handshake.
    fn events(&self) -> Vec<EventType> {
        EventType::ALL.to_vec()
    }

    async fn on_request_headers(&self, ctx: &EventContext, _event: RequestHeadersEvent) -> AgentResponse {
        ctx.allow()
    }

    async fn on_request_body_chunk(&self, ctx: &EventContext, _event: BodyChunkEvent) -> AgentResponse {
        ctx.allow()
    }

    async fn on_response_headers(&self, ctx: &EventContext, _event: ResponseHeadersEvent) -> AgentResponse {
        ctx.allow()
    }

    async fn on_response_body_chunk(&self, ctx: &EventContext, _event: BodyChunkEvent) -> AgentResponse {
        ctx.allow()
    }

    async fn on_frame(&self, ctx: &EventContext, _event: FrameEvent) -> AgentResponse {
        ctx.allow()
    }

    /// The decision of an audit event is ignored by the proxy.
    async fn on_complete(&self, ctx: &EventContext, _event: CompleteEvent) -> AgentResponse {
        ctx.allow()
    }

    /// Called after the in-flight work for `correlation_id` has been aborted.
    async fn on_cancel(&self, _correlation_id: &CorrelationId, _reason: CancelReason) {}
}

/// Route one request to the matching handler callback.
pub async fn dispatch_event(handler: &dyn AgentHandler, request: AgentRequest) -> AgentResponse {
    let ctx = EventContext {
        correlation_id: request.correlation_id,
        metadata: request.metadata,
    };
    let mut response = match request.event {
        EventPayload::RequestHeaders(e) => handler.on_request_headers(&ctx, e).await,
        EventPayload::RequestBodyChunk(e) => handler.on_request_body_chunk(&ctx, e).await,
        EventPayload::ResponseHeaders(e) => handler.on_response_headers(&ctx, e).await,
        EventPayload::ResponseBodyChunk(e) => handler.on_response_body_chunk(&ctx, e).await,
        EventPayload::Frame(e) => handler.on_frame(&ctx, e).await,
        EventPayload::Complete(e) => handler.on_complete(&ctx, e).await,
    };
    response.correlation_id = ctx.correlation_id;
    response
}

/// Agent server listening on a Unix socket.
pub struct AgentServer {
    id: String,
    socket_path: PathBuf,
    handler: Arc<dyn AgentHandler>,
    encodings: Vec<Encoding>,
    max_message_bytes: usize,
}

impl AgentServer {
    pub fn new(
        id: impl Into<String>,
        socket_path: impl Into<PathBuf>,
        handler: Arc<dyn AgentHandler>,
    ) -> Self {
        let id = id.into();
        let socket_path = socket_path.into();

        debug!(
            agent_id = %id,
            socket_path = %socket_path.display(),
            "Creating agent server"
        );

        Self {
            id,
            socket_path,
            handler,
            encodings: vec![Encoding::MessagePack, Encoding::Json],
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Encodings this agent accepts. The first one the proxy offers wins.
    pub fn with_encodings(mut self, encodings: Vec<Encoding>) -> Self {
        self.encodings = encodings;
        self
    }

    pub fn with_max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    /// Bind the socket, replacing a stale socket file.
    pub fn bind(&self) -> Result<UnixListener, AgentProtocolError> {
        if self.socket_path.exists() {
            trace!(
                agent_id = %self.id,
                socket_path = %self.socket_path.display(),
                "Removing existing socket file"
            );
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(
            agent_id = %self.id,
            socket_path = %self.socket_path.display(),
            "Agent server listening"
        );
        Ok(listener)
    }

    /// Bind and serve until the task is aborted.
    pub async fn run(self) -> Result<(), AgentProtocolError> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Bind now and serve on a background task.
    pub fn spawn(self) -> Result<JoinHandle<()>, AgentProtocolError> {
        let listener = self.bind()?;
        Ok(tokio::spawn(self.serve(listener)))
    }

    async fn serve(self, listener: UnixListener) {
        let server = Arc::new(self);
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    trace!(agent_id = %server.id, "Accepted new connection");
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            error!(
                                agent_id = %server.id,
                                error = %e,
                                "Error handling agent connection"
                            );
                        }
                    });
                }
                Err(e) => {
                    error!(agent_id = %server.id, error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream) -> Result<(), AgentProtocolError> {
        let (mut reader, mut writer) = stream.into_split();

        let (msg_type, bytes) = read_frame(&mut reader, MAX_HANDSHAKE_BYTES).await?;
        if msg_type != MessageType::Handshake {
            return Err(AgentProtocolError::InvalidMessage(format!(
                "Expected Handshake, got {:?}",
                msg_type
            )));
        }
        let request: HandshakeRequest = decode(Encoding::Json, &bytes)?;
        let response = self.answer_handshake(&request);
        let payload = encode(Encoding::Json, &response)?;
        write_frame(&mut writer, MessageType::HandshakeAck, &payload, MAX_HANDSHAKE_BYTES).await?;

        if !response.accepted {
            warn!(
                agent_id = %self.id,
                error = ?response.error,
                "Rejected proxy handshake"
            );
            return Ok(());
        }

        debug!(
            agent_id = %self.id,
            client = %request.client_name,
            encoding = ?response.encoding,
            "Proxy connected"
        );

        serve_connection(
            &self.id,
            reader,
            writer,
            FrameCodec::new(response.encoding, self.max_message_bytes),
            Arc::clone(&self.handler),
        )
        .await
    }

    fn answer_handshake(&self, request: &HandshakeRequest) -> HandshakeResponse {
        let mut response = HandshakeResponse {
            accepted: false,
            protocol_version: PROTOCOL_VERSION,
            agent_id: self.id.clone(),
            agent_name: self.id.clone(),
            encoding: Encoding::Json,
            supported_events: self.handler.events(),
            error: None,
        };

        if request.protocol_version != PROTOCOL_VERSION {
            response.error = Some(format!(
                "Unsupported protocol version {}",
                request.protocol_version
            ));
            return response;
        }

        match request
            .encodings
            .iter()
            .find(|offered| self.encodings.contains(offered))
        {
            Some(encoding) => {
                response.accepted = true;
                response.encoding = *encoding;
            }
            None => response.error = Some("No common encoding".to_string()),
        }
        response
    }
}

type Outbound = (MessageType, Vec<u8>);

/// Serve calls on an established connection until the peer hangs up.
///
/// Every call runs on its own task, so slow calls do not hold up others on
/// the same connection. A cancel aborts every task of that request.
pub async fn serve_connection<R, W>(
    agent_id: &str,
    reader: R,
    writer: W,
    codec: FrameCodec,
    handler: Arc<dyn AgentHandler>,
) -> Result<(), AgentProtocolError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
    let max = codec.max_message_bytes;
    let writer_task = tokio::spawn(async move {
        let mut writer = BufWriter::new(writer);
        while let Some((msg_type, payload)) = rx.recv().await {
            if write_frame(&mut writer, msg_type, &payload, max).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let calls: Arc<Mutex<HashMap<u64, (CorrelationId, AbortHandle)>>> = Arc::default();
    let mut reader = BufReader::new(reader);

    let result = loop {
        let (msg_type, payload) = match read_frame(&mut reader, codec.max_message_bytes).await {
            Ok(frame) => frame,
            Err(AgentProtocolError::ConnectionClosed) => break Ok(()),
            Err(e) => break Err(e),
        };

        match msg_type {
            MessageType::Event => {
                let envelope: CallEnvelope = match codec.decode(&payload) {
                    Ok(envelope) => envelope,
                    Err(e) => break Err(e),
                };
                spawn_call(agent_id, envelope, codec, &handler, &calls, &tx);
            }
            MessageType::Cancel => {
                let cancel: CancelRequest = match codec.decode(&payload) {
                    Ok(cancel) => cancel,
                    Err(e) => break Err(e),
                };
                let aborted = abort_request(&calls, &cancel.correlation_id);
                debug!(
                    agent_id = %agent_id,
                    correlation_id = %cancel.correlation_id,
                    reason = %cancel.reason,
                    aborted,
                    "Cancel received"
                );
                handler.on_cancel(&cancel.correlation_id, cancel.reason).await;
            }
            MessageType::Ping => {
                let _ = tx.send((MessageType::Pong, payload)).await;
            }
            MessageType::Pong => {}
            other => {
                break Err(AgentProtocolError::InvalidMessage(format!(
                    "Unexpected {:?} frame from proxy",
                    other
                )))
            }
        }
    };

    for (_, (_, handle)) in calls.lock().drain() {
        handle.abort();
    }
    drop(tx);
    let _ = writer_task.await;
    trace!(agent_id = %agent_id, "Connection finished");
    result
}

fn spawn_call(
    agent_id: &str,
    envelope: CallEnvelope,
    codec: FrameCodec,
    handler: &Arc<dyn AgentHandler>,
    calls: &Arc<Mutex<HashMap<u64, (CorrelationId, AbortHandle)>>>,
    tx: &mpsc::Sender<Outbound>,
) {
    let call_id = envelope.call_id;
    let correlation_id = envelope.request.correlation_id.clone();
    let handler = Arc::clone(handler);

    let work = tokio::spawn(async move { dispatch_event(handler.as_ref(), envelope.request).await });
    calls
        .lock()
        .insert(call_id, (correlation_id, work.abort_handle()));

    let agent_id = agent_id.to_string();
    let calls = Arc::clone(calls);
    let tx = tx.clone();
    tokio::spawn(async move {
        let outcome = work.await;
        calls.lock().remove(&call_id);

        let frame = match outcome {
            Ok(response) => match codec.encode(&CallReply { call_id, response }) {
                Ok(payload) if codec.check_size(payload.len()).is_ok() => {
                    (MessageType::Response, payload)
                }
                Ok(payload) => call_failure(
                    codec,
                    call_id,
                    format!("Response of {} bytes exceeds limit", payload.len()),
                ),
                Err(e) => call_failure(codec, call_id, e.to_string()),
            },
            Err(e) if e.is_cancelled() => {
                trace!(agent_id = %agent_id, call_id, "Call aborted");
                return;
            }
            Err(e) => {
                error!(agent_id = %agent_id, call_id, error = %e, "Handler failed");
                call_failure(codec, call_id, "Handler failed".to_string())
            }
        };
        let _ = tx.send(frame).await;
    });
}

fn call_failure(codec: FrameCodec, call_id: u64, message: String) -> Outbound {
    let payload = codec
        .encode(&CallFailure { call_id, message })
        .unwrap_or_default();
    (MessageType::CallError, payload)
}

fn abort_request(
    calls: &Mutex<HashMap<u64, (CorrelationId, AbortHandle)>>,
    correlation_id: &CorrelationId,
) -> usize {
    let mut calls = calls.lock();
    let before = calls.len();
    calls.retain(|_, (id, handle)| {
        if id == correlation_id {
            handle.abort();
            false
        } else {
            true
        }
    });
    before - calls.len()
}
