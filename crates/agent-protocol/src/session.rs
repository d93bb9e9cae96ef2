//! Multiplexed call session over a framed byte stream.
//!
//! Used by both the local stream transport (proxy dials the agent) and the
//! reverse transport (agent dials the proxy). Once the connection-specific
//! handshake is done, both look identical: a reader task routes responses to
//! waiting calls by call id, and a writer task serialises outbound frames.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use agentgate_common::CorrelationId;

use crate::errors::AgentProtocolError;
use crate::framing::{
    read_frame, write_frame, CallEnvelopeRef, CallFailure, CallReply, FrameCodec, MessageType,
    PingFrame,
};
use crate::pending::PendingCalls;
use crate::protocol::{AgentRequest, AgentResponse, CancelReason, CancelRequest};

/// Outbound frame queue depth per connection.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

type Outbound = (MessageType, Vec<u8>);

/// One established, multiplexed connection to an agent.
pub struct FramedSession {
    agent_id: String,
    peer: String,
    codec: FrameCodec,
    outbound: mpsc::Sender<Outbound>,
    pending: Arc<PendingCalls>,
    pings: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>,
    next_nonce: AtomicU64,
    connected: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl FramedSession {
    /// Start the reader and writer tasks on an already-handshaken stream.
    pub fn spawn<R, W>(
        agent_id: impl Into<String>,
        peer: impl Into<String>,
        reader: R,
        writer: W,
        codec: FrameCodec,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let agent_id = agent_id.into();
        let peer = peer.into();
        let (tx, rx) = mpsc::channel::<Outbound>(CHANNEL_BUFFER_SIZE);
        let pending = Arc::new(PendingCalls::default());
        let pings: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>> = Arc::default();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_task = tokio::spawn(run_writer(
            agent_id.clone(),
            BufWriter::new(writer),
            rx,
            codec.max_message_bytes,
            Arc::clone(&connected),
        ));

        let reader_task = tokio::spawn(run_reader(
            BufReader::new(reader),
            ReaderState {
                agent_id: agent_id.clone(),
                codec,
                pending: Arc::clone(&pending),
                pings: Arc::clone(&pings),
                connected: Arc::clone(&connected),
                outbound: tx.clone(),
            },
        ));

        debug!(agent_id = %agent_id, peer = %peer, encoding = ?codec.encoding, "Session established");

        Self {
            agent_id,
            peer,
            codec,
            outbound: tx,
            pending,
            pings,
            next_nonce: AtomicU64::new(0),
            connected,
            reader_task,
            writer_task,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send one event and wait for its terminal response.
    ///
    /// Carries no deadline of its own: the caller bounds it. Dropping the
    /// returned future forgets the call, so a late response is discarded.
    pub async fn call(&self, request: &AgentRequest) -> Result<AgentResponse, AgentProtocolError> {
        if !self.is_connected() {
            return Err(AgentProtocolError::ConnectionClosed);
        }

        let (call_id, rx, _guard) = self.pending.register(&request.correlation_id);
        let payload = self.codec.encode(&CallEnvelopeRef { call_id, request })?;
        // Rejected before any byte hits the wire, so the stream stays usable
        self.codec.check_size(payload.len())?;

        trace!(
            agent_id = %self.agent_id,
            correlation_id = %request.correlation_id,
            call_id,
            event = %request.event_type(),
            bytes = payload.len(),
            "Sending event"
        );

        self.outbound
            .send((MessageType::Event, payload))
            .await
            .map_err(|_| AgentProtocolError::ConnectionClosed)?;

        rx.await.map_err(|_| AgentProtocolError::ConnectionClosed)?
    }

    /// Ask the agent to abandon every call for one request.
    pub async fn cancel(
        &self,
        correlation_id: &CorrelationId,
        reason: CancelReason,
    ) -> Result<(), AgentProtocolError> {
        let forgotten = self.pending.forget_request(correlation_id);
        let payload = self
            .codec
            .encode(&CancelRequest::new(correlation_id.clone(), reason))?;
        self.outbound
            .send((MessageType::Cancel, payload))
            .await
            .map_err(|_| AgentProtocolError::ConnectionClosed)?;

        debug!(
            agent_id = %self.agent_id,
            correlation_id = %correlation_id,
            reason = %reason,
            forgotten,
            "Cancel sent"
        );
        Ok(())
    }

    /// Round-trip a ping frame.
    pub async fn ping(&self, timeout: Duration) -> Result<Duration, AgentProtocolError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pings.lock().insert(nonce, tx);

        let start = Instant::now();
        let payload = self.codec.encode(&PingFrame { nonce })?;
        let sent = self.outbound.send((MessageType::Ping, payload)).await;
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

    /// Close the connection, failing every waiting call.
    pub fn close(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            debug!(agent_id = %self.agent_id, peer = %self.peer, "Closing session");
        }
        self.reader_task.abort();
        self.writer_task.abort();
        self.pending.fail_all(&AgentProtocolError::ConnectionClosed);
    }
}

impl Drop for FramedSession {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for FramedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedSession")
            .field("agent_id", &self.agent_id)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

async fn run_writer<W: AsyncWrite + Unpin>(
    agent_id: String,
    mut writer: BufWriter<W>,
    mut rx: mpsc::Receiver<Outbound>,
    max_message_bytes: usize,
    connected: Arc<AtomicBool>,
) {
    while let Some((msg_type, payload)) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, msg_type, &payload, max_message_bytes).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to write frame");
            connected.store(false, Ordering::Release);
            break;
        }
    }
    let _ = writer.shutdown().await;
    trace!(agent_id = %agent_id, "Writer task ended");
}

/// Reader-side routing state. Holds no stream, so it is `Sync` whatever the
/// reader half is.
struct ReaderState {
    agent_id: String,
    codec: FrameCodec,
    pending: Arc<PendingCalls>,
    pings: Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>,
    connected: Arc<AtomicBool>,
    outbound: mpsc::Sender<Outbound>,
}

async fn run_reader<R: AsyncRead + Unpin>(mut reader: BufReader<R>, state: ReaderState) {
    let cause = loop {
        let (msg_type, payload) =
            match read_frame(&mut reader, state.codec.max_message_bytes).await {
                Ok(frame) => frame,
                Err(e) => break e,
            };

        if let Err(e) = state.handle_frame(msg_type, &payload) {
            break e;
        }
    };

    state.connected.store(false, Ordering::Release);
    match &cause {
        AgentProtocolError::ConnectionClosed => {
            debug!(agent_id = %state.agent_id, "Agent closed connection")
        }
        e => warn!(agent_id = %state.agent_id, error = %e, "Closing connection after read error"),
    }
    state.pending.fail_all(&cause);
    state.pings.lock().clear();
}

impl ReaderState {
    /// Route one inbound frame. Never waits: a stalled writer must not stop
    /// responses from reaching their callers.
    fn handle_frame(&self, msg_type: MessageType, payload: &[u8]) -> Result<(), AgentProtocolError> {
        match msg_type {
            MessageType::Response => {
                let reply: CallReply = self.codec.decode(payload)?;
                if !self.pending.complete(reply.call_id, Ok(reply.response)) {
                    trace!(agent_id = %self.agent_id, call_id = reply.call_id, "Discarding late response");
                }
            }
            MessageType::CallError => {
                let failure: CallFailure = self.codec.decode(payload)?;
                self.pending.complete(
                    failure.call_id,
                    Err(AgentProtocolError::Rejected(failure.message)),
                );
            }
            MessageType::Pong => {
                let pong: PingFrame = self.codec.decode(payload)?;
                if let Some(tx) = self.pings.lock().remove(&pong.nonce) {
                    let _ = tx.send(());
                }
            }
            MessageType::Ping => {
                match self.outbound.try_send((MessageType::Pong, payload.to_vec())) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(agent_id = %self.agent_id, "Outbound queue full, dropping pong");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Err(AgentProtocolError::ConnectionClosed);
                    }
                }
            }
            other => {
                return Err(AgentProtocolError::InvalidMessage(format!(
                    "Unexpected {:?} frame from agent",
                    other
                )));
            }
        }
        Ok(())
    }
}
