//! Bookkeeping for calls awaiting a response on a multiplexed connection.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

use agentgate_common::CorrelationId;

use crate::errors::AgentProtocolError;
use crate::protocol::AgentResponse;

pub(crate) type CallResult = Result<AgentResponse, AgentProtocolError>;

struct PendingCall {
    correlation_id: CorrelationId,
    tx: oneshot::Sender<CallResult>,
}

/// In-flight calls keyed by a per-connection call id.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
}

impl PendingCalls {
    /// Register a call; the returned guard forgets it if the caller gives up.
    pub(crate) fn register(
        self: &Arc<Self>,
        correlation_id: &CorrelationId,
    ) -> (u64, oneshot::Receiver<CallResult>, PendingGuard) {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(
            call_id,
            PendingCall {
                correlation_id: correlation_id.clone(),
                tx,
            },
        );
        let guard = PendingGuard {
            calls: Arc::clone(self),
            call_id,
        };
        (call_id, rx, guard)
    }

    /// Deliver a result. Returns false for unknown (late or cancelled) calls.
    pub(crate) fn complete(&self, call_id: u64, result: CallResult) -> bool {
        match self.calls.lock().remove(&call_id) {
            Some(call) => call.tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every waiting call with a copy of `cause`.
    pub(crate) fn fail_all(&self, cause: &AgentProtocolError) {
        let drained: Vec<PendingCall> = self.calls.lock().drain().map(|(_, c)| c).collect();
        for call in drained {
            let _ = call.tx.send(Err(cause.replicate()));
        }
    }

    /// Forget every call belonging to one request.
    pub(crate) fn forget_request(&self, correlation_id: &CorrelationId) -> usize {
        let mut calls = self.calls.lock();
        let before = calls.len();
        calls.retain(|_, call| &call.correlation_id != correlation_id);
        before - calls.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

/// Removes the pending entry when a call future is dropped before completion.
pub(crate) struct PendingGuard {
    calls: Arc<PendingCalls>,
    call_id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.calls.lock().remove(&self.call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_delivers_once() {
        let calls = Arc::new(PendingCalls::default());
        let corr = CorrelationId::from("c1");
        let (id, rx, _guard) = calls.register(&corr);

        assert!(calls.complete(id, Ok(AgentResponse::default_allow(corr.clone()))));
        assert!(!calls.complete(id, Ok(AgentResponse::default_allow(corr))));
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_guard_forgets_abandoned_call() {
        let calls = Arc::new(PendingCalls::default());
        let (_, _rx, guard) = calls.register(&CorrelationId::from("c1"));
        assert_eq!(calls.len(), 1);
        drop(guard);
        assert_eq!(calls.len(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_replicates_cause() {
        let calls = Arc::new(PendingCalls::default());
        let (_, rx1, _g1) = calls.register(&CorrelationId::from("a"));
        let (_, rx2, _g2) = calls.register(&CorrelationId::from("b"));

        calls.fail_all(&AgentProtocolError::MessageTooLarge { size: 9, max: 4 });

        for rx in [rx1, rx2] {
            assert!(matches!(
                rx.await.unwrap(),
                Err(AgentProtocolError::MessageTooLarge { size: 9, max: 4 })
            ));
        }
    }

    #[test]
    fn test_forget_request_only_touches_that_request() {
        let calls = Arc::new(PendingCalls::default());
        let (_, _rx1, _g1) = calls.register(&CorrelationId::from("a"));
        let (_, _rx2, _g2) = calls.register(&CorrelationId::from("a"));
        let (_, _rx3, _g3) = calls.register(&CorrelationId::from("b"));
        assert_eq!(calls.forget_request(&CorrelationId::from("a")), 2);
        assert_eq!(calls.len(), 1);
    }
}
