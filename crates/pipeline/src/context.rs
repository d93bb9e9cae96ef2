//! Per-request call context.

use dashmap::DashSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use agentgate_agent_protocol::{CancelReason, EventType, RequestMetadata};
use agentgate_common::CorrelationId;

/// Everything the pipeline knows about one request.
///
/// The correlation id is fixed at construction and threaded through every
/// agent call. Cancelling the context reaches every call still in flight for
/// the request.
#[derive(Debug)]
pub struct CallContext {
    correlation_id: CorrelationId,
    route_id: String,
    metadata: RequestMetadata,
    phase_deadline: Mutex<Option<Instant>>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    in_flight: Arc<DashSet<(String, EventType)>>,
}

impl CallContext {
    pub fn new(
        correlation_id: CorrelationId,
        route_id: impl Into<String>,
        metadata: RequestMetadata,
    ) -> Self {
        let route_id = route_id.into();
        let metadata = if metadata.route_id.is_none() {
            metadata.with_route(route_id.clone())
        } else {
            metadata
        };
        Self {
            correlation_id,
            route_id,
            metadata,
            phase_deadline: Mutex::new(None),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    pub fn metadata(&self) -> &RequestMetadata {
        &self.metadata
    }

    /// Bound every call of the coming phase by `deadline` in addition to
    /// each agent's own timeout.
    pub fn set_phase_deadline(&self, deadline: Option<Instant>) {
        *self.phase_deadline.lock() = deadline;
    }

    pub fn phase_deadline(&self) -> Option<Instant> {
        *self.phase_deadline.lock()
    }

    /// Cancel every in-flight call of this request. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut current = self.cancel_reason.lock();
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        debug!(
            correlation_id = %self.correlation_id,
            reason = %reason,
            "Request cancelled"
        );
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel_reason.lock()
    }

    /// Resolves once the request is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Same request, fresh cancellation scope. Audit-only phases run here so
    /// a blocked or abandoned request is still reported.
    pub fn detached(&self) -> CallContext {
        CallContext {
            correlation_id: self.correlation_id.clone(),
            route_id: self.route_id.clone(),
            metadata: self.metadata.clone(),
            phase_deadline: Mutex::new(None),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Claim the (agent, phase) slot for one call. `None` if a call for the
    /// same agent and phase is already in flight.
    pub(crate) fn begin_call(&self, agent_id: &str, event: EventType) -> Option<InFlightCall> {
        let key = (agent_id.to_string(), event);
        if !self.in_flight.insert(key.clone()) {
            return None;
        }
        Some(InFlightCall {
            set: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Calls currently in flight for this request.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Releases its (agent, phase) slot on drop.
pub(crate) struct InFlightCall {
    set: Arc<DashSet<(String, EventType)>>,
    key: (String, EventType),
}

impl Drop for InFlightCall {
    fn drop(&mut self) {
        self.set.remove(&self.key);
    }
}
