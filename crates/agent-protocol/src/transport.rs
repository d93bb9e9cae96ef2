//! Transport abstraction over the three ways of reaching an agent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use agentgate_common::CorrelationId;

use crate::errors::AgentProtocolError;
use crate::local::{self, LocalStreamOptions};
use crate::protocol::{AgentRequest, AgentResponse, CancelReason};
use crate::rpc::{RpcOptions, RpcSession};
use crate::session::FramedSession;

/// How an agent is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Proxy dials the agent's local socket
    LocalStream,
    /// Proxy dials a remote RPC endpoint
    Rpc,
    /// Agent dialed the proxy
    Reverse,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::LocalStream => "local_stream",
            TransportKind::Rpc => "rpc",
            TransportKind::Reverse => "reverse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to open connections to one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEndpoint {
    LocalStream(LocalStreamOptions),
    Rpc(RpcOptions),
    /// Connections arrive through the reverse listener; the proxy never dials.
    Reverse,
}

impl TransportEndpoint {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportEndpoint::LocalStream(_) => TransportKind::LocalStream,
            TransportEndpoint::Rpc(_) => TransportKind::Rpc,
            TransportEndpoint::Reverse => TransportKind::Reverse,
        }
    }

    /// Open one connection, bounded by the endpoint's connect timeout.
    pub async fn connect(&self, agent_id: &str) -> Result<AgentTransport, AgentProtocolError> {
        match self {
            TransportEndpoint::LocalStream(options) => {
                let (session, _ack) = local::connect(agent_id, options).await?;
                Ok(AgentTransport::LocalStream(session))
            }
            TransportEndpoint::Rpc(options) => {
                Ok(AgentTransport::Rpc(RpcSession::connect(agent_id, options).await?))
            }
            TransportEndpoint::Reverse => Err(AgentProtocolError::Unavailable(format!(
                "No reverse connection registered for agent '{}'",
                agent_id
            ))),
        }
    }
}

/// One live connection to an agent.
#[derive(Debug)]
pub enum AgentTransport {
    LocalStream(FramedSession),
    Rpc(RpcSession),
    Reverse(FramedSession),
}

impl AgentTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            AgentTransport::LocalStream(_) => TransportKind::LocalStream,
            AgentTransport::Rpc(_) => TransportKind::Rpc,
            AgentTransport::Reverse(_) => TransportKind::Reverse,
        }
    }

    /// Send one event and wait for its terminal response. Unbounded: the
    /// caller applies the deadline.
    pub async fn call(&self, request: &AgentRequest) -> Result<AgentResponse, AgentProtocolError> {
        match self {
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => s.call(request).await,
            AgentTransport::Rpc(s) => s.call(request).await,
        }
    }

    /// Deliver several events of one request as a single logical call.
    ///
    /// The RPC stream carries them natively and answers once. Framed
    /// connections answer each event; those answers are folded, stopping at
    /// the first non-allow decision.
    pub async fn call_sequence(
        &self,
        requests: &[AgentRequest],
    ) -> Result<AgentResponse, AgentProtocolError> {
        match self {
            AgentTransport::Rpc(s) => s.call_sequence(requests).await,
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => {
                let mut folded: Option<AgentResponse> = None;
                for request in requests {
                    let response = s.call(request).await?;
                    let terminal = !response.decision.is_allow();
                    folded = Some(match folded {
                        None => response,
                        Some(acc) => fold_response(acc, response),
                    });
                    if terminal {
                        break;
                    }
                }
                folded.ok_or_else(|| {
                    AgentProtocolError::InvalidMessage("Empty call sequence".to_string())
                })
            }
        }
    }

    /// Tell the agent to abandon every call of one request.
    pub async fn cancel(
        &self,
        correlation_id: &CorrelationId,
        reason: CancelReason,
    ) -> Result<(), AgentProtocolError> {
        match self {
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => {
                s.cancel(correlation_id, reason).await
            }
            AgentTransport::Rpc(s) => s.cancel(correlation_id, reason).await,
        }
    }

    pub async fn ping(&self, timeout: Duration) -> Result<Duration, AgentProtocolError> {
        match self {
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => s.ping(timeout).await,
            AgentTransport::Rpc(s) => s.ping(timeout).await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => s.is_connected(),
            AgentTransport::Rpc(s) => s.is_connected(),
        }
    }

    /// Calls awaiting a response on this connection.
    pub fn in_flight(&self) -> usize {
        match self {
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => s.in_flight(),
            AgentTransport::Rpc(s) => s.in_flight(),
        }
    }

    pub fn close(&self) {
        match self {
            AgentTransport::LocalStream(s) | AgentTransport::Reverse(s) => s.close(),
            AgentTransport::Rpc(s) => s.close(),
        }
    }
}

/// Merge a later answer into an earlier one for the same logical call.
fn fold_response(mut acc: AgentResponse, next: AgentResponse) -> AgentResponse {
    acc.decision = next.decision;
    acc.request_headers.extend(next.request_headers);
    acc.response_headers.extend(next.response_headers);
    acc.routing_metadata.extend(next.routing_metadata);
    if next.body_replacement.is_some() {
        acc.body_replacement = next.body_replacement;
    }
    acc.audit.tags.extend(next.audit.tags);
    acc.audit.rule_ids.extend(next.audit.rule_ids);
    acc.audit.reason_codes.extend(next.audit.reason_codes);
    acc.audit.custom.extend(next.audit.custom);
    if next.audit.confidence.is_some() {
        acc.audit.confidence = next.audit.confidence;
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuditMetadata, Decision, HeaderOp};

    #[test]
    fn test_endpoint_deserialize() {
        let json = r#"{"type":"local_stream","path":"/run/waf.sock"}"#;
        let endpoint: TransportEndpoint = serde_json::from_str(json).unwrap();
        assert_eq!(endpoint.kind(), TransportKind::LocalStream);

        let json = r#"{"type":"rpc","endpoint":"http://10.0.0.1:50051","connect_timeout_ms":250}"#;
        let endpoint: TransportEndpoint = serde_json::from_str(json).unwrap();
        match endpoint {
            TransportEndpoint::Rpc(options) => assert_eq!(options.connect_timeout_ms, 250),
            other => panic!("unexpected {:?}", other),
        }

        let endpoint: TransportEndpoint = serde_json::from_str(r#"{"type":"reverse"}"#).unwrap();
        assert_eq!(endpoint, TransportEndpoint::Reverse);
    }

    #[tokio::test]
    async fn test_reverse_endpoint_cannot_dial() {
        let err = TransportEndpoint::Reverse.connect("waf").await.unwrap_err();
        assert!(matches!(err, AgentProtocolError::Unavailable(_)));
    }

    #[test]
    fn test_fold_response_keeps_later_decision_and_all_mutations() {
        let id = CorrelationId::from("c");
        let first = AgentResponse::default_allow(id.clone())
            .add_request_header(HeaderOp::set("x-a", "1"))
            .with_routing_metadata("k", "1")
            .with_audit(AuditMetadata {
                tags: vec!["first".into()],
                ..Default::default()
            });
        let second = AgentResponse::with_decision(id, Decision::block(403))
            .add_request_header(HeaderOp::set("x-b", "2"))
            .with_routing_metadata("k", "2");

        let folded = fold_response(first, second);
        assert_eq!(folded.decision, Decision::block(403));
        assert_eq!(folded.request_headers.len(), 2);
        assert_eq!(folded.routing_metadata["k"], "2");
        assert_eq!(folded.audit.tags, vec!["first".to_string()]);
    }
}
