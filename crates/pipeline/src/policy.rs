//! Failure policy: turns a failed call into an effective decision.

use tracing::{debug, warn};

use agentgate_agent_protocol::Decision;
use agentgate_common::{CorrelationId, FailureMode};

use crate::config::AgentDefinition;
use crate::errors::CallFailure;

/// Effective decision for a failed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub decision: Decision,
    pub mode: FailureMode,
}

impl Resolution {
    pub fn is_fail_open(&self) -> bool {
        self.mode == FailureMode::Open
    }
}

/// Resolves failures per the agent's configured failure mode.
///
/// - `closed`: block with the agent's configured status and body
/// - `open`: allow with no mutations from the failed agent
///
/// Every failure kind goes through the same resolution, oversized messages
/// included.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailurePolicy;

impl FailurePolicy {
    pub fn resolve(
        &self,
        agent: &AgentDefinition,
        correlation_id: &CorrelationId,
        failure: &CallFailure,
    ) -> Resolution {
        match agent.failure_mode {
            FailureMode::Closed => {
                debug!(
                    correlation_id = %correlation_id,
                    agent_id = %agent.id,
                    kind = %failure.kind,
                    status = agent.fail_closed.status,
                    "Blocking request after agent failure (fail-closed)"
                );
                Resolution {
                    decision: Decision::Block {
                        status: agent.fail_closed.status,
                        body: agent.fail_closed.body.clone(),
                        headers: Vec::new(),
                    },
                    mode: FailureMode::Closed,
                }
            }
            FailureMode::Open => {
                warn!(
                    correlation_id = %correlation_id,
                    agent_id = %agent.id,
                    kind = %failure.kind,
                    error = %failure.message,
                    "Continuing despite agent failure (fail-open)"
                );
                Resolution {
                    decision: Decision::Allow,
                    mode: FailureMode::Open,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use agentgate_agent_protocol::TransportEndpoint;
    use std::time::Duration;

    fn failure(kind: FailureKind) -> CallFailure {
        CallFailure::new(kind, "simulated", Duration::from_millis(3))
    }

    #[test]
    fn test_fail_closed_uses_configured_response() {
        let agent = AgentDefinition::new("auth", TransportEndpoint::Reverse)
            .with_fail_closed(401, Some("unauthorized".into()));

        let resolution = FailurePolicy.resolve(
            &agent,
            &CorrelationId::from("c"),
            &failure(FailureKind::ConnectTimeout),
        );

        assert!(!resolution.is_fail_open());
        assert_eq!(
            resolution.decision,
            Decision::Block {
                status: 401,
                body: Some("unauthorized".into()),
                headers: Vec::new(),
            }
        );
    }

    #[test]
    fn test_fail_open_allows_every_kind() {
        let agent = AgentDefinition::new("waf", TransportEndpoint::Reverse)
            .with_failure_mode(FailureMode::Open);

        for kind in [
            FailureKind::CallTimeout,
            FailureKind::TransportError,
            FailureKind::MessageTooLarge,
            FailureKind::CircuitOpen,
            FailureKind::AgentProtocolError,
        ] {
            let resolution = FailurePolicy.resolve(&agent, &CorrelationId::from("c"), &failure(kind));
            assert_eq!(resolution.decision, Decision::Allow, "{kind}");
            assert!(resolution.is_fail_open());
        }
    }

    #[test]
    fn test_message_too_large_blocks_when_closed() {
        let agent = AgentDefinition::new("dlp", TransportEndpoint::Reverse);
        let resolution = FailurePolicy.resolve(
            &agent,
            &CorrelationId::from("c"),
            &failure(FailureKind::MessageTooLarge),
        );
        assert_eq!(resolution.decision, Decision::block(503));
    }
}
