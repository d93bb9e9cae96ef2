//! Decision aggregation for one lifecycle phase.
//!
//! Agents are recorded in invocation order. The first non-allow decision
//! becomes the phase decision; later agents are recorded as skipped.
//! Mutations from allowing agents merge in order:
//!
//! - a later `set` replaces whatever came before for that header
//! - a `remove` stands unless a later agent sets the header again
//! - an `add` after a `remove` reintroduces the header with that value
//!
//! Request-direction and response-direction header sets are independent.
//! Routing metadata merges key by key with later agents winning, and the
//! last body replacement wins.
//!
//! The outcome owns copies of everything it reports; nothing in it refers
//! back to a connection.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use agentgate_agent_protocol::{AgentResponse, AuditMetadata, Decision, EventType, HeaderOp};

use crate::errors::{CallFailure, FailureKind};
use crate::policy::Resolution;

/// Why an agent was not called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Breaker open; the failure policy decided for the agent
    CircuitOpen,
    /// An earlier agent in the phase returned a terminal decision
    ShortCircuit,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::ShortCircuit => "short_circuit",
        }
    }
}

/// What happened to one agent in a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Answered,
    Failed(FailureKind),
    Skipped(SkipReason),
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Answered => f.write_str("answered"),
            Disposition::Failed(kind) => write!(f, "failed: {kind}"),
            Disposition::Skipped(reason) => write!(f, "skipped: {}", reason.as_str()),
        }
    }
}

/// Audit record for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub disposition: Disposition,
    /// The agent's answer, or what the failure policy substituted
    pub decision: Decision,
    /// A failure was resolved by allowing the request
    pub fail_open: bool,
    pub audit: AuditMetadata,
    pub latency: Duration,
    /// Inspection stopped at the agent's body limit
    pub truncated: bool,
    pub error: Option<String>,
}

/// The phase's effective decision plus every per-agent outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedOutcome {
    pub event: EventType,
    pub decision: Decision,
    /// Agent whose decision ended the phase, if any
    pub decided_by: Option<String>,
    pub request_headers: Vec<HeaderOp>,
    pub response_headers: Vec<HeaderOp>,
    pub routing_metadata: BTreeMap<String, String>,
    pub body_replacement: Option<Vec<u8>>,
    pub agents: Vec<AgentOutcome>,
}

impl AggregatedOutcome {
    /// Allow with no agents involved.
    pub fn allow(event: EventType) -> Self {
        PhaseAggregator::new(event).finish()
    }

    pub fn is_allow(&self) -> bool {
        self.decision.is_allow()
    }

    /// Whether any agent saw only part of the body.
    pub fn truncated(&self) -> bool {
        self.agents.iter().any(|a| a.truncated)
    }

    pub fn outcome_for(&self, agent_id: &str) -> Option<&AgentOutcome> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    pub fn has_mutations(&self) -> bool {
        !self.request_headers.is_empty()
            || !self.response_headers.is_empty()
            || !self.routing_metadata.is_empty()
            || self.body_replacement.is_some()
    }

    /// One line per agent, e.g. `waf=skipped: circuit_open`.
    pub fn audit_summary(&self) -> String {
        self.agents
            .iter()
            .map(|a| format!("{}={}", a.agent_id, a.disposition))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Accumulates agent results for one phase.
#[derive(Debug)]
pub struct PhaseAggregator {
    event: EventType,
    decision: Decision,
    decided_by: Option<String>,
    request_headers: HeaderMerge,
    response_headers: HeaderMerge,
    routing_metadata: BTreeMap<String, String>,
    body_replacement: Option<Vec<u8>>,
    agents: Vec<AgentOutcome>,
}

impl PhaseAggregator {
    pub fn new(event: EventType) -> Self {
        Self {
            event,
            decision: Decision::Allow,
            decided_by: None,
            request_headers: HeaderMerge::default(),
            response_headers: HeaderMerge::default(),
            routing_metadata: BTreeMap::new(),
            body_replacement: None,
            agents: Vec::new(),
        }
    }

    /// A terminal decision has been reached; remaining agents are skipped.
    pub fn is_terminal(&self) -> bool {
        !self.decision.is_allow()
    }

    pub fn recorded(&self) -> usize {
        self.agents.len()
    }

    pub fn record_response(
        &mut self,
        agent_id: &str,
        response: AgentResponse,
        latency: Duration,
        truncated: bool,
    ) {
        let AgentResponse {
            decision,
            request_headers,
            response_headers,
            routing_metadata,
            audit,
            body_replacement,
            ..
        } = response;

        // Audit-only phases record what agents said and apply nothing.
        // A non-allow answer contributes its decision but none of its mutations.
        if !self.event.is_audit_only() && decision.is_allow() {
            for op in request_headers {
                self.request_headers.apply(op);
            }
            for op in response_headers {
                self.response_headers.apply(op);
            }
            self.routing_metadata.extend(routing_metadata);
            if body_replacement.is_some() {
                self.body_replacement = body_replacement;
            }
        }
        if !self.event.is_audit_only() {
            self.decide(agent_id, &decision);
        }

        self.agents.push(AgentOutcome {
            agent_id: agent_id.to_string(),
            disposition: Disposition::Answered,
            decision,
            fail_open: false,
            audit,
            latency,
            truncated,
            error: None,
        });
    }

    pub fn record_failure(
        &mut self,
        agent_id: &str,
        failure: &CallFailure,
        resolution: Resolution,
        truncated: bool,
    ) {
        let disposition = match failure.kind {
            FailureKind::CircuitOpen => Disposition::Skipped(SkipReason::CircuitOpen),
            kind => Disposition::Failed(kind),
        };
        if !self.event.is_audit_only() {
            self.decide(agent_id, &resolution.decision);
        }
        self.agents.push(AgentOutcome {
            agent_id: agent_id.to_string(),
            disposition,
            fail_open: resolution.is_fail_open(),
            decision: resolution.decision,
            audit: AuditMetadata::default(),
            latency: failure.elapsed,
            truncated,
            error: Some(failure.message.clone()),
        });
    }

    pub fn record_short_circuit(&mut self, agent_id: &str) {
        self.agents.push(AgentOutcome {
            agent_id: agent_id.to_string(),
            disposition: Disposition::Skipped(SkipReason::ShortCircuit),
            decision: Decision::Allow,
            fail_open: false,
            audit: AuditMetadata::default(),
            latency: Duration::ZERO,
            truncated: false,
            error: None,
        });
    }

    fn decide(&mut self, agent_id: &str, decision: &Decision) {
        if !decision.is_allow() && self.decision.is_allow() {
            self.decision = decision.clone();
            self.decided_by = Some(agent_id.to_string());
        }
    }

    pub fn finish(self) -> AggregatedOutcome {
        AggregatedOutcome {
            event: self.event,
            decision: self.decision,
            decided_by: self.decided_by,
            request_headers: self.request_headers.into_ops(),
            response_headers: self.response_headers.into_ops(),
            routing_metadata: self.routing_metadata,
            body_replacement: self.body_replacement,
            agents: self.agents,
        }
    }
}

/// Net effect on one header after every agent's operations.
#[derive(Debug, Clone)]
enum HeaderState {
    Set { value: String, appended: Vec<String> },
    Added(Vec<String>),
    Removed,
}

/// Ordered per-header merge; names compare case-insensitively and keep the
/// position of their first appearance.
#[derive(Debug, Default)]
struct HeaderMerge {
    entries: Vec<(String, HeaderState)>,
}

impl HeaderMerge {
    fn apply(&mut self, op: HeaderOp) {
        let position = self
            .entries
            .iter()
            .position(|(name, _)| name.eq_ignore_ascii_case(op.name()));

        let (name, next) = match op {
            HeaderOp::Set { name, value } => (
                name,
                HeaderState::Set {
                    value,
                    appended: Vec::new(),
                },
            ),
            HeaderOp::Remove { name } => (name, HeaderState::Removed),
            HeaderOp::Add { name, value } => {
                let current = position.map(|i| self.entries[i].1.clone());
                let next = match current {
                    Some(HeaderState::Set { value: base, mut appended }) => {
                        appended.push(value);
                        HeaderState::Set {
                            value: base,
                            appended,
                        }
                    }
                    Some(HeaderState::Added(mut values)) => {
                        values.push(value);
                        HeaderState::Added(values)
                    }
                    Some(HeaderState::Removed) => HeaderState::Set {
                        value,
                        appended: Vec::new(),
                    },
                    None => HeaderState::Added(vec![value]),
                };
                (name, next)
            }
        };

        match position {
            Some(i) => self.entries[i].1 = next,
            None => self.entries.push((name, next)),
        }
    }

    fn into_ops(self) -> Vec<HeaderOp> {
        let mut ops = Vec::with_capacity(self.entries.len());
        for (name, state) in self.entries {
            match state {
                HeaderState::Set { value, appended } => {
                    ops.push(HeaderOp::set(name.clone(), value));
                    ops.extend(appended.into_iter().map(|v| HeaderOp::add(name.clone(), v)));
                }
                HeaderState::Added(values) => {
                    ops.extend(values.into_iter().map(|v| HeaderOp::add(name.clone(), v)));
                }
                HeaderState::Removed => ops.push(HeaderOp::remove(name)),
            }
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_common::{CorrelationId, FailureMode};

    fn allow() -> AgentResponse {
        AgentResponse::default_allow(CorrelationId::from("c"))
    }

    fn merged(ops: Vec<Vec<HeaderOp>>) -> Vec<HeaderOp> {
        let mut agg = PhaseAggregator::new(EventType::RequestHeaders);
        for (i, agent_ops) in ops.into_iter().enumerate() {
            let mut response = allow();
            response.request_headers = agent_ops;
            agg.record_response(&format!("a{i}"), response, Duration::ZERO, false);
        }
        agg.finish().request_headers
    }

    #[test]
    fn test_later_set_wins() {
        let ops = merged(vec![
            vec![HeaderOp::set("X", "1")],
            vec![HeaderOp::set("X", "2")],
        ]);
        assert_eq!(ops, vec![HeaderOp::set("X", "2")]);
    }

    #[test]
    fn test_remove_holds_unless_reset() {
        let ops = merged(vec![
            vec![HeaderOp::set("x-user", "alice"), HeaderOp::set("x-trace", "1")],
            vec![HeaderOp::remove("X-User")],
        ]);
        assert_eq!(ops, vec![HeaderOp::remove("x-user"), HeaderOp::set("x-trace", "1")]);

        let ops = merged(vec![
            vec![HeaderOp::remove("x-user")],
            vec![HeaderOp::set("x-user", "bob")],
        ]);
        assert_eq!(ops, vec![HeaderOp::set("x-user", "bob")]);
    }

    #[test]
    fn test_add_semantics() {
        let ops = merged(vec![
            vec![HeaderOp::add("x-tag", "a")],
            vec![HeaderOp::add("x-tag", "b")],
        ]);
        assert_eq!(ops, vec![HeaderOp::add("x-tag", "a"), HeaderOp::add("x-tag", "b")]);

        let ops = merged(vec![
            vec![HeaderOp::set("x-tag", "a")],
            vec![HeaderOp::add("x-tag", "b")],
        ]);
        assert_eq!(ops, vec![HeaderOp::set("x-tag", "a"), HeaderOp::add("x-tag", "b")]);

        let ops = merged(vec![
            vec![HeaderOp::remove("x-tag")],
            vec![HeaderOp::add("x-tag", "c")],
        ]);
        assert_eq!(ops, vec![HeaderOp::set("x-tag", "c")]);
    }

    #[test]
    fn test_first_terminal_decision_wins() {
        let mut agg = PhaseAggregator::new(EventType::RequestHeaders);
        agg.record_response("auth", allow().with_routing_metadata("user", "a"), Duration::ZERO, false);
        assert!(!agg.is_terminal());

        let blocked = AgentResponse::block(CorrelationId::from("c"), 403, None);
        agg.record_response("waf", blocked, Duration::ZERO, false);
        assert!(agg.is_terminal());
        agg.record_short_circuit("bot");

        let outcome = agg.finish();
        assert_eq!(outcome.decision, Decision::block(403));
        assert_eq!(outcome.decided_by.as_deref(), Some("waf"));
        assert_eq!(outcome.routing_metadata["user"], "a");
        assert_eq!(
            outcome.outcome_for("bot").unwrap().disposition,
            Disposition::Skipped(SkipReason::ShortCircuit)
        );
    }

    #[test]
    fn test_blocking_agent_mutations_are_dropped() {
        let mut agg = PhaseAggregator::new(EventType::RequestBodyChunk);
        agg.record_response(
            "auth",
            allow().add_request_header(HeaderOp::set("x-auth", "ok")),
            Duration::ZERO,
            false,
        );

        let mut blocked = AgentResponse::block(CorrelationId::from("c"), 403, None)
            .add_request_header(HeaderOp::set("x-leak", "1"))
            .add_response_header(HeaderOp::set("x-leak", "1"))
            .with_routing_metadata("upstream", "internal");
        blocked.body_replacement = Some(b"rewritten".to_vec());
        agg.record_response("waf", blocked, Duration::ZERO, false);

        let outcome = agg.finish();
        assert_eq!(outcome.decision, Decision::block(403));
        assert_eq!(outcome.decided_by.as_deref(), Some("waf"));
        assert_eq!(outcome.request_headers, vec![HeaderOp::set("x-auth", "ok")]);
        assert!(outcome.response_headers.is_empty());
        assert!(outcome.routing_metadata.is_empty());
        assert!(outcome.body_replacement.is_none());
    }

    #[test]
    fn test_routing_metadata_and_body_replacement_later_wins() {
        let mut agg = PhaseAggregator::new(EventType::RequestBodyChunk);
        let mut first = allow().with_routing_metadata("tier", "free");
        first.body_replacement = Some(b"one".to_vec());
        let mut second = allow().with_routing_metadata("tier", "pro");
        second.body_replacement = Some(b"two".to_vec());

        agg.record_response("a", first, Duration::ZERO, false);
        agg.record_response("b", second, Duration::ZERO, true);

        let outcome = agg.finish();
        assert_eq!(outcome.routing_metadata["tier"], "pro");
        assert_eq!(outcome.body_replacement.as_deref(), Some(&b"two"[..]));
        assert!(outcome.truncated());
    }

    #[test]
    fn test_fail_open_failure_is_recorded_without_mutations() {
        let mut agg = PhaseAggregator::new(EventType::RequestHeaders);
        agg.record_response(
            "auth",
            allow().add_request_header(HeaderOp::set("x-auth", "ok")),
            Duration::ZERO,
            false,
        );
        agg.record_failure(
            "waf",
            &CallFailure::circuit_open("waf"),
            Resolution {
                decision: Decision::Allow,
                mode: FailureMode::Open,
            },
            false,
        );

        let outcome = agg.finish();
        assert!(outcome.is_allow());
        assert_eq!(outcome.request_headers, vec![HeaderOp::set("x-auth", "ok")]);
        let waf = outcome.outcome_for("waf").unwrap();
        assert!(waf.fail_open);
        assert_eq!(waf.disposition.to_string(), "skipped: circuit_open");
        assert_eq!(outcome.audit_summary(), "auth=answered, waf=skipped: circuit_open");
    }

    #[test]
    fn test_audit_only_phase_never_blocks() {
        let mut agg = PhaseAggregator::new(EventType::Complete);
        let blocked = AgentResponse::block(CorrelationId::from("c"), 403, None)
            .add_request_header(HeaderOp::set("x", "1"));
        agg.record_response("audit", blocked, Duration::ZERO, false);

        let outcome = agg.finish();
        assert!(outcome.is_allow());
        assert!(!outcome.has_mutations());
        assert_eq!(outcome.agents[0].decision, Decision::block(403));
    }

    #[test]
    fn test_empty_phase_allows() {
        let outcome = AggregatedOutcome::allow(EventType::ResponseHeaders);
        assert!(outcome.is_allow());
        assert!(outcome.agents.is_empty());
        assert_eq!(outcome.audit_summary(), "");
    }
}
