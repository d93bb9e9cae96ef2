//! Agent definitions, route bindings and their validation.
//!
//! File parsing stays with the caller: any serde format can produce a
//! [`PipelineConfig`]. [`PipelineConfig::validate_all`] must pass before the
//! config is handed to the registry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace, warn};
use validator::Validate;

use agentgate_agent_protocol::{
    EventType, PoolConfig, ReverseListenerConfig, TransportEndpoint, TransportKind,
};
use agentgate_common::{CircuitBreakerConfig, FailureMode, GateError, GateResult};

/// Default inspectable body size per direction (1 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// How body chunks reach an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyMode {
    /// Hold the body until it ends or hits the inspection limit, then send
    /// the collected chunks as one call
    #[default]
    Buffer,
    /// Send every chunk as it arrives
    Stream,
    /// Buffer up to `buffer_threshold` bytes; if the body is larger, flush
    /// what was buffered and stream the rest
    Hybrid { buffer_threshold: usize },
}

impl BodyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BodyMode::Buffer => "buffer",
            BodyMode::Stream => "stream",
            BodyMode::Hybrid { .. } => "hybrid",
        }
    }
}

/// Response returned to the client when a fail-closed agent fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct FailClosedResponse {
    #[serde(default = "default_fail_closed_status")]
    #[validate(range(min = 100, max = 599))]
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_fail_closed_status() -> u16 {
    503
}

impl Default for FailClosedResponse {
    fn default() -> Self {
        Self {
            status: default_fail_closed_status(),
            body: None,
        }
    }
}

/// One external agent. Immutable once loaded; a reload replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct AgentDefinition {
    #[validate(length(min = 1, message = "Agent id must not be empty"))]
    pub id: String,

    pub transport: TransportEndpoint,

    /// Lifecycle phases this agent is invoked for
    #[serde(default = "default_events")]
    #[validate(length(min = 1, message = "Agent must subscribe to at least one event"))]
    pub events: Vec<EventType>,

    /// Budget for one call, including pool acquisition and any retry
    #[serde(default = "default_timeout_ms")]
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    #[serde(default)]
    pub failure_mode: FailureMode,

    #[serde(default)]
    #[validate(nested)]
    pub fail_closed: FailClosedResponse,

    #[serde(default)]
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default = "default_max_body_bytes")]
    pub max_request_body_bytes: usize,

    #[serde(default = "default_max_body_bytes")]
    pub max_response_body_bytes: usize,

    #[serde(default)]
    pub request_body_mode: BodyMode,

    #[serde(default)]
    pub response_body_mode: BodyMode,

    /// Retry once on a fresh connection after a connection-level error
    #[serde(default = "default_retry_on_connection_error")]
    pub retry_on_connection_error: bool,
}

fn default_events() -> Vec<EventType> {
    vec![EventType::RequestHeaders]
}

fn default_timeout_ms() -> u64 {
    1_000
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_retry_on_connection_error() -> bool {
    true
}

impl AgentDefinition {
    /// Definition with every optional field at its default.
    pub fn new(id: impl Into<String>, transport: TransportEndpoint) -> Self {
        Self {
            id: id.into(),
            transport,
            events: default_events(),
            timeout_ms: default_timeout_ms(),
            failure_mode: FailureMode::default(),
            fail_closed: FailClosedResponse::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pool: PoolConfig::default(),
            max_request_body_bytes: default_max_body_bytes(),
            max_response_body_bytes: default_max_body_bytes(),
            request_body_mode: BodyMode::default(),
            response_body_mode: BodyMode::default(),
            retry_on_connection_error: default_retry_on_connection_error(),
        }
    }

    pub fn with_events(mut self, events: impl IntoIterator<Item = EventType>) -> Self {
        self.events = events.into_iter().collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn with_fail_closed(mut self, status: u16, body: Option<String>) -> Self {
        self.fail_closed = FailClosedResponse { status, body };
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_request_body(mut self, mode: BodyMode, max_bytes: usize) -> Self {
        self.request_body_mode = mode;
        self.max_request_body_bytes = max_bytes;
        self
    }

    pub fn with_response_body(mut self, mode: BodyMode, max_bytes: usize) -> Self {
        self.response_body_mode = mode;
        self.max_response_body_bytes = max_bytes;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn handles(&self, event: EventType) -> bool {
        self.events.contains(&event)
    }

    /// Body mode and inspection limit for a body event, by direction.
    pub fn body_policy(&self, event: EventType) -> (BodyMode, usize) {
        match event {
            EventType::ResponseBodyChunk => (self.response_body_mode, self.max_response_body_bytes),
            _ => (self.request_body_mode, self.max_request_body_bytes),
        }
    }

    /// Whether a reload can keep the existing connections.
    pub(crate) fn same_connections(&self, other: &AgentDefinition) -> bool {
        self.transport == other.transport && self.pool == other.pool
    }
}

/// Agents bound to one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    /// Agents in invocation order, for every phase without an override
    #[serde(default)]
    pub agents: Vec<String>,
    /// Per-phase ordered overrides
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub phase_agents: BTreeMap<EventType, Vec<String>>,
}

impl RouteConfig {
    pub fn new(id: impl Into<String>, agents: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: id.into(),
            agents: agents.into_iter().map(Into::into).collect(),
            phase_agents: BTreeMap::new(),
        }
    }

    pub fn with_phase(
        mut self,
        event: EventType,
        agents: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.phase_agents
            .insert(event, agents.into_iter().map(Into::into).collect());
        self
    }

    /// Configured agent order for a phase.
    pub fn agents_for(&self, event: EventType) -> &[String] {
        self.phase_agents
            .get(&event)
            .map(Vec::as_slice)
            .unwrap_or(self.agents.as_slice())
    }

    fn referenced_agents(&self) -> impl Iterator<Item = &String> {
        self.agents
            .iter()
            .chain(self.phase_agents.values().flatten())
    }
}

/// Everything the pipeline needs from the configuration collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub agents: Vec<AgentDefinition>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_listener: Option<ReverseListenerConfig>,
}

impl PipelineConfig {
    pub fn new(agents: Vec<AgentDefinition>, routes: Vec<RouteConfig>) -> Self {
        Self {
            agents,
            routes,
            reverse_listener: None,
        }
    }

    /// Field ranges plus cross-references.
    pub fn validate_all(&self) -> GateResult<()> {
        trace!(
            agents = self.agents.len(),
            routes = self.routes.len(),
            "Validating pipeline configuration"
        );

        for agent in &self.agents {
            agent.validate().map_err(|e| {
                GateError::config_with_source(format!("Agent '{}' is invalid", agent.id), e)
            })?;
        }

        let mut errors: Vec<String> = Vec::new();
        let agent_ids = self.check_agents(&mut errors);
        self.check_routes(&mut errors);

        if let Some(listener) = &self.reverse_listener {
            for allowed in &listener.allowed_agents {
                if !agent_ids.contains(allowed.as_str()) {
                    warn!(
                        agent_id = %allowed,
                        "Reverse listener allows an agent that is not defined"
                    );
                }
            }
            if listener.handshake_timeout_ms == 0 {
                errors.push("Reverse listener handshake_timeout_ms must be > 0".to_string());
            }
        }

        if !errors.is_empty() {
            debug!(error_count = errors.len(), "Pipeline configuration invalid");
            return Err(GateError::config(errors.join("\n")));
        }

        for route in &self.routes {
            if let Some(missing) = route
                .referenced_agents()
                .find(|id| !agent_ids.contains(id.as_str()))
            {
                return Err(GateError::UnknownAgent {
                    agent: missing.clone(),
                    referenced_by: format!("route '{}'", route.id),
                });
            }
        }

        debug!("Pipeline configuration valid");
        Ok(())
    }

    fn check_agents(&self, errors: &mut Vec<String>) -> HashSet<&str> {
        let mut seen = HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                errors.push(format!(
                    "Duplicate agent ID '{}'. Each agent must have a unique identifier.",
                    agent.id
                ));
            }

            let pool = &agent.pool;
            if pool.max_connections == 0 {
                errors.push(format!("Agent '{}': pool max_connections must be >= 1", agent.id));
            }
            if pool.min_connections > pool.max_connections {
                errors.push(format!(
                    "Agent '{}': pool min_connections ({}) exceeds max_connections ({})",
                    agent.id, pool.min_connections, pool.max_connections
                ));
            }
            if pool.max_concurrent_calls == 0 {
                errors.push(format!(
                    "Agent '{}': pool max_concurrent_calls must be >= 1",
                    agent.id
                ));
            }
            if agent.transport.kind() == TransportKind::Reverse && pool.min_connections > 0 {
                errors.push(format!(
                    "Agent '{}': reverse agents cannot keep min_connections; the agent dials in",
                    agent.id
                ));
            }
            if agent.circuit_breaker.open_timeout_ms == 0 {
                errors.push(format!(
                    "Agent '{}': circuit breaker open_timeout_ms must be > 0",
                    agent.id
                ));
            }
            for (event, mode) in [
                (EventType::RequestBodyChunk, agent.request_body_mode),
                (EventType::ResponseBodyChunk, agent.response_body_mode),
            ] {
                if let BodyMode::Hybrid { buffer_threshold } = mode {
                    if buffer_threshold == 0 {
                        errors.push(format!(
                            "Agent '{}': {} hybrid buffer_threshold must be > 0",
                            agent.id, event
                        ));
                    }
                }
            }
        }
        seen
    }

    fn check_routes(&self, errors: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for route in &self.routes {
            if !seen.insert(route.id.as_str()) {
                errors.push(format!(
                    "Duplicate route ID '{}'. Each route must have a unique identifier.",
                    route.id
                ));
            }
            let mut per_phase = HashSet::new();
            for agent in &route.agents {
                if !per_phase.insert(agent.as_str()) {
                    errors.push(format!(
                        "Route '{}' lists agent '{}' more than once",
                        route.id, agent
                    ));
                }
            }
            for (event, agents) in &route.phase_agents {
                let mut per_phase = HashSet::new();
                for agent in agents {
                    if !per_phase.insert(agent.as_str()) {
                        errors.push(format!(
                            "Route '{}' lists agent '{}' more than once for {}",
                            route.id, agent, event
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentgate_agent_protocol::LocalStreamOptions;

    fn local(id: &str) -> AgentDefinition {
        AgentDefinition::new(
            id,
            TransportEndpoint::LocalStream(LocalStreamOptions::new(format!("/tmp/{id}.sock"))),
        )
    }

    #[test]
    fn test_defaults_from_minimal_json() {
        let json = r#"{
            "id": "waf",
            "transport": {"type": "local_stream", "path": "/run/waf.sock"}
        }"#;
        let def: AgentDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(def.events, vec![EventType::RequestHeaders]);
        assert_eq!(def.timeout_ms, 1000);
        assert_eq!(def.failure_mode, FailureMode::Closed);
        assert_eq!(def.fail_closed.status, 503);
        assert_eq!(def.circuit_breaker, CircuitBreakerConfig::default());
        assert_eq!(def.pool, PoolConfig::default());
        assert_eq!(def.max_request_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(def.request_body_mode, BodyMode::Buffer);
        assert!(def.retry_on_connection_error);
    }

    #[test]
    fn test_full_definition_from_json() {
        let json = r#"{
            "id": "auth",
            "transport": {"type": "rpc", "endpoint": "http://auth:50051"},
            "events": ["request_headers", "request_body_chunk"],
            "timeout_ms": 250,
            "failure_mode": "open",
            "fail_closed": {"status": 401, "body": "denied"},
            "pool": {"max_connections": 2, "strategy": "least_connections", "acquire": "fail_fast"},
            "request_body_mode": {"hybrid": {"buffer_threshold": 4096}},
            "response_body_mode": "stream"
        }"#;
        let def: AgentDefinition = serde_json::from_str(json).unwrap();

        assert_eq!(def.transport.kind(), TransportKind::Rpc);
        assert_eq!(def.failure_mode, FailureMode::Open);
        assert_eq!(def.fail_closed.body.as_deref(), Some("denied"));
        assert_eq!(def.pool.max_connections, 2);
        assert_eq!(
            def.body_policy(EventType::RequestBodyChunk),
            (BodyMode::Hybrid { buffer_threshold: 4096 }, DEFAULT_MAX_BODY_BYTES)
        );
        assert_eq!(def.body_policy(EventType::ResponseBodyChunk).0, BodyMode::Stream);
        assert!(def.handles(EventType::RequestBodyChunk));
        assert!(!def.handles(EventType::Complete));
    }

    #[test]
    fn test_route_phase_override() {
        let route = RouteConfig::new("api", ["auth", "waf"])
            .with_phase(EventType::ResponseHeaders, ["waf"]);

        assert_eq!(route.agents_for(EventType::RequestHeaders), ["auth", "waf"]);
        assert_eq!(route.agents_for(EventType::ResponseHeaders), ["waf"]);
    }

    #[test]
    fn test_validate_all_accepts_valid_config() {
        let config = PipelineConfig::new(
            vec![local("auth"), local("waf")],
            vec![RouteConfig::new("api", ["auth", "waf"])],
        );
        config.validate_all().unwrap();
    }

    #[test]
    fn test_validate_all_rejects_unknown_agent() {
        let config = PipelineConfig::new(
            vec![local("auth")],
            vec![RouteConfig::new("api", ["auth"]).with_phase(EventType::Complete, ["audit"])],
        );

        match config.validate_all().unwrap_err() {
            GateError::UnknownAgent { agent, referenced_by } => {
                assert_eq!(agent, "audit");
                assert_eq!(referenced_by, "route 'api'");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_all_collects_range_errors() {
        let mut bad_pool = local("waf");
        bad_pool.pool.min_connections = 5;
        bad_pool.pool.max_connections = 2;

        let config = PipelineConfig::new(vec![local("auth"), local("auth"), bad_pool], vec![]);
        let message = config.validate_all().unwrap_err().to_string();

        assert!(message.contains("Duplicate agent ID 'auth'"));
        assert!(message.contains("min_connections (5) exceeds max_connections (2)"));
    }

    #[test]
    fn test_validate_rejects_zero_thresholds_and_timeouts() {
        let zero_threshold = local("a").with_circuit_breaker(CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        });
        let config = PipelineConfig::new(vec![zero_threshold], vec![]);
        assert!(matches!(config.validate_all(), Err(GateError::Config { .. })));

        let zero_timeout = local("b").with_timeout_ms(0);
        let config = PipelineConfig::new(vec![zero_timeout], vec![]);
        assert!(matches!(config.validate_all(), Err(GateError::Config { .. })));

        let no_open_timeout = local("c").with_circuit_breaker(CircuitBreakerConfig {
            open_timeout_ms: 0,
            ..Default::default()
        });
        let config = PipelineConfig::new(vec![no_open_timeout], vec![]);
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_validate_rejects_reverse_min_connections() {
        let mut reverse = AgentDefinition::new("edge", TransportEndpoint::Reverse);
        reverse.pool.min_connections = 1;
        let config = PipelineConfig::new(vec![reverse], vec![]);
        assert!(config
            .validate_all()
            .unwrap_err()
            .to_string()
            .contains("reverse agents cannot keep min_connections"));
    }
}
