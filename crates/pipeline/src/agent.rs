//! A configured agent together with its shared runtime state.

use std::sync::Arc;
use std::time::Duration;

use agentgate_agent_protocol::{AgentPool, EventType};
use agentgate_common::{CircuitBreaker, FailureMode};

use crate::config::AgentDefinition;
use crate::metrics::AgentMetrics;

/// One agent as seen by the pipeline.
///
/// The definition is immutable. The pool, breaker and metrics are shared
/// with other registry generations when a reload keeps them.
pub struct AgentHandle {
    definition: AgentDefinition,
    pool: Arc<AgentPool>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<AgentMetrics>,
}

impl AgentHandle {
    pub fn new(
        definition: AgentDefinition,
        pool: Arc<AgentPool>,
        breaker: Arc<CircuitBreaker>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            definition,
            pool,
            breaker,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn definition(&self) -> &AgentDefinition {
        &self.definition
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.definition.failure_mode
    }

    pub fn timeout(&self) -> Duration {
        self.definition.timeout()
    }

    pub fn handles(&self, event: EventType) -> bool {
        self.definition.handles(event)
    }
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("id", &self.definition.id)
            .field("transport", &self.definition.transport.kind())
            .field("breaker", &self.breaker.state())
            .finish()
    }
}
