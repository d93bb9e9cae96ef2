//! External agent decision pipeline for the agentgate proxy.
//!
//! For each request lifecycle event the pipeline calls the agents a route
//! subscribes, bounds every call by a timeout, protects agents with a
//! circuit breaker, resolves failures per each agent's failure mode and
//! folds the answers into one decision plus header mutations.
//!
//! # Module Organization
//!
//! - [`config`]: Agent, route and pipeline configuration with validation
//! - [`registry`]: Copy-on-write agent registry with hot reload
//! - [`context`]: Per-request call context and cancellation
//! - [`executor`]: One bounded, breaker-guarded agent call
//! - [`policy`]: Failure mode resolution
//! - [`aggregator`]: Decision and mutation merging
//! - [`dispatcher`]: Phase dispatch and body inspection sessions
//! - [`metrics`]: Per-agent counters and Prometheus collectors
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(AgentRegistry::new(config)?);
//! let dispatcher = EventDispatcher::new(Arc::clone(&registry));
//!
//! let ctx = CallContext::new(CorrelationId::new(), "api", metadata);
//! let outcome = dispatcher.request_headers(&ctx, event).await;
//! if !outcome.is_allow() {
//!     // answer the client from outcome.decision
//! }
//! ```

pub mod agent;
pub mod aggregator;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod policy;
pub mod registry;

pub use agent::AgentHandle;
pub use aggregator::{AgentOutcome, AggregatedOutcome, Disposition, PhaseAggregator, SkipReason};
pub use config::{AgentDefinition, BodyMode, FailClosedResponse, PipelineConfig, RouteConfig};
pub use context::CallContext;
pub use dispatcher::{BodySession, BodyStep, EventDispatcher};
pub use errors::{CallFailure, FailureKind};
pub use executor::{CallExecutor, CallSuccess};
pub use metrics::{AgentMetrics, AgentMetricsSnapshot, PipelineMetrics};
pub use policy::{FailurePolicy, Resolution};
pub use registry::{AgentRegistry, RegistrySnapshot, ReloadReport};
