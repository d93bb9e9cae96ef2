//! Shared building blocks for the agentgate agent pipeline.
//!
//! # Module Organization
//!
//! - [`ids`]: Request correlation identifier
//! - [`types`]: Breaker configuration/state and failure modes
//! - [`errors`]: Error types and result aliases
//! - [`circuit_breaker`]: Per-agent circuit breaker state machine
//! - [`observability`]: Tracing initialisation

pub mod circuit_breaker;
pub mod errors;
pub mod ids;
pub mod observability;
pub mod types;

pub use circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, TransitionListener};
pub use errors::{GateError, GateResult};
pub use ids::CorrelationId;
pub use observability::init_tracing;
pub use types::{CircuitBreakerConfig, CircuitBreakerState, FailureMode};
