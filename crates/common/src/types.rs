//! Shared configuration and state types.
//!
//! For identifier types (CorrelationId), see the `ids` module.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;

/// Circuit breaker thresholds for one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the breaker
    #[serde(default = "default_failure_threshold")]
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the breaker
    #[serde(default = "default_success_threshold")]
    #[validate(range(min = 1))]
    pub success_threshold: u32,

    /// Time spent `Open` before trial calls are allowed
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,

    /// Concurrent trial calls admitted while `HalfOpen`
    #[serde(default = "default_half_open_max_requests")]
    #[validate(range(min = 1))]
    pub half_open_max_requests: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_max_requests() -> u32 {
    1
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

/// Externally visible circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding used by metrics exporters.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a request when an agent call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Allow traffic through on failure
    Open,
    /// Block traffic on failure
    #[default]
    Closed,
}

impl FailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "fail_open",
            Self::Closed => "fail_closed",
        }
    }
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_config_defaults_from_empty_document() {
        let config: CircuitBreakerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, CircuitBreakerConfig::default());
        assert_eq!(config.open_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_breaker_config_rejects_zero_thresholds() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_failure_mode_defaults_closed() {
        assert_eq!(FailureMode::default(), FailureMode::Closed);
        let mode: FailureMode = serde_json::from_str("\"open\"").unwrap();
        assert_eq!(mode, FailureMode::Open);
    }
}
