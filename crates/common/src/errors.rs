//! Error types for agentgate
//!
//! Agent call failures are never surfaced through [`GateError`]; they are
//! classified and resolved by the pipeline's failure policy. This type covers
//! configuration, reload, and registry faults.

use thiserror::Error;

/// Main error type for agentgate operations
#[derive(Error, Debug)]
pub enum GateError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A route or phase referenced an agent that is not defined
    #[error("Unknown agent '{agent}' referenced by {referenced_by}")]
    UnknownAgent {
        agent: String,
        referenced_by: String,
    },

    /// Agent communication errors outside of a request call
    #[error("Agent error: {agent} - {message}")]
    Agent {
        agent: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Timeout: {operation} after {duration_ms}ms")]
    Timeout { operation: String, duration_ms: u64 },

    /// Internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn agent(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Agent {
            agent: agent.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Agent { .. } | Self::Timeout { .. } | Self::Io(_))
    }
}

impl From<validator::ValidationErrors> for GateError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config_with_source("validation failed", errors)
    }
}

/// Result type alias for agentgate operations
pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GateError::UnknownAgent {
            agent: "waf".into(),
            referenced_by: "route 'api'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown agent 'waf' referenced by route 'api'"
        );
        assert!(!err.is_retryable());
        assert!(GateError::agent("auth", "connect refused").is_retryable());
    }
}
