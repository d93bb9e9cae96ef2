//! Tracing initialisation.
//!
//! Output format is selected with `AGENTGATE_LOG_FORMAT` (`json`, the
//! default, or `pretty`); verbosity with `RUST_LOG`.

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "AGENTGATE_LOG_FORMAT";

/// Initialize the tracing/logging subsystem
pub fn init_tracing() -> Result<()> {
    let json = std::env::var(LOG_FORMAT_ENV).unwrap_or_else(|_| "json".to_string()) == "json";

    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
    });

    let pretty_layer = (!json).then(|| {
        fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
    });

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(pretty_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    info!("Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_installs_once() {
        assert!(init_tracing().is_ok());
        assert!(init_tracing().is_err());
    }
}
