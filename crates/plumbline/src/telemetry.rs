//! Tracing initialization for plumbline hosts.
//!
//! Library code only emits `tracing` events; a host calls [`init`] once to
//! print them.

use anyhow::{Context, Result};
use plumbconf::TelemetryConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// the configured level.
pub fn init(config: &TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .with_context(|| format!("invalid log filter: {}", config.log_level))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("a global tracing subscriber is already installed")?;

    tracing::debug!("tracing initialized at {}", config.log_level);
    Ok(())
}
