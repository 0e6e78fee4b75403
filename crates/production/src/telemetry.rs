//! Tracing subscriber setup and metrics export.
//!
//! Library crates only emit events; the process installs the subscriber once
//! at startup through [`init_telemetry`].

use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Filter used when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_FILTER: &str = "info,tbft=debug";

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing_subscriber::util::TryInitError),

    #[error("Failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),
}

/// Configuration for telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Log filter directives. `RUST_LOG` wins when set.
    pub log_filter: Option<String>,
    /// Register the prometheus metrics and make them available to
    /// [`gather_metrics`].
    pub metrics_enabled: bool,
    /// Include thread ids in log lines.
    pub thread_ids: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            metrics_enabled: true,
            thread_ids: true,
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        let directives = self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER);
        Ok(EnvFilter::try_new(directives)?)
    }
}

/// Install the global tracing subscriber.
///
/// Fails if the filter does not parse or a subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(config.thread_ids);

    Registry::default()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    if config.metrics_enabled {
        // Register eagerly so the first scrape sees every series.
        crate::metrics::metrics();
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        metrics = config.metrics_enabled,
        "Telemetry initialized"
    );
    Ok(())
}

/// Current metrics in the Prometheus text exposition format.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
