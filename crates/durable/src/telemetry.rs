//! Tracing subscriber setup for hosts embedding the orchestrator
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's choice. [`init_telemetry`] is the standard setup used by the
//! worker binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default log filter when neither `RUST_LOG` nor `LOG_LEVEL` is set
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every event
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "tallyloom_durable=debug")
    pub log_filter: Option<String>,
    /// Include event targets in output
    pub with_target: bool,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "tallyloom".to_string(),
            log_filter: None,
            with_target: true,
            json: false,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "tallyloom")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `LOG_FORMAT`: "json" for JSON lines
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "tallyloom".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            with_target: true,
            json: std::env::var("LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }

    /// Filter to install, falling back to [`DEFAULT_LOG_FILTER`] when the
    /// configured one does not parse
    pub fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
    }
}

/// Install the global tracing subscriber
///
/// Returns `false` if a global subscriber was already installed, which
/// leaves the existing one in place.
///
/// # Example
///
/// ```ignore
/// use tallyloom_durable::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_telemetry(TelemetryConfig::from_env());
///     // ... your application code
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let filter = config.env_filter();

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    };

    let installed = tracing_subscriber::registry().with(layer).try_init().is_ok();
    if installed {
        tracing::debug!(service = %config.service_name, "telemetry initialized");
    }
    installed
}
