//! Structured logging setup for the operator binary
//!
//! JSON lines on stdout with the current span attached, filtered through
//! `RUST_LOG` when set. Pod identity from the downward API is logged once at
//! startup so log streams can be correlated with the running replica.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,trellis=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to parse the log filter
    #[error("invalid log filter: {0}")]
    Filter(String),

    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup record (e.g. "trellis-operator")
    pub service_name: String,

    /// Emit JSON lines; plain text is easier to read in a terminal
    pub json: bool,

    /// Explicit filter directive; falls back to `RUST_LOG`, then [`DEFAULT_LOG_FILTER`]
    pub filter: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "trellis".to_string(),
            json: true,
            filter: None,
        }
    }
}

impl TelemetryConfig {
    fn env_filter(&self) -> Result<EnvFilter, TelemetryError> {
        match &self.filter {
            Some(directive) => {
                EnvFilter::try_new(directive).map_err(|e| TelemetryError::Filter(e.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))),
        }
    }
}

/// Initialize the global tracing subscriber
pub fn init_telemetry(config: TelemetryConfig) -> Result<(), TelemetryError> {
    let env_filter = config.env_filter()?;

    let result = if config.json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    };
    result.map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    let pod = std::env::var("POD_NAME").unwrap_or_else(|_| "-".to_string());
    let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "-".to_string());
    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        pod = %pod,
        namespace = %namespace,
        "telemetry initialized"
    );

    Ok(())
}
