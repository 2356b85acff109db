//! Command line and environment configuration

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use trellis_common::telemetry::TelemetryConfig;
use trellis_common::DEFAULT_FIELD_MANAGER;

/// Trellis - Cluster API bootstrap and control-plane provider for RKE2
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
pub struct Cli {
    /// Print all CRD manifests as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Operator settings shared by every subcommand
    #[command(flatten)]
    pub settings: Settings,

    /// What to run
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Apply the CRDs and wait until they are served
    InstallCrds,
    /// Run the NodeConfig and ControlPlane controllers (default)
    Controller,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON lines
    Json,
    /// Human-readable text
    Text,
}

/// Settings with environment fallbacks
#[derive(clap::Args, Debug, Clone)]
pub struct Settings {
    /// Only watch this namespace; all namespaces when unset
    #[arg(long, env = "TRELLIS_WATCH_NAMESPACE", global = true)]
    pub watch_namespace: Option<String>,

    /// Requeue period for converged control planes, in seconds
    #[arg(long, env = "TRELLIS_RESYNC_SECONDS", default_value_t = 300, global = true)]
    pub resync_seconds: u64,

    /// Field manager for status and metadata patches
    #[arg(long, env = "TRELLIS_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER, global = true)]
    pub field_manager: String,

    /// Do not install CRDs before starting the controllers
    #[arg(long, env = "TRELLIS_SKIP_CRD_INSTALL", global = true)]
    pub skip_crd_install: bool,

    /// Seconds to wait for each CRD to become Established
    #[arg(long, env = "TRELLIS_CRD_TIMEOUT_SECONDS", default_value_t = 60, global = true)]
    pub crd_timeout_seconds: u64,

    /// Log output format
    #[arg(long, env = "TRELLIS_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json, global = true)]
    pub log_format: LogFormat,
}

impl Settings {
    /// Requeue period once converged
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }

    /// How long to wait for CRDs to be served
    pub fn crd_timeout(&self) -> Duration {
        Duration::from_secs(self.crd_timeout_seconds)
    }

    /// Telemetry configuration for these settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "trellis-operator".to_string(),
            json: self.log_format == LogFormat::Json,
            filter: None,
        }
    }
}
