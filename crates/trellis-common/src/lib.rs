//! Common types for Trellis: CRDs, errors, and Kubernetes utilities

#![deny(missing_docs)]

pub mod adapter;
pub mod backoff;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod redact;
pub mod retry;
pub mod telemetry;

pub use error::{Error, RetryClass};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label CAPI puts on every object belonging to a cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking a Machine as a control-plane member
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Label naming the control plane that owns a Machine
pub const CONTROL_PLANE_NAME_LABEL: &str = "cluster.x-k8s.io/control-plane-name";

/// Default field manager for server-side apply and status patches
pub const DEFAULT_FIELD_MANAGER: &str = "trellis-controller";
