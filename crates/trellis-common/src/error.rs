//! Error types for the Trellis providers
//!
//! Every variant maps onto one failure class the controllers know how to
//! handle: retry immediately, retry with backoff, or wait for the user to edit
//! the spec. The class is exposed through [`Error::retry_class`] and the
//! condition reason through [`Error::reason`].

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced secret, config map, or key could not be read
    #[error("resolution error for {reference}: {message}")]
    Resolution {
        /// Human-readable reference (e.g. "secret default/creds key=password")
        reference: String,
        /// Description of what is missing
        message: String,
    },

    /// The declared spec is malformed and will not succeed until edited
    #[error("configuration error for {resource}: {message}")]
    Configuration {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.files[2]")
        field: Option<String>,
    },

    /// A guarded write lost against a concurrent writer
    #[error("conflict on {resource}: {message}")]
    Conflict {
        /// Name of the resource whose version moved
        resource: String,
        /// Description of the conflicting write
        message: String,
    },

    /// A dependency (cluster infrastructure, control plane) is not ready yet
    #[error("infrastructure not ready for {resource}: {message}")]
    InfrastructureNotReady {
        /// Name of the waiting resource
        resource: String,
        /// What is being waited on
        message: String,
    },

    /// Removing a member would leave fewer healthy members than quorum
    #[error(
        "quorum safety violation for {control_plane}: removing {machine} leaves {healthy_after} healthy of {required} required"
    )]
    QuorumSafetyViolation {
        /// Control plane being scaled
        control_plane: String,
        /// Machine that would have been removed
        machine: String,
        /// Healthy members left after the removal
        healthy_after: usize,
        /// Quorum of the remaining membership
        required: usize,
    },

    /// Serialization/deserialization error, including payload validation
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "lifecycle")
        context: String,
    },
}

/// How the controller should requeue after an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Re-run the pass right away (lost a conditional write)
    Immediate,
    /// Retry with per-object exponential backoff
    Backoff,
    /// Nothing will change until the spec does
    AwaitChange,
}

impl Error {
    /// Create a resolution error for a reference
    pub fn resolution(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error without resource context
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with resource context
    pub fn configuration_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with resource context and field path
    pub fn configuration_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a conflict error
    pub fn conflict(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an infrastructure-not-ready error
    pub fn not_ready(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InfrastructureNotReady {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create a quorum safety violation
    pub fn quorum_violation(
        control_plane: impl Into<String>,
        machine: impl Into<String>,
        healthy_after: usize,
        required: usize,
    ) -> Self {
        Self::QuorumSafetyViolation {
            control_plane: control_plane.into(),
            machine: machine.into(),
            healthy_after,
            required,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Map the result of a resourceVersion-guarded write.
    ///
    /// HTTP 409 becomes [`Error::Conflict`]; everything else stays a kube error.
    pub fn from_guarded_write(resource: impl Into<String>, source: kube::Error) -> Self {
        match source {
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict {
                resource: resource.into(),
                message: ae.message,
            },
            other => Self::Kube { source: other },
        }
    }

    /// Check if this error is retryable without a spec edit
    ///
    /// Configuration errors need the user to fix the spec. Kubernetes 4xx
    /// errors are permanent except for conflicts and throttling.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae)
                    if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Configuration { .. } => false,
            Error::Resolution { .. }
            | Error::Conflict { .. }
            | Error::InfrastructureNotReady { .. }
            | Error::QuorumSafetyViolation { .. }
            | Error::Serialization { .. }
            | Error::Internal { .. } => true,
        }
    }

    /// Check if this error came from losing an optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Requeue strategy for this error
    pub fn retry_class(&self) -> RetryClass {
        if self.is_conflict() {
            RetryClass::Immediate
        } else if self.is_retryable() {
            RetryClass::Backoff
        } else {
            RetryClass::AwaitChange
        }
    }

    /// Machine-readable reason used on `Ready`/`DataAvailable` conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "KubernetesError",
            Error::Resolution { .. } => "ResolutionFailed",
            Error::Configuration { .. } => "InvalidConfiguration",
            Error::Conflict { .. } => "Conflict",
            Error::InfrastructureNotReady { .. } => "InfrastructureNotReady",
            Error::QuorumSafetyViolation { .. } => "QuorumSafetyViolation",
            Error::Serialization { .. } => "SerializationFailed",
            Error::Internal { .. } => "InternalError",
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}
