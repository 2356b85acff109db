//! ControlPlane Custom Resource Definition
//!
//! Declares how many control-plane machines a cluster should run and at
//! which version. The control-plane controller converges the set of CAPI
//! Machines toward this description without breaking quorum.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::node_config::NodeConfigSpec;
use super::types::{Condition, ObjectRef};

/// Specification for a ControlPlane
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "controlplane.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "ControlPlane",
    plural = "controlplanes",
    shortname = "tcp",
    status = "ControlPlaneStatus",
    namespaced,
    scale = r#"{"specReplicasPath":".spec.replicas","statusReplicasPath":".status.replicas","labelSelectorPath":".status.selector"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Updated","type":"integer","jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Desired number of control-plane machines
    pub replicas: i32,

    /// Desired Kubernetes version (e.g. "v1.31.4+rke2r1")
    pub version: String,

    /// How to create infrastructure for new machines
    pub machine_template: MachineTemplate,

    /// Bootstrap configuration stamped onto each machine's NodeConfig
    #[serde(default)]
    pub node_config: NodeConfigSpec,
}

/// Infrastructure template for control-plane machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// Infrastructure machine template to clone for each machine
    pub infrastructure_ref: ObjectRef,
}

impl ControlPlaneSpec {
    /// Validate the control plane specification
    pub fn validate(&self, name: &str) -> Result<(), crate::Error> {
        if self.replicas < 0 {
            return Err(crate::Error::configuration_for_field(
                name,
                "spec.replicas",
                format!("must be >= 0, got {}", self.replicas),
            ));
        }
        if self.version.trim().is_empty() {
            return Err(crate::Error::configuration_for_field(
                name,
                "spec.version",
                "cannot be empty",
            ));
        }
        let infra = &self.machine_template.infrastructure_ref;
        if infra.name.is_empty() || infra.kind.is_none() || infra.api_version.is_none() {
            return Err(crate::Error::configuration_for_field(
                name,
                "spec.machineTemplate.infrastructureRef",
                "apiVersion, kind and name are required",
            ));
        }
        Ok(())
    }

    /// Desired replica count as an unsigned size
    pub fn desired(&self) -> usize {
        usize::try_from(self.replicas).unwrap_or(0)
    }
}

/// Status for a ControlPlane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Machines currently owned, in any state
    #[serde(default)]
    pub replicas: i32,

    /// Machines that joined and report Ready
    #[serde(default)]
    pub ready_replicas: i32,

    /// Machines at the desired version
    #[serde(default)]
    pub updated_replicas: i32,

    /// `replicas - readyReplicas`
    #[serde(default)]
    pub unavailable_replicas: i32,

    /// At least one member has joined the cluster
    #[serde(default)]
    pub initialized: bool,

    /// At least one member is ready
    #[serde(default)]
    pub ready: bool,

    /// Lowest version reported across members
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Label selector for the scale subresource
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,

    /// Generation last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ControlPlaneStatus {
    /// Converged iff replicas == updated == ready == desired and nothing is unavailable
    pub fn is_converged(&self, desired: i32) -> bool {
        self.replicas == desired
            && self.updated_replicas == desired
            && self.ready_replicas == desired
            && self.unavailable_replicas == 0
    }
}
