//! Machine observation
//!
//! Read-only projection of the CAPI Machines belonging to one control plane.
//! Every pass lists afresh; nothing observed here is cached between passes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DynamicObject, ListParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use trellis_common::kube_utils::machine_api_resource;
use trellis_common::{Error, CLUSTER_NAME_LABEL, CONTROL_PLANE_NAME_LABEL};

/// One control-plane Machine as seen in this pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedMachine {
    /// Machine name
    pub name: String,
    /// Node the machine registered as; present once it has joined
    pub node_ref: Option<String>,
    /// Version the machine was created at
    pub version: Option<String>,
    /// Creation timestamp
    pub created: Option<DateTime<Utc>>,
    /// Ready condition is True
    pub ready: bool,
    /// Deletion has been requested
    pub deleting: bool,
}

impl ObservedMachine {
    /// Joined the cluster (has a node reference)
    pub fn is_joined(&self) -> bool {
        self.node_ref.is_some()
    }

    /// Joined, ready, and not on its way out
    pub fn is_healthy(&self) -> bool {
        self.is_joined() && self.ready && !self.deleting
    }

    /// Runs the given version
    pub fn is_up_to_date(&self, version: &str) -> bool {
        self.version.as_deref() == Some(version)
    }
}

/// Label selector matching the Machines of one control plane
pub fn machine_selector(cluster: &str, control_plane: &str) -> String {
    format!(
        "{}={},{}={}",
        CLUSTER_NAME_LABEL, cluster, CONTROL_PLANE_NAME_LABEL, control_plane
    )
}

/// Project a CAPI Machine onto [`ObservedMachine`]
pub fn observe(machine: &DynamicObject) -> ObservedMachine {
    let ready = machine
        .data
        .pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        });
    ObservedMachine {
        name: machine.name_any(),
        node_ref: machine
            .data
            .pointer("/status/nodeRef/name")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        version: machine
            .data
            .pointer("/spec/version")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        created: machine.metadata.creation_timestamp.as_ref().map(|t| t.0),
        ready,
        deleting: machine.metadata.deletion_timestamp.is_some(),
    }
}

/// Lists the Machines of a control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineTracker: Send + Sync {
    /// Machines in `namespace` matching `selector`, sorted by name
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<ObservedMachine>, Error>;
}

/// [`MachineTracker`] backed by the Kubernetes API
pub struct KubeMachineTracker {
    client: Client,
}

impl KubeMachineTracker {
    /// Create a tracker listing through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MachineTracker for KubeMachineTracker {
    async fn list(&self, namespace: &str, selector: &str) -> Result<Vec<ObservedMachine>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &machine_api_resource());
        let list = api.list(&ListParams::default().labels(selector)).await?;
        let mut machines: Vec<ObservedMachine> = list.items.iter().map(observe).collect();
        machines.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(selector = %selector, count = machines.len(), "observed machines");
        Ok(machines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(json: serde_json::Value) -> DynamicObject {
        serde_json::from_value(json).expect("valid machine")
    }

    #[test]
    fn joined_ready_machine_is_healthy() {
        let m = observe(&machine(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "cp-abcde", "creationTimestamp": "2026-01-02T03:04:05Z"},
            "spec": {"version": "v1.31.4+rke2r1"},
            "status": {
                "nodeRef": {"kind": "Node", "name": "node-1"},
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        })));
        assert_eq!(m.node_ref.as_deref(), Some("node-1"));
        assert!(m.is_healthy());
        assert!(m.is_up_to_date("v1.31.4+rke2r1"));
        assert!(!m.is_up_to_date("v1.32.0+rke2r1"));
        assert_eq!(
            m.created.map(|t| t.to_rfc3339()),
            Some("2026-01-02T03:04:05+00:00".to_string())
        );
    }

    #[test]
    fn unjoined_machine_is_not_healthy() {
        let m = observe(&machine(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "cp-fresh"},
            "status": {"conditions": [{"type": "Ready", "status": "True"}]}
        })));
        assert!(!m.is_joined());
        assert!(!m.is_healthy());
        assert_eq!(m.version, None);
    }

    #[test]
    fn deleting_machine_is_not_healthy() {
        let m = observe(&machine(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "cp-old", "deletionTimestamp": "2026-01-02T03:04:05Z"},
            "status": {
                "nodeRef": {"name": "node-2"},
                "conditions": [{"type": "Ready", "status": "True"}]
            }
        })));
        assert!(m.deleting);
        assert!(m.is_joined());
        assert!(!m.is_healthy());
    }

    #[test]
    fn not_ready_condition_is_not_healthy() {
        let m = observe(&machine(serde_json::json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "cp-sick"},
            "status": {
                "nodeRef": {"name": "node-3"},
                "conditions": [{"type": "Ready", "status": "False"}]
            }
        })));
        assert!(!m.ready);
        assert!(!m.is_healthy());
    }

    #[test]
    fn selector_names_cluster_and_control_plane() {
        assert_eq!(
            machine_selector("prod", "prod-cp"),
            "cluster.x-k8s.io/cluster-name=prod,cluster.x-k8s.io/control-plane-name=prod-cp"
        );
    }
}
