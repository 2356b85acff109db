//! Narrow "apply and wait" capability against a cluster
//!
//! Everything that would otherwise shell out to `kubectl apply` / `kubectl
//! wait` goes through [`ClusterAdapter`]. The kube-rs implementation uses
//! server-side apply and bounded polling of status conditions.

use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::kube_utils::{build_api_resource, poll_until, DEFAULT_POLL_INTERVAL};
use crate::Error;

/// A condition to wait for on one object
#[derive(Clone, Debug, PartialEq)]
pub struct WaitCondition {
    /// Resource type of the object
    pub api_resource: ApiResource,
    /// Namespace, or None for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
    /// Condition type that must report `True`
    pub condition_type: String,
}

impl WaitCondition {
    /// Wait for a CustomResourceDefinition to be served
    pub fn crd_established(name: impl Into<String>) -> Self {
        Self {
            api_resource: build_api_resource(
                "apiextensions.k8s.io/v1",
                "CustomResourceDefinition",
            ),
            namespace: None,
            name: name.into(),
            condition_type: "Established".to_string(),
        }
    }
}

/// Apply resources to a cluster and wait on their conditions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    /// Server-side apply each resource, in order
    async fn apply(&self, resources: &[DynamicObject]) -> Result<(), Error>;

    /// Block until the condition holds or `timeout` elapses
    async fn wait(&self, condition: &WaitCondition, timeout: Duration) -> Result<(), Error>;
}

/// [`ClusterAdapter`] backed by the Kubernetes API
pub struct KubeClusterAdapter {
    client: Client,
    field_manager: String,
}

impl KubeClusterAdapter {
    /// Create an adapter applying as the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api_for(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

/// Derive the ApiResource of an object from its own TypeMeta
pub fn api_resource_of(obj: &DynamicObject) -> Result<ApiResource, Error> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::serialization_for_kind(
            "DynamicObject",
            format!("object {} has no apiVersion/kind", obj.name_any()),
        )
    })?;
    Ok(build_api_resource(&types.api_version, &types.kind))
}

/// Check if `status.conditions` holds `type == condition_type, status == "True"`
pub fn has_true_condition(obj: &DynamicObject, condition_type: &str) -> bool {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(condition_type)
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}

#[async_trait]
impl ClusterAdapter for KubeClusterAdapter {
    async fn apply(&self, resources: &[DynamicObject]) -> Result<(), Error> {
        let params = PatchParams::apply(&self.field_manager).force();
        for obj in resources {
            let ar = api_resource_of(obj)?;
            let name = obj.name_any();
            let api = self.api_for(&ar, obj.metadata.namespace.as_deref());
            api.patch(&name, &params, &Patch::Apply(obj)).await?;
            info!(kind = %ar.kind, name = %name, "applied resource");
        }
        Ok(())
    }

    async fn wait(&self, condition: &WaitCondition, timeout: Duration) -> Result<(), Error> {
        let api = self.api_for(&condition.api_resource, condition.namespace.as_deref());
        let name = condition.name.clone();
        let condition_type = condition.condition_type.clone();

        poll_until(
            timeout,
            DEFAULT_POLL_INTERVAL,
            format!(
                "timed out waiting for {} {} to be {}",
                condition.api_resource.kind, condition.name, condition.condition_type
            ),
            || {
                let api = api.clone();
                let name = name.clone();
                let condition_type = condition_type.clone();
                async move {
                    let obj = api.get(&name).await?;
                    let met = has_true_condition(&obj, &condition_type);
                    debug!(name = %name, condition = %condition_type, met, "checked condition");
                    Ok(met)
                }
            },
        )
        .await
    }
}
