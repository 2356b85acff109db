//! Machine lifecycle against Cluster API objects
//!
//! A control-plane machine is three objects: a NodeConfig carrying the
//! bootstrap spec, an infrastructure machine cloned from the referenced
//! template, and the CAPI Machine tying them together. All three are owned
//! by the ControlPlane. Creation is create-if-absent and all-or-nothing: if
//! a later object fails, the earlier ones are deleted again so no orphaned
//! NodeConfig or infrastructure machine is left behind. Deletion removes the
//! Machine and lets Cluster API tear down what it references.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::{Client, Resource, ResourceExt};
use rand::distributions::{Alphanumeric, DistString};
use serde_json::json;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use trellis_common::crd::{ControlPlane, NodeConfig};
use trellis_common::kube_utils::{
    build_api_resource, is_conflict, is_not_found, machine_api_resource, CAPI_API_VERSION,
};
use trellis_common::{Error, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, CONTROL_PLANE_NAME_LABEL};

const NAME_SUFFIX_LEN: usize = 5;

/// Creates and deletes control-plane machines
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineLifecycle: Send + Sync {
    /// Create one machine at `version`, returning its name
    async fn create(&self, control_plane: &ControlPlane, cluster: &str, version: &str)
        -> Result<String, Error>;

    /// Delete a machine; an already-absent machine is success
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Creates and deletes single objects addressed by their own type meta
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectWriter: Send + Sync {
    /// Create an object; an existing object of the same name is success
    async fn create_object(&self, object: &DynamicObject) -> Result<(), Error>;

    /// Delete an object; an already-absent object is success
    async fn delete_object(&self, object: &DynamicObject) -> Result<(), Error>;
}

/// Create `objects` in order
///
/// When one fails, the objects created before it are deleted in reverse
/// order and the original error is returned.
pub async fn create_in_order(writer: &dyn ObjectWriter, objects: &[DynamicObject]) -> Result<(), Error> {
    for (created, object) in objects.iter().enumerate() {
        let Err(e) = writer.create_object(object).await else {
            continue;
        };
        for earlier in objects[..created].iter().rev() {
            if let Err(cleanup) = writer.delete_object(earlier).await {
                warn!(
                    object = %earlier.name_any(),
                    error = %cleanup,
                    "failed to clean up after aborted machine create"
                );
            }
        }
        return Err(e);
    }
    Ok(())
}

/// Name of a new machine: the control plane's name plus a random suffix
pub fn machine_name(control_plane: &str, suffix: &str) -> String {
    format!("{}-{}", control_plane, suffix.to_lowercase())
}

/// Kind of the object a template stamps out (`FooMachineTemplate` -> `FooMachine`)
pub fn templated_kind(template_kind: &str) -> String {
    template_kind
        .strip_suffix("Template")
        .unwrap_or(template_kind)
        .to_string()
}

fn labels(cluster: &str, control_plane: &str) -> serde_json::Value {
    json!({
        CLUSTER_NAME_LABEL: cluster,
        CONTROL_PLANE_LABEL: "",
        CONTROL_PLANE_NAME_LABEL: control_plane,
    })
}

fn owner_reference(control_plane: &ControlPlane) -> Result<serde_json::Value, Error> {
    let owner = control_plane.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "lifecycle",
            format!("control plane {} has no uid yet", control_plane.name_any()),
        )
    })?;
    serde_json::to_value(owner)
        .map_err(|e| Error::serialization_for_kind("OwnerReference", e.to_string()))
}

/// NodeConfig for a new machine, carrying the control plane's bootstrap spec
pub fn build_node_config(
    control_plane: &ControlPlane,
    cluster: &str,
    name: &str,
) -> Result<NodeConfig, Error> {
    let mut config = NodeConfig::new(name, control_plane.spec.node_config.clone());
    config.metadata.namespace = control_plane.namespace();
    config.metadata.labels = serde_json::from_value(labels(cluster, &control_plane.name_any()))
        .map_err(|e| Error::serialization_for_kind("NodeConfig", e.to_string()))?;
    config.metadata.owner_references = control_plane.controller_owner_ref(&()).map(|r| vec![r]);
    Ok(config)
}

/// Infrastructure machine cloned from a template's `spec.template`
pub fn build_infra_machine(
    control_plane: &ControlPlane,
    cluster: &str,
    name: &str,
    template: &DynamicObject,
) -> Result<DynamicObject, Error> {
    let types = template.types.as_ref().ok_or_else(|| {
        Error::configuration_for_field(
            control_plane.name_any(),
            "spec.machineTemplate.infrastructureRef",
            "infrastructure template has no apiVersion/kind",
        )
    })?;
    let spec = template
        .data
        .pointer("/spec/template/spec")
        .cloned()
        .unwrap_or_else(|| json!({}));

    serde_json::from_value(json!({
        "apiVersion": types.api_version,
        "kind": templated_kind(&types.kind),
        "metadata": {
            "name": name,
            "namespace": control_plane.namespace(),
            "labels": labels(cluster, &control_plane.name_any()),
            "ownerReferences": [owner_reference(control_plane)?],
        },
        "spec": spec,
    }))
    .map_err(|e| Error::serialization_for_kind("InfrastructureMachine", e.to_string()))
}

/// CAPI Machine referencing the NodeConfig and infrastructure machine
pub fn build_machine(
    control_plane: &ControlPlane,
    cluster: &str,
    name: &str,
    version: &str,
    infra: &DynamicObject,
) -> Result<DynamicObject, Error> {
    let infra_types = infra.types.as_ref().ok_or_else(|| {
        Error::internal_with_context("lifecycle", "infrastructure machine has no type meta")
    })?;
    serde_json::from_value(json!({
        "apiVersion": CAPI_API_VERSION,
        "kind": "Machine",
        "metadata": {
            "name": name,
            "namespace": control_plane.namespace(),
            "labels": labels(cluster, &control_plane.name_any()),
            "ownerReferences": [owner_reference(control_plane)?],
        },
        "spec": {
            "clusterName": cluster,
            "version": version,
            "bootstrap": {
                "configRef": {
                    "apiVersion": NodeConfig::api_version(&()),
                    "kind": NodeConfig::kind(&()),
                    "name": name,
                    "namespace": control_plane.namespace(),
                }
            },
            "infrastructureRef": {
                "apiVersion": infra_types.api_version,
                "kind": infra_types.kind,
                "name": name,
                "namespace": control_plane.namespace(),
            },
        },
    }))
    .map_err(|e| Error::serialization_for_kind("Machine", e.to_string()))
}

/// [`MachineLifecycle`] backed by the Kubernetes API
pub struct KubeMachineLifecycle {
    client: Client,
}

impl KubeMachineLifecycle {
    /// Create a lifecycle adapter using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl KubeMachineLifecycle {
    fn api_for(&self, object: &DynamicObject) -> Result<Api<DynamicObject>, Error> {
        let types = object.types.as_ref().ok_or_else(|| {
            Error::internal_with_context(
                "lifecycle",
                format!("{} has no apiVersion/kind", object.name_any()),
            )
        })?;
        Ok(Api::namespaced_with(
            self.client.clone(),
            &object.namespace().unwrap_or_default(),
            &build_api_resource(&types.api_version, &types.kind),
        ))
    }
}

#[async_trait]
impl ObjectWriter for KubeMachineLifecycle {
    async fn create_object(&self, object: &DynamicObject) -> Result<(), Error> {
        match self.api_for(object)?.create(&PostParams::default(), object).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, object: &DynamicObject) -> Result<(), Error> {
        match self
            .api_for(object)?
            .delete(&object.name_any(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!(object = %object.name_any(), "deleted");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl MachineLifecycle for KubeMachineLifecycle {
    async fn create(
        &self,
        control_plane: &ControlPlane,
        cluster: &str,
        version: &str,
    ) -> Result<String, Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let cp_name = control_plane.name_any();
        let template_ref = &control_plane.spec.machine_template.infrastructure_ref;
        let (Some(api_version), Some(kind)) = (&template_ref.api_version, &template_ref.kind)
        else {
            return Err(Error::configuration_for_field(
                &cp_name,
                "spec.machineTemplate.infrastructureRef",
                "apiVersion and kind are required",
            ));
        };

        let template_api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            template_ref.namespace_or(&namespace),
            &build_api_resource(api_version, kind),
        );
        let template = template_api.get_opt(&template_ref.name).await?.ok_or_else(|| {
            Error::resolution(
                format!("{} {}/{}", kind, namespace, template_ref.name),
                "infrastructure template not found",
            )
        })?;

        let suffix = Alphanumeric.sample_string(&mut rand::thread_rng(), NAME_SUFFIX_LEN);
        let name = machine_name(&cp_name, &suffix);

        let node_config = build_node_config(control_plane, cluster, &name)?;
        let infra = build_infra_machine(control_plane, cluster, &name, &template)?;
        let machine = build_machine(control_plane, cluster, &name, version, &infra)?;

        let node_config = serde_json::to_value(&node_config)
            .and_then(serde_json::from_value)
            .map_err(|e| Error::serialization_for_kind("NodeConfig", e.to_string()))?;

        create_in_order(self, &[node_config, infra, machine]).await?;

        info!(machine = %name, version = %version, "created control-plane machine");
        Ok(name)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let machines: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &machine_api_resource());
        match machines.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(machine = %name, "deleting control-plane machine");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(machine = %name, "machine already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
