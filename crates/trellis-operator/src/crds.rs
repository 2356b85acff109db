//! CRD manifests and installation
//!
//! CRDs are installed by server-side apply through the [`ClusterAdapter`],
//! then each one is waited on until the API server reports it Established.

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::DynamicObject;
use kube::{CustomResourceExt, ResourceExt};

use trellis_common::adapter::{ClusterAdapter, WaitCondition};
use trellis_common::crd::{ControlPlane, NodeConfig, NodeConfigTemplate};
use trellis_common::retry::{retry_with_backoff, RetryConfig};
use trellis_common::Error;

/// Attempts at applying the CRDs before giving up
const APPLY_ATTEMPTS: u32 = 5;

/// Every CRD the operator serves
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![NodeConfig::crd(), NodeConfigTemplate::crd(), ControlPlane::crd()]
}

/// All CRDs as a multi-document YAML stream
pub fn crd_manifest() -> Result<String, Error> {
    let docs = all_crds()
        .iter()
        .map(|crd| {
            serde_yaml::to_string(crd)
                .map_err(|e| Error::serialization_for_kind("CustomResourceDefinition", e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

fn to_dynamic(crd: &CustomResourceDefinition) -> Result<DynamicObject, Error> {
    serde_json::to_value(crd)
        .and_then(serde_json::from_value)
        .map_err(|e| Error::serialization_for_kind("CustomResourceDefinition", e.to_string()))
}

/// Apply every CRD and wait until each is Established
pub async fn install_crds(adapter: &dyn ClusterAdapter, timeout: Duration) -> Result<(), Error> {
    let crds = all_crds();
    let objects = crds.iter().map(to_dynamic).collect::<Result<Vec<_>, _>>()?;

    retry_with_backoff(
        &RetryConfig::with_max_attempts(APPLY_ATTEMPTS),
        "apply CRDs",
        || adapter.apply(&objects),
    )
    .await?;

    for crd in &crds {
        let name = crd.name_any();
        tracing::info!(crd = %name, "waiting for CRD to be established");
        adapter
            .wait(&WaitCondition::crd_established(&name), timeout)
            .await?;
    }
    tracing::info!(count = crds.len(), "CRDs installed");
    Ok(())
}
