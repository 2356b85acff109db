//! Kubernetes helpers shared by the Trellis controllers

use std::future::Future;
use std::time::Duration;

use kube::api::{Api, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;
use tracing::trace;

use crate::Error;

/// API version of the CAPI core types Trellis reads and writes
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// Default interval for [`poll_until`]
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Parse an apiVersion into (group, version); core types have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from a known apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// ApiResource for CAPI `Machine`
pub fn machine_api_resource() -> ApiResource {
    build_api_resource(CAPI_API_VERSION, "Machine")
}

/// ApiResource for CAPI `Cluster`
pub fn cluster_api_resource() -> ApiResource {
    build_api_resource(CAPI_API_VERSION, "Cluster")
}

const KIND_PLURALS: &[(&str, &str)] = &[
    ("machine", "machines"),
    ("cluster", "clusters"),
    ("machinedeployment", "machinedeployments"),
    ("machineset", "machinesets"),
    ("nodeconfig", "nodeconfigs"),
    ("nodeconfigtemplate", "nodeconfigtemplates"),
    ("controlplane", "controlplanes"),
    ("dockermachine", "dockermachines"),
    ("dockermachinetemplate", "dockermachinetemplates"),
    ("awsmachine", "awsmachines"),
    ("awsmachinetemplate", "awsmachinetemplates"),
    ("proxmoxmachine", "proxmoxmachines"),
    ("proxmoxmachinetemplate", "proxmoxmachinetemplates"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for known CAPI types, falling back to simple
/// English rules for everything else.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Compute a deterministic hash of the input bytes, returning a 16-char hex digest.
///
/// Truncated SHA-256; stable across toolchains, so safe to persist in annotations.
pub fn deterministic_hash(input: &[u8]) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input);
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// `namespace/name` key used for logs and per-object bookkeeping
pub fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Check whether a kube error is a 404
pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 404)
}

/// Check whether a kube error is a 409 (already exists or version conflict)
pub fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(ae) if ae.code == 409)
}

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Errors are logged at trace level and polling continues.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("polling condition not yet met"),
            Err(e) => trace!(error = %e, "polling check returned error"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Merge-patch body for a status write
///
/// With a resourceVersion the body doubles as a precondition: the API
/// server rejects it with 409 if the object moved since it was read.
pub fn status_patch(
    status: &impl serde::Serialize,
    resource_version: Option<&str>,
) -> serde_json::Value {
    match resource_version {
        Some(rv) => serde_json::json!({
            "metadata": { "resourceVersion": rv },
            "status": status,
        }),
        None => serde_json::json!({ "status": status }),
    }
}

/// Patch the status sub-resource of a namespaced resource with a merge patch.
///
/// Pass the observed `resource_version` to make the write conditional.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    resource_version: Option<&str>,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_patch(status, resource_version);
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
