//! Kubernetes operations used by the NodeConfig controller
//!
//! All writes here are idempotent: Secrets and the init lock are
//! create-if-absent, and every status write carries the observed
//! resourceVersion so only one writer can ever set `dataSecretName` and
//! nothing written from a stale read lands on a frozen config.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use kube::api::{Api, DeleteParams, DynamicObject, PostParams, Preconditions};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[cfg(test)]
use mockall::automock;

use trellis_common::crd::{NodeConfig, NodeConfigStatus};
use trellis_common::kube_utils::{
    cluster_api_resource, is_conflict, is_not_found, machine_api_resource, patch_resource_status,
};
use trellis_common::{Error, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL};

use crate::compiler::Payload;

/// Secret type Cluster API expects for bootstrap data
pub const BOOTSTRAP_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";

/// Key holding the payload in the data Secret, and the token in the token Secret
pub const SECRET_VALUE_KEY: &str = "value";

/// Annotation carrying the payload digest on the data Secret
pub const DIGEST_ANNOTATION: &str = "bootstrap.cluster.x-k8s.io/data-digest";

/// Key in the init lock ConfigMap naming the machine that holds it
pub const INIT_LOCK_HOLDER_KEY: &str = "holder";

/// Random bytes in a generated join token
const TOKEN_BYTES: usize = 32;

/// Create attempts per lock acquisition; the second follows a stale release
const INIT_LOCK_ATTEMPTS: usize = 2;

/// Name of the ConfigMap serializing cluster initialization
pub fn init_lock_name(cluster: &str) -> String {
    format!("{}-init-lock", cluster)
}

/// Name of the Secret holding the cluster join token
pub fn token_secret_name(cluster: &str) -> String {
    format!("{}-token", cluster)
}

/// Generate a cluster join token from the system random source
pub fn generate_cluster_token() -> Result<String, Error> {
    let mut raw = Zeroizing::new(vec![0u8; TOKEN_BYTES]);
    aws_lc_rs::rand::fill(raw.as_mut_slice()).map_err(|_| {
        Error::internal_with_context("cluster token", "system random source unavailable")
    })?;
    Ok(URL_SAFE_NO_PAD.encode(raw.as_slice()))
}

/// The parts of a CAPI Machine the bootstrap provider reads
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerMachine {
    /// Machine name
    pub name: String,
    /// Cluster the machine belongs to
    pub cluster_name: String,
    /// Kubernetes/RKE2 version requested for the machine
    pub version: Option<String>,
    /// Whether the machine is a control-plane member
    pub is_control_plane: bool,
}

/// The parts of a CAPI Cluster the bootstrap provider reads
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterInfo {
    /// `status.infrastructureReady`
    pub infrastructure_ready: bool,
    /// Control plane has bootstrapped its first member
    pub control_plane_initialized: bool,
    /// `spec.controlPlaneEndpoint.host`, when set
    pub endpoint: Option<String>,
}

/// Name of the Machine owning a NodeConfig, from its owner references
pub fn owner_machine_name(config: &NodeConfig) -> Option<String> {
    config
        .owner_references()
        .iter()
        .find(|r| r.kind == "Machine" && r.api_version.starts_with("cluster.x-k8s.io/"))
        .map(|r| r.name.clone())
}

/// Project a CAPI Machine onto [`OwnerMachine`]
pub fn owner_machine_from(machine: &DynamicObject) -> Result<OwnerMachine, Error> {
    let name = machine.name_any();
    let cluster_name = machine
        .labels()
        .get(CLUSTER_NAME_LABEL)
        .cloned()
        .or_else(|| {
            machine
                .data
                .pointer("/spec/clusterName")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        })
        .ok_or_else(|| {
            Error::not_ready(&name, "machine does not name its cluster yet")
        })?;
    Ok(OwnerMachine {
        cluster_name,
        version: machine
            .data
            .pointer("/spec/version")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        is_control_plane: machine.labels().contains_key(CONTROL_PLANE_LABEL),
        name,
    })
}

/// Project a CAPI Cluster onto [`ClusterInfo`]
pub fn cluster_info_from(cluster: &DynamicObject) -> ClusterInfo {
    let status = cluster.data.get("status");
    let flag = |field: &str| {
        status
            .and_then(|s| s.get(field))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    };
    let initialized_condition = status
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("ControlPlaneInitialized")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        });
    ClusterInfo {
        infrastructure_ready: flag("infrastructureReady"),
        control_plane_initialized: initialized_condition || flag("controlPlaneReady"),
        endpoint: cluster
            .data
            .pointer("/spec/controlPlaneEndpoint/host")
            .and_then(|v| v.as_str())
            .filter(|h| !h.is_empty())
            .map(str::to_string),
    }
}

/// Kubernetes operations for NodeConfig reconciliation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a NodeConfig, None if it no longer exists
    async fn get_node_config(&self, namespace: &str, name: &str)
        -> Result<Option<NodeConfig>, Error>;

    /// Fetch the owning Machine, None if it does not exist (yet)
    async fn get_machine(&self, namespace: &str, name: &str)
        -> Result<Option<OwnerMachine>, Error>;

    /// Fetch the owning Cluster, None if it does not exist (yet)
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<Option<ClusterInfo>, Error>;

    /// Try to become the machine that initializes the cluster
    ///
    /// Returns true if `holder` holds the lock, including when it already did.
    async fn acquire_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
        holder: &str,
    ) -> Result<bool, Error>;

    /// Read the cluster join token, generating it on first use
    async fn ensure_cluster_token(&self, namespace: &str, cluster: &str) -> Result<String, Error>;

    /// Create the immutable data Secret if absent and return its name
    async fn ensure_data_secret(
        &self,
        config: &NodeConfig,
        cluster: &str,
        payload: &Payload,
    ) -> Result<String, Error>;

    /// Write a status only if the NodeConfig is still at the observed resourceVersion
    async fn freeze_status(&self, config: &NodeConfig, status: &NodeConfigStatus)
        -> Result<(), Error>;

    /// Merge-patch a non-freezing status, guarded like [`KubeClient::freeze_status`]
    ///
    /// Fails with a conflict when the NodeConfig moved since `config` was read.
    async fn patch_status(&self, config: &NodeConfig, status: &NodeConfigStatus)
        -> Result<(), Error>;
}

/// An init lock as last read from the cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitLock {
    /// Machine holding the lock, None if the holder key is missing
    pub holder: Option<String>,
    /// Lock object uid
    pub uid: Option<String>,
    /// Lock object resourceVersion
    pub resource_version: Option<String>,
}

/// Storage primitives behind [`acquire_init_lock`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InitLockStore: Send + Sync {
    /// Create the lock naming `holder`; false if a lock already exists
    async fn create_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
        holder: &str,
    ) -> Result<bool, Error>;

    /// Read the lock, None if absent
    async fn get_init_lock(&self, namespace: &str, cluster: &str)
        -> Result<Option<InitLock>, Error>;

    /// Delete exactly this revision of the lock; false if it moved or vanished
    async fn delete_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
        lock: &InitLock,
    ) -> Result<bool, Error>;

    /// Whether the named Machine still exists
    async fn machine_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;
}

/// Try to make `holder` the machine that initializes the cluster
///
/// A lock whose holder Machine no longer exists is released, conditional on
/// its uid and resourceVersion, and contended for again. Returns true if
/// `holder` holds the lock, including when it already did.
pub async fn acquire_init_lock(
    store: &dyn InitLockStore,
    namespace: &str,
    cluster: &str,
    holder: &str,
) -> Result<bool, Error> {
    for _ in 0..INIT_LOCK_ATTEMPTS {
        if store.create_init_lock(namespace, cluster, holder).await? {
            info!(cluster = %cluster, holder = %holder, "acquired init lock");
            return Ok(true);
        }
        // Released between our create and this read; contend again
        let Some(lock) = store.get_init_lock(namespace, cluster).await? else {
            continue;
        };
        if let Some(current) = lock.holder.as_deref() {
            if current == holder {
                return Ok(true);
            }
            if store.machine_exists(namespace, current).await? {
                debug!(cluster = %cluster, holder = %current, "init lock already held");
                return Ok(false);
            }
        }
        warn!(
            cluster = %cluster,
            holder = ?lock.holder,
            "releasing init lock whose holder machine is gone"
        );
        if !store.delete_init_lock(namespace, cluster, &lock).await? {
            debug!(cluster = %cluster, "init lock changed while releasing it");
        }
    }
    Ok(false)
}

/// [`KubeClient`] backed by the Kubernetes API
pub struct KubeClientImpl {
    client: Client,
    field_manager: String,
}

impl KubeClientImpl {
    /// Create a client writing as the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn node_configs(&self, namespace: &str) -> Api<NodeConfig> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_node_config(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<NodeConfig>, Error> {
        Ok(self.node_configs(namespace).get_opt(name).await?)
    }

    async fn get_machine(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<OwnerMachine>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &machine_api_resource());
        match api.get_opt(name).await? {
            Some(machine) => Ok(Some(owner_machine_from(&machine)?)),
            None => Ok(None),
        }
    }

    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterInfo>, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &cluster_api_resource());
        Ok(api.get_opt(name).await?.map(|c| cluster_info_from(&c)))
    }

    async fn acquire_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
        holder: &str,
    ) -> Result<bool, Error> {
        acquire_init_lock(self, namespace, cluster, holder).await
    }

    async fn ensure_cluster_token(&self, namespace: &str, cluster: &str) -> Result<String, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let name = token_secret_name(cluster);

        if let Some(existing) = api.get_opt(&name).await? {
            return token_from(&existing, &name);
        }

        let token = generate_cluster_token()?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    cluster.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some(BOOTSTRAP_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                SECRET_VALUE_KEY.to_string(),
                ByteString(token.clone().into_bytes()),
            )])),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!(cluster = %cluster, "generated cluster join token");
                Ok(token)
            }
            // Another machine created it first; use theirs
            Err(e) if is_conflict(&e) => token_from(&api.get(&name).await?, &name),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_data_secret(
        &self,
        config: &NodeConfig,
        cluster: &str,
        payload: &Payload,
    ) -> Result<String, Error> {
        let namespace = config.namespace().unwrap_or_default();
        let name = config.name_any();
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    cluster.to_string(),
                )])),
                annotations: Some(BTreeMap::from([(
                    DIGEST_ANNOTATION.to_string(),
                    payload.digest.clone(),
                )])),
                owner_references: config.controller_owner_ref(&()).map(|r| vec![r]),
                ..Default::default()
            },
            immutable: Some(true),
            type_: Some(BOOTSTRAP_SECRET_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                SECRET_VALUE_KEY.to_string(),
                ByteString(payload.data.clone()),
            )])),
            ..Default::default()
        };

        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => {
                info!(secret = %name, digest = %payload.digest, "created bootstrap data secret");
                Ok(name)
            }
            Err(e) if is_conflict(&e) => {
                // Left behind by a pass that crashed before freezing
                debug!(secret = %name, "bootstrap data secret already exists");
                Ok(name)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn freeze_status(
        &self,
        config: &NodeConfig,
        status: &NodeConfigStatus,
    ) -> Result<(), Error> {
        self.guarded_status_write(config, status).await
    }

    async fn patch_status(
        &self,
        config: &NodeConfig,
        status: &NodeConfigStatus,
    ) -> Result<(), Error> {
        self.guarded_status_write(config, status).await
    }
}

impl KubeClientImpl {
    async fn guarded_status_write(
        &self,
        config: &NodeConfig,
        status: &NodeConfigStatus,
    ) -> Result<(), Error> {
        let namespace = config.namespace().unwrap_or_default();
        let name = config.name_any();
        let resource_version = config.resource_version().ok_or_else(|| {
            Error::internal_with_context("status", format!("{} has no resourceVersion", name))
        })?;
        patch_resource_status::<NodeConfig>(
            &self.client,
            &name,
            &namespace,
            status,
            Some(resource_version.as_str()),
            &self.field_manager,
        )
        .await
        .map_err(|e| Error::from_guarded_write(format!("{}/{}", namespace, name), e))
    }
}

#[async_trait]
impl InitLockStore for KubeClientImpl {
    async fn create_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
        holder: &str,
    ) -> Result<bool, Error> {
        let lock = ConfigMap {
            metadata: ObjectMeta {
                name: Some(init_lock_name(cluster)),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    CLUSTER_NAME_LABEL.to_string(),
                    cluster.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                INIT_LOCK_HOLDER_KEY.to_string(),
                holder.to_string(),
            )])),
            ..Default::default()
        };
        match self.config_maps(namespace).create(&PostParams::default(), &lock).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
    ) -> Result<Option<InitLock>, Error> {
        let lock = self
            .config_maps(namespace)
            .get_opt(&init_lock_name(cluster))
            .await?;
        Ok(lock.map(|cm| InitLock {
            holder: cm
                .data
                .as_ref()
                .and_then(|d| d.get(INIT_LOCK_HOLDER_KEY))
                .cloned(),
            uid: cm.metadata.uid,
            resource_version: cm.metadata.resource_version,
        }))
    }

    async fn delete_init_lock(
        &self,
        namespace: &str,
        cluster: &str,
        lock: &InitLock,
    ) -> Result<bool, Error> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: lock.uid.clone(),
                resource_version: lock.resource_version.clone(),
            }),
            ..Default::default()
        };
        match self
            .config_maps(namespace)
            .delete(&init_lock_name(cluster), &params)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) || is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn machine_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &machine_api_resource());
        Ok(api.get_opt(name).await?.is_some())
    }
}

fn token_from(secret: &Secret, name: &str) -> Result<String, Error> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SECRET_VALUE_KEY))
        .ok_or_else(|| {
            Error::resolution(
                format!("secret {} key={}", name, SECRET_VALUE_KEY),
                "cluster token secret has no value",
            )
        })?;
    String::from_utf8(bytes.0.clone()).map_err(|_| {
        Error::resolution(
            format!("secret {} key={}", name, SECRET_VALUE_KEY),
            "cluster token is not valid UTF-8",
        )
    })
}
