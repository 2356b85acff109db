//! NodeConfig and NodeConfigTemplate Custom Resource Definitions
//!
//! A NodeConfig describes how one machine boots: files to write, commands
//! to run around provisioning, per-component overrides, and private
//! registry settings. The bootstrap controller compiles it exactly once into
//! an immutable data Secret and records that Secret's name in
//! `status.dataSecretName`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ObjectRef};

/// Specification for a NodeConfig
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "NodeConfig",
    plural = "nodeconfigs",
    shortname = "nc",
    status = "NodeConfigStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"DataSecret","type":"string","jsonPath":".status.dataSecretName"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigSpec {
    /// Files written on the node, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<File>,

    /// Commands run before the generated provisioning steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pre_commands: Vec<String>,

    /// Commands run after the generated provisioning steps
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_commands: Vec<String>,

    /// Node agent configuration
    #[serde(default)]
    pub agent_config: AgentConfig,

    /// Private registry mirrors, auth, and TLS
    #[serde(default)]
    pub private_registries_config: PrivateRegistriesConfig,
}

/// A file to write on the node
///
/// Exactly one of `content` and `contentFrom` must be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Absolute path on the node
    pub path: String,

    /// Ownership as `user:group`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Octal permissions (e.g. "0600")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<String>,

    /// Inline content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Content read from a referenced source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_from: Option<FileSource>,
}

/// Source of file content
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSource {
    /// Key within a Secret in the NodeConfig's namespace
    pub secret: SecretFileSource,
}

/// A key inside a Secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretFileSource {
    /// Secret name
    pub name: String,
    /// Key within the Secret's data
    pub key: String,
}

/// Node agent configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Labels applied to the node at registration, as `key=value`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_labels: Vec<String>,

    /// Taints applied to the node at registration, as `key=value:Effect`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_taints: Vec<String>,

    /// Time synchronization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntp: Option<Ntp>,

    /// ConfigMap holding the kubelet image credential provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_credential_provider_config_map: Option<ObjectRef>,

    /// ConfigMap holding a resolv.conf for the kubelet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolv_conf: Option<ObjectRef>,

    /// Kubelet overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubelet: Option<ComponentConfig>,

    /// Kube-proxy overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_proxy: Option<ComponentConfig>,
}

/// NTP settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Ntp {
    /// NTP servers, in preference order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub servers: Vec<String>,

    /// Unset means "leave the platform default alone"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Overrides for one node process (kubelet, kube-proxy)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentConfig {
    /// Environment overrides, keyed by variable name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_env: BTreeMap<String, String>,

    /// Arguments appended after the defaults, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,

    /// Host path mounts, host path to container path
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_mounts: BTreeMap<String, String>,
}

/// Private registry configuration, keyed by registry host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrivateRegistriesConfig {
    /// Mirror endpoints per upstream registry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mirrors: BTreeMap<String, Mirror>,

    /// Auth and TLS per registry host
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, RegistryConfig>,
}

impl PrivateRegistriesConfig {
    /// Check if no registry is configured
    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty() && self.configs.is_empty()
    }
}

/// Mirror endpoints for one upstream registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    /// Endpoints tried in order
    #[serde(default)]
    pub endpoint: Vec<String>,

    /// Repository rewrite rules, regex to replacement
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rewrite: BTreeMap<String, String>,
}

/// Auth and TLS settings for one registry host
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Secret with any of `username`, `password`, `auth`, `identity-token`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_secret: Option<ObjectRef>,

    /// TLS settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// TLS settings for a registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// Secret with any of `ca.crt`, `tls.crt`, `tls.key`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config_secret: Option<ObjectRef>,

    /// Skip server certificate verification
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

/// Status for a NodeConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigStatus {
    /// Name of the Secret holding the bootstrap payload. Set once, never changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,

    /// True once bootstrap data is available
    #[serde(default)]
    pub ready: bool,

    /// Generation last acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Current conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeConfig {
    /// The data Secret name, if bootstrap data has been frozen
    pub fn data_secret_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.data_secret_name.as_deref())
    }
}

/// Specification for a NodeConfigTemplate
///
/// Used by MachineDeployments to stamp out one NodeConfig per machine.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bootstrap.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "NodeConfigTemplate",
    plural = "nodeconfigtemplates",
    shortname = "nct",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigTemplateSpec {
    /// Template for the NodeConfigs created from this template
    pub template: NodeConfigTemplateResource,
}

/// Template body
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfigTemplateResource {
    /// Spec copied into each NodeConfig
    #[serde(default)]
    pub spec: NodeConfigSpec,
}
