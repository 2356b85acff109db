//! Bootstrap data compiler
//!
//! Turns a NodeConfig spec plus everything it references (already resolved
//! to bytes) into one `#cloud-config` payload. Compilation is pure: no API
//! calls, no clock, no randomness. The same inputs always produce the same
//! bytes and therefore the same digest.

use std::fmt;

use serde::Serialize;

use trellis_common::crd::{File, NodeConfigSpec, Ntp, SecretFileSource};
use trellis_common::kube_utils::deterministic_hash;
use trellis_common::Error;

use crate::cloud_init::{CloudConfig, WriteFile};
use crate::components::{merge_kube_proxy, merge_kubelet};
use crate::registry::{CompiledRegistry, REGISTRIES_PATH};
use crate::resolver::ResolvedInputs;

/// RKE2 node configuration file
pub const CONFIG_PATH: &str = "/etc/rancher/rke2/config.yaml";

/// Where the image credential provider config is written
pub const CREDENTIAL_PROVIDER_PATH: &str = "/etc/rancher/rke2/credential-provider-config.yaml";

/// Where the referenced resolv.conf is written
pub const RESOLV_CONF_PATH: &str = "/etc/rancher/rke2/resolv.conf";

/// systemd-timesyncd drop-in holding the configured NTP servers
pub const NTP_CONFIG_PATH: &str = "/etc/systemd/timesyncd.conf.d/trellis.conf";

/// File written once provisioning finished, read by infrastructure providers
pub const SENTINEL_PATH: &str = "/run/cluster-api/bootstrap-success.complete";

/// Port supervisors listen on for joining nodes
pub const SUPERVISOR_PORT: u16 = 9345;

const INSTALL_SCRIPT_URL: &str = "https://get.rke2.io";

/// Which RKE2 service a node runs
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Control-plane member
    Server,
    /// Worker
    Agent,
}

impl NodeRole {
    /// Name used by the install script and the systemd unit
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor URL for a control-plane endpoint host
pub fn join_url(endpoint_host: &str) -> String {
    format!("https://{}:{}", endpoint_host, SUPERVISOR_PORT)
}

/// Cluster-level inputs that are not part of the NodeConfig spec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompileInput<'a> {
    /// NodeConfig name, for error messages
    pub resource: &'a str,
    /// The spec being compiled
    pub spec: &'a NodeConfigSpec,
    /// Which service the node runs
    pub role: NodeRole,
    /// RKE2 version to install, or the channel default
    pub version: Option<&'a str>,
    /// Cluster join token
    pub token: &'a str,
    /// Supervisor URL to join, or None when this node initializes the cluster
    pub server: Option<&'a str>,
}

/// A compiled bootstrap payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload {
    /// Rendered `#cloud-config` document
    pub data: Vec<u8>,
    /// Truncated SHA-256 of `data`
    pub digest: String,
}

/// Where one `spec.files` entry gets its content
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileSourceKind<'a> {
    /// Inline content
    Inline(&'a str),
    /// A key in a Secret
    Secret(&'a SecretFileSource),
}

/// Check that a file declares exactly one content source and an absolute path
pub fn file_source<'a>(
    resource: &str,
    index: usize,
    file: &'a File,
) -> Result<FileSourceKind<'a>, Error> {
    let field = format!("spec.files[{}]", index);
    if !file.path.starts_with('/') {
        return Err(Error::configuration_for_field(
            resource,
            field,
            format!("path '{}' must be absolute", file.path),
        ));
    }
    match (&file.content, &file.content_from) {
        (Some(content), None) => Ok(FileSourceKind::Inline(content)),
        (None, Some(source)) => {
            if source.secret.name.is_empty() || source.secret.key.is_empty() {
                return Err(Error::configuration_for_field(
                    resource,
                    field,
                    "contentFrom.secret needs both name and key",
                ));
            }
            Ok(FileSourceKind::Secret(&source.secret))
        }
        (Some(_), Some(_)) => Err(Error::configuration_for_field(
            resource,
            field,
            format!("file {} sets both content and contentFrom", file.path),
        )),
        (None, None) => Err(Error::configuration_for_field(
            resource,
            field,
            format!("file {} sets neither content nor contentFrom", file.path),
        )),
    }
}

/// RKE2 `config.yaml`; field order is the serialization order
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Rke2Config<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    server: Option<&'a str>,
    token: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    node_label: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    node_taint: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kubelet_arg: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kube_proxy_arg: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kube_proxy_extra_env: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    kube_proxy_extra_mount: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_credential_provider_config: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolv_conf: Option<&'a str>,
}

/// Compile a NodeConfig into its bootstrap payload
pub fn compile(
    input: &CompileInput<'_>,
    resolved: &ResolvedInputs,
    registry: &CompiledRegistry,
) -> Result<Payload, Error> {
    let spec = input.spec;
    if resolved.files.len() != spec.files.len() {
        return Err(Error::internal_with_context(
            "compiler",
            format!(
                "{} declares {} files but {} were resolved",
                input.resource,
                spec.files.len(),
                resolved.files.len()
            ),
        ));
    }

    let mut doc = CloudConfig::default();

    for (index, (file, content)) in spec.files.iter().zip(&resolved.files).enumerate() {
        file_source(input.resource, index, file)?;
        let mut entry = WriteFile::from_bytes(&file.path, content);
        entry.owner = file.owner.clone();
        entry.permissions = file.permissions.clone();
        doc.write_files.push(entry);
    }

    let agent = &spec.agent_config;
    let kubelet = merge_kubelet(agent.kubelet.as_ref());
    if !kubelet.mounts.is_empty() {
        return Err(Error::configuration_for_field(
            input.resource,
            "spec.agentConfig.kubelet.extraMounts",
            "kubelet runs on the host and does not accept extra mounts",
        ));
    }
    let kube_proxy = merge_kube_proxy(agent.kube_proxy.as_ref());

    let config = Rke2Config {
        server: input.server,
        token: input.token,
        node_label: agent.node_labels.clone(),
        node_taint: agent.node_taints.clone(),
        kubelet_arg: kubelet.config_args(),
        kube_proxy_arg: kube_proxy.config_args(),
        kube_proxy_extra_env: kube_proxy.env_entries(),
        kube_proxy_extra_mount: kube_proxy.mount_entries(),
        image_credential_provider_config: resolved
            .credential_provider_config
            .as_ref()
            .map(|_| CREDENTIAL_PROVIDER_PATH),
        resolv_conf: resolved.resolv_conf.as_ref().map(|_| RESOLV_CONF_PATH),
    };
    let config_yaml = serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("config.yaml", e.to_string()))?;
    doc.write_files
        .push(WriteFile::text(CONFIG_PATH, config_yaml, "0600"));

    if !registry.is_empty() {
        doc.write_files
            .push(WriteFile::text(REGISTRIES_PATH, registry.to_yaml()?, "0600"));
        doc.write_files.extend(registry.files.iter().cloned());
    }

    if !kubelet.env.is_empty() {
        let mut env = kubelet.env_entries().join("\n");
        env.push('\n');
        doc.write_files.push(WriteFile::text(
            format!("/etc/default/rke2-{}", input.role),
            env,
            "0644",
        ));
    }

    if let Some(content) = &resolved.credential_provider_config {
        let mut file = WriteFile::from_bytes(CREDENTIAL_PROVIDER_PATH, content);
        file.permissions = Some("0644".to_string());
        doc.write_files.push(file);
    }
    if let Some(content) = &resolved.resolv_conf {
        let mut file = WriteFile::from_bytes(RESOLV_CONF_PATH, content);
        file.permissions = Some("0644".to_string());
        doc.write_files.push(file);
    }

    doc.runcmd.extend(spec.pre_commands.iter().cloned());
    if let Some(ntp) = &agent.ntp {
        ntp_step(ntp, &mut doc);
    }
    doc.runcmd.extend(provisioning_commands(input.role, input.version));
    doc.runcmd.extend(spec.post_commands.iter().cloned());

    let rendered = doc.render()?;
    let digest = deterministic_hash(rendered.as_bytes());
    Ok(Payload {
        data: rendered.into_bytes(),
        digest,
    })
}

fn ntp_step(ntp: &Ntp, doc: &mut CloudConfig) {
    if !ntp.servers.is_empty() {
        doc.write_files.push(WriteFile::text(
            NTP_CONFIG_PATH,
            format!("[Time]\nNTP={}\n", ntp.servers.join(" ")),
            "0644",
        ));
    }
    match ntp.enabled {
        Some(true) => {
            doc.runcmd.push("timedatectl set-ntp true".to_string());
            if !ntp.servers.is_empty() {
                doc.runcmd
                    .push("systemctl restart systemd-timesyncd.service".to_string());
            }
        }
        Some(false) => doc.runcmd.push("timedatectl set-ntp false".to_string()),
        None if !ntp.servers.is_empty() => doc
            .runcmd
            .push("systemctl try-restart systemd-timesyncd.service".to_string()),
        None => {}
    }
}

fn provisioning_commands(role: NodeRole, version: Option<&str>) -> Vec<String> {
    let mut install_env = format!("INSTALL_RKE2_TYPE={}", role);
    if let Some(version) = version {
        install_env.push_str(&format!(" INSTALL_RKE2_VERSION={}", version));
    }
    vec![
        format!("curl -sfL {} | {} sh -", INSTALL_SCRIPT_URL, install_env),
        format!("systemctl enable --now rke2-{}.service", role),
        "mkdir -p /run/cluster-api".to_string(),
        format!("echo success > {}", SENTINEL_PATH),
    ]
}
