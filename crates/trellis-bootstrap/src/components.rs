//! Override merging for node processes
//!
//! Every overridable process (kubelet, kube-proxy) goes through the same
//! policy: defaults first, then each layer's `extraArgs` appended in order,
//! then `extraEnv` and `extraMounts` applied as keyed overrides where later
//! layers win.

use std::collections::BTreeMap;

use trellis_common::crd::ComponentConfig;

/// Kubelet arguments every node gets before any override
pub const KUBELET_DEFAULT_ARGS: &[&str] = &["--anonymous-auth=false", "--read-only-port=0"];

/// Kube-proxy has no default arguments
pub const KUBE_PROXY_DEFAULT_ARGS: &[&str] = &[];

/// Result of merging defaults with override layers
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergedComponent {
    /// Arguments, defaults first
    pub args: Vec<String>,
    /// Environment, keyed by name
    pub env: BTreeMap<String, String>,
    /// Mounts, host path to container path
    pub mounts: BTreeMap<String, String>,
}

impl MergedComponent {
    /// Arguments as RKE2 config.yaml list entries (no leading `--`)
    pub fn config_args(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.trim_start_matches('-').to_string())
            .collect()
    }

    /// Mounts as `host:container` entries
    pub fn mount_entries(&self) -> Vec<String> {
        self.mounts
            .iter()
            .map(|(host, container)| format!("{}:{}", host, container))
            .collect()
    }

    /// Environment as `KEY=value` entries
    pub fn env_entries(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

/// Merge defaults with override layers, earliest layer first
pub fn merge_component(
    default_args: &[&str],
    default_env: &BTreeMap<String, String>,
    layers: &[&ComponentConfig],
) -> MergedComponent {
    let mut merged = MergedComponent {
        args: default_args.iter().map(|a| a.to_string()).collect(),
        env: default_env.clone(),
        mounts: BTreeMap::new(),
    };
    for layer in layers {
        merged.args.extend(layer.extra_args.iter().cloned());
        for (k, v) in &layer.extra_env {
            merged.env.insert(k.clone(), v.clone());
        }
        for (k, v) in &layer.extra_mounts {
            merged.mounts.insert(k.clone(), v.clone());
        }
    }
    merged
}

/// Merge kubelet defaults with an optional override
pub fn merge_kubelet(config: Option<&ComponentConfig>) -> MergedComponent {
    let layers: Vec<&ComponentConfig> = config.into_iter().collect();
    merge_component(KUBELET_DEFAULT_ARGS, &BTreeMap::new(), &layers)
}

/// Merge kube-proxy defaults with an optional override
pub fn merge_kube_proxy(config: Option<&ComponentConfig>) -> MergedComponent {
    let layers: Vec<&ComponentConfig> = config.into_iter().collect();
    merge_component(KUBE_PROXY_DEFAULT_ARGS, &BTreeMap::new(), &layers)
}
