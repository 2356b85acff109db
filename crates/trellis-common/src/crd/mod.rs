//! Custom Resource Definitions for Trellis
//!
//! NodeConfig/NodeConfigTemplate live in the CAPI bootstrap group,
//! ControlPlane in the CAPI control-plane group.

mod control_plane;
mod node_config;
mod types;

pub use control_plane::{ControlPlane, ControlPlaneSpec, ControlPlaneStatus, MachineTemplate};
pub use node_config::{
    AgentConfig, ComponentConfig, File, FileSource, Mirror, NodeConfig, NodeConfigSpec,
    NodeConfigStatus, NodeConfigTemplate, NodeConfigTemplateResource, NodeConfigTemplateSpec, Ntp,
    PrivateRegistriesConfig, RegistryConfig, SecretFileSource, TlsConfig,
};
pub use types::{
    find_condition, set_condition, Condition, ConditionStatus, ObjectRef,
    CONDITION_DATA_AVAILABLE, CONDITION_READY,
};
