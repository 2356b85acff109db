//! Bootstrap provider for Trellis
//!
//! Compiles a NodeConfig and everything it references into an immutable
//! `#cloud-config` payload, stores it in a Secret, and freezes the
//! NodeConfig's `status.dataSecretName` exactly once.

#![deny(missing_docs)]

pub mod client;
pub mod cloud_init;
pub mod compiler;
pub mod components;
pub mod controller;
pub mod registry;
pub mod resolver;

pub use compiler::{compile, CompileInput, NodeRole, Payload};
pub use controller::{error_policy, reconcile, Context};
pub use registry::{compile_registries, normalize_host, CompiledRegistry};
pub use resolver::{resolve_node_config, Reference, ResolvedInputs, Resolver};
