//! Trellis operator: wires the bootstrap and control-plane providers into one binary

#![deny(missing_docs)]

/// Command line and environment configuration
pub mod config;
/// Controller construction
pub mod controller_runner;
/// CRD manifests and installation
pub mod crds;
