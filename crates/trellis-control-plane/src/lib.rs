//! Control-plane provider for Trellis
//!
//! Scales a set of RKE2 server machines and rolls them to new versions one
//! replacement at a time, never removing a member when that would leave the
//! healthy membership below quorum.

#![deny(missing_docs)]

pub mod controller;
pub mod lifecycle;
pub mod machines;
pub mod scaling;
pub mod status;

pub use controller::{error_policy, reconcile, Context, KubeClient, FINALIZER};
pub use lifecycle::{KubeMachineLifecycle, MachineLifecycle};
pub use machines::{machine_selector, observe, KubeMachineTracker, MachineTracker, ObservedMachine};
pub use scaling::{plan, quorum, ScalingAction};
pub use status::observed_status;
