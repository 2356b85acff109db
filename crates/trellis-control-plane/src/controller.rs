//! ControlPlane controller
//!
//! Every pass observes the control plane's Machines afresh, recomputes
//! status, and takes at most one step toward the desired size and version.
//! Waiting is expressed as a requeue, never as an in-process sleep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use trellis_common::backoff::BackoffTracker;
use trellis_common::crd::{
    set_condition, Condition, ConditionStatus, ControlPlane, ControlPlaneStatus, CONDITION_READY,
};
use trellis_common::kube_utils::object_key;
use trellis_common::{Error, CLUSTER_NAME_LABEL, DEFAULT_FIELD_MANAGER};

use crate::lifecycle::{KubeMachineLifecycle, MachineLifecycle};
use crate::machines::{machine_selector, KubeMachineTracker, MachineTracker, ObservedMachine};
use crate::scaling::{plan, ScalingAction};
use crate::status::observed_status;

/// Finalizer holding the ControlPlane until its machines are gone
pub const FINALIZER: &str = "controlplane.cluster.x-k8s.io/trellis";

/// Requeue delay while a step is in flight
pub const PROGRESS_REQUEUE: Duration = Duration::from_secs(10);

/// Default resync period once converged
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// Kubernetes writes on the ControlPlane itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Write status only if the ControlPlane is still at the observed resourceVersion
    async fn patch_status(
        &self,
        control_plane: &ControlPlane,
        status: &ControlPlaneStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer if not already present
    async fn add_finalizer(&self, namespace: &str, name: &str, finalizer: &str)
        -> Result<(), Error>;

    /// Remove a finalizer
    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
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

    fn control_planes(&self, namespace: &str) -> Api<ControlPlane> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.control_planes(namespace)
            .patch(name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_status(
        &self,
        control_plane: &ControlPlane,
        status: &ControlPlaneStatus,
    ) -> Result<(), Error> {
        let namespace = control_plane.namespace().unwrap_or_default();
        let name = control_plane.name_any();
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": control_plane.resource_version() },
            "status": status,
        });
        self.control_planes(&namespace)
            .patch_status(&name, &PatchParams::apply(&self.field_manager), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_guarded_write(object_key(&namespace, &name), e))?;
        Ok(())
    }

    async fn add_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let current = self.control_planes(namespace).get(name).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(
        &self,
        namespace: &str,
        name: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let current = self.control_planes(namespace).get(name).await?;
        let finalizers: Vec<String> = current
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.patch_finalizers(namespace, name, finalizers).await
    }
}

/// Shared state for the ControlPlane controller
pub struct Context {
    /// Writes on the ControlPlane (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Machine observation
    pub tracker: Arc<dyn MachineTracker>,
    /// Machine creation and deletion
    pub lifecycle: Arc<dyn MachineLifecycle>,
    /// Consecutive failure counts per ControlPlane
    pub backoff: BackoffTracker,
    /// Requeue period once converged
    pub resync: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        tracker: Arc<dyn MachineTracker>,
        lifecycle: Arc<dyn MachineLifecycle>,
    ) -> Self {
        Self {
            kube,
            tracker,
            lifecycle,
            backoff: BackoffTracker::default(),
            resync: DEFAULT_RESYNC,
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    field_manager: String,
    resync: Duration,
    kube: Option<Arc<dyn KubeClient>>,
    tracker: Option<Arc<dyn MachineTracker>>,
    lifecycle: Option<Arc<dyn MachineLifecycle>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            resync: DEFAULT_RESYNC,
            kube: None,
            tracker: None,
            lifecycle: None,
        }
    }

    /// Field manager used for status and finalizer patches
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Requeue period once converged
    pub fn resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the machine tracker (primarily for testing)
    pub fn machine_tracker(mut self, tracker: Arc<dyn MachineTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// Override the machine lifecycle (primarily for testing)
    pub fn machine_lifecycle(mut self, lifecycle: Arc<dyn MachineLifecycle>) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self.kube.unwrap_or_else(|| {
                Arc::new(KubeClientImpl::new(self.client.clone(), &self.field_manager))
            }),
            tracker: self
                .tracker
                .unwrap_or_else(|| Arc::new(KubeMachineTracker::new(self.client.clone()))),
            lifecycle: self
                .lifecycle
                .unwrap_or_else(|| Arc::new(KubeMachineLifecycle::new(self.client.clone()))),
            backoff: BackoffTracker::default(),
            resync: self.resync,
        }
    }
}

/// Cluster a ControlPlane belongs to, from its label or its owning Cluster
pub fn cluster_name(control_plane: &ControlPlane) -> Option<String> {
    if let Some(name) = control_plane.labels().get(CLUSTER_NAME_LABEL) {
        return Some(name.clone());
    }
    control_plane
        .owner_references()
        .iter()
        .find(|r| r.kind == "Cluster" && r.api_version.starts_with("cluster.x-k8s.io/"))
        .map(|r| r.name.clone())
}

fn has_finalizer(control_plane: &ControlPlane) -> bool {
    control_plane.finalizers().iter().any(|f| f == FINALIZER)
}

/// Outcome of one converging pass
#[derive(Clone, Debug, PartialEq)]
struct Step {
    converged: bool,
    reason: &'static str,
    message: String,
}

impl Step {
    fn condition(&self) -> Condition {
        let status = if self.converged {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        };
        Condition::new(CONDITION_READY, status, self.reason, self.message.clone())
    }
}

/// Reconcile a ControlPlane
#[instrument(skip(control_plane, ctx), fields(control_plane = %control_plane.name_any()))]
pub async fn reconcile(control_plane: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();
    let key = object_key(&namespace, &name);

    if control_plane.metadata.deletion_timestamp.is_some() {
        let action = teardown(&control_plane, &ctx).await?;
        ctx.backoff.reset(&key);
        return Ok(action);
    }

    if !has_finalizer(&control_plane) {
        info!("adding finalizer");
        ctx.kube.add_finalizer(&namespace, &name, FINALIZER).await?;
        // The status write below is guarded on the version we just moved
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let mut status = control_plane.status.clone().unwrap_or_default();
    status.observed_generation = control_plane.metadata.generation;

    match converge(&control_plane, &ctx, &mut status).await {
        Ok(step) => {
            set_condition(&mut status.conditions, step.condition());
            ctx.kube.patch_status(&control_plane, &status).await?;
            ctx.backoff.reset(&key);
            if step.converged {
                debug!(replicas = status.replicas, "control plane converged");
                Ok(Action::requeue(ctx.resync))
            } else {
                Ok(Action::requeue(PROGRESS_REQUEUE))
            }
        }
        Err(e) => {
            // Conflicts re-run immediately; the next pass reports its own outcome
            if !e.is_conflict() {
                set_condition(&mut status.conditions, Condition::from_error(CONDITION_READY, &e));
                if let Err(write) = ctx.kube.patch_status(&control_plane, &status).await {
                    warn!(error = %write, "failed to record control plane failure on status");
                }
            }
            Err(e)
        }
    }
}

/// Observe, recompute status, and take at most one step
async fn converge(
    control_plane: &ControlPlane,
    ctx: &Context,
    status: &mut ControlPlaneStatus,
) -> Result<Step, Error> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();
    let spec = &control_plane.spec;
    spec.validate(&name)?;

    let cluster = cluster_name(control_plane).ok_or_else(|| {
        Error::not_ready(&name, "control plane is not linked to a Cluster yet")
    })?;
    let selector = machine_selector(&cluster, &name);
    let machines = ctx.tracker.list(&namespace, &selector).await?;

    let conditions = std::mem::take(&mut status.conditions);
    *status = observed_status(&machines, &spec.version, &selector, control_plane.metadata.generation);
    status.conditions = conditions;

    let action = plan(&name, spec.desired(), &spec.version, &machines)?;
    let rolling = machines.iter().any(|m| !m.is_up_to_date(&spec.version));
    execute(control_plane, ctx, &cluster, &action).await?;
    Ok(describe(&action, rolling, status, spec.replicas, &machines))
}

async fn execute(
    control_plane: &ControlPlane,
    ctx: &Context,
    cluster: &str,
    action: &ScalingAction,
) -> Result<(), Error> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let version = control_plane.spec.version.as_str();
    match action {
        ScalingAction::Create(count) => {
            info!(count, version = %version, "creating control-plane machines");
            let created = try_join_all(
                (0..*count).map(|_| ctx.lifecycle.create(control_plane, cluster, version)),
            )
            .await?;
            debug!(machines = ?created, "machines created");
        }
        ScalingAction::Delete(machine) => {
            info!(machine = %machine, "removing control-plane machine");
            ctx.lifecycle.delete(&namespace, machine).await?;
        }
        ScalingAction::Converged
        | ScalingAction::WaitForDeletion(_)
        | ScalingAction::WaitForHealthy(_) => {}
    }
    Ok(())
}

fn describe(
    action: &ScalingAction,
    rolling: bool,
    status: &ControlPlaneStatus,
    desired: i32,
    machines: &[ObservedMachine],
) -> Step {
    let step = |reason: &'static str, message: String| Step {
        converged: false,
        reason,
        message,
    };
    match action {
        ScalingAction::Converged if status.is_converged(desired) => Step {
            converged: true,
            reason: "Converged",
            message: format!("{} of {} machines ready and up to date", status.ready_replicas, desired),
        },
        ScalingAction::Converged => {
            let unhealthy: Vec<&str> = machines
                .iter()
                .filter(|m| !m.is_healthy())
                .map(|m| m.name.as_str())
                .collect();
            step(
                "WaitingForHealthyMachines",
                format!("waiting for machines to become healthy: {}", unhealthy.join(", ")),
            )
        }
        ScalingAction::Create(count) if rolling => step(
            "RollingUpdate",
            format!("creating {} replacement machine(s)", count),
        ),
        ScalingAction::Create(count) => {
            step("ScalingUp", format!("creating {} machine(s)", count))
        }
        ScalingAction::Delete(machine) if rolling => step(
            "RollingUpdate",
            format!("removing outdated machine {}", machine),
        ),
        ScalingAction::Delete(machine) => {
            step("ScalingDown", format!("removing machine {}", machine))
        }
        ScalingAction::WaitForDeletion(machine) => step(
            "WaitingForDeletion",
            format!("waiting for machine {} to be deleted", machine),
        ),
        ScalingAction::WaitForHealthy(names) => step(
            "WaitingForHealthyMachines",
            format!("waiting for machines to become healthy: {}", names.join(", ")),
        ),
    }
}

/// Delete every machine, then release the finalizer
///
/// Quorum does not apply: the whole control plane is going away.
async fn teardown(control_plane: &ControlPlane, ctx: &Context) -> Result<Action, Error> {
    if !has_finalizer(control_plane) {
        return Ok(Action::await_change());
    }
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = control_plane.name_any();

    let machines = match cluster_name(control_plane) {
        Some(cluster) => {
            ctx.tracker
                .list(&namespace, &machine_selector(&cluster, &name))
                .await?
        }
        // Never linked to a Cluster, so no machine was ever created
        None => Vec::new(),
    };

    if machines.is_empty() {
        info!("all machines gone, removing finalizer");
        ctx.kube.remove_finalizer(&namespace, &name, FINALIZER).await?;
        return Ok(Action::await_change());
    }

    for machine in machines.iter().filter(|m| !m.deleting) {
        info!(machine = %machine.name, "deleting machine for control plane teardown");
        ctx.lifecycle.delete(&namespace, &machine.name).await?;
    }
    Ok(Action::requeue(PROGRESS_REQUEUE))
}

/// Error policy for the ControlPlane controller
pub fn error_policy(control_plane: Arc<ControlPlane>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(
        &control_plane.namespace().unwrap_or_default(),
        &control_plane.name_any(),
    );
    error!(
        reason = error.reason(),
        control_plane = %key,
        error = %error,
        "reconciliation failed"
    );
    ctx.backoff.action_for(&key, error)
}
