//! NodeConfig controller
//!
//! A NodeConfig has two states. `Pending` has no `status.dataSecretName`;
//! each pass resolves, compiles, stores the payload in an immutable Secret and
//! tries to freeze. `Frozen` has `dataSecretName` set and is terminal: no
//! pass compiles, writes Secrets, or touches the field again, even if the
//! spec is edited afterward.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use trellis_common::backoff::BackoffTracker;
use trellis_common::crd::{
    set_condition, Condition, ConditionStatus, NodeConfig, NodeConfigStatus,
    CONDITION_DATA_AVAILABLE, CONDITION_READY,
};
use trellis_common::kube_utils::object_key;
use trellis_common::redact::Redactor;
use trellis_common::{Error, DEFAULT_FIELD_MANAGER};

use crate::client::{owner_machine_name, ClusterInfo, KubeClient, KubeClientImpl, OwnerMachine};
use crate::compiler::{compile, join_url, CompileInput, NodeRole};
use crate::registry::compile_registries;
use crate::resolver::{resolve_node_config, KubeReferenceStore, ReferenceStore, Resolver};

/// Requeue delay while the owning Machine has not been linked yet
pub const OWNER_WAIT: Duration = Duration::from_secs(10);

/// Shared state for the NodeConfig controller
pub struct Context {
    /// Kubernetes operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Secret and ConfigMap reads
    pub store: Arc<dyn ReferenceStore>,
    /// Consecutive failure counts per NodeConfig
    pub backoff: BackoffTracker,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn KubeClient>, store: Arc<dyn ReferenceStore>) -> Self {
        Self {
            kube,
            store,
            backoff: BackoffTracker::default(),
        }
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    client: Client,
    field_manager: String,
    kube: Option<Arc<dyn KubeClient>>,
    store: Option<Arc<dyn ReferenceStore>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            kube: None,
            store: None,
        }
    }

    /// Field manager used for status patches
    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the reference store (primarily for testing)
    pub fn reference_store(mut self, store: Arc<dyn ReferenceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        Context {
            kube: self.kube.unwrap_or_else(|| {
                Arc::new(KubeClientImpl::new(self.client.clone(), &self.field_manager))
            }),
            store: self
                .store
                .unwrap_or_else(|| Arc::new(KubeReferenceStore::new(self.client.clone()))),
            backoff: BackoffTracker::default(),
        }
    }
}

/// What a Pending NodeConfig should do next, given its owner and cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BootstrapPlan {
    /// Cluster infrastructure or endpoint is not there yet
    WaitForInfrastructure(String),
    /// Control-plane machine on an uninitialized cluster: race for the init lock
    ContendForInit,
    /// Cluster is initialized; join through this supervisor URL
    Join(String),
    /// Worker or lock loser on an uninitialized cluster
    WaitForControlPlane,
}

/// Decide how a Pending NodeConfig proceeds
pub fn plan_bootstrap(machine: &OwnerMachine, cluster: Option<&ClusterInfo>) -> BootstrapPlan {
    let Some(cluster) = cluster else {
        return BootstrapPlan::WaitForInfrastructure(format!(
            "cluster {} not found",
            machine.cluster_name
        ));
    };
    if !cluster.infrastructure_ready {
        return BootstrapPlan::WaitForInfrastructure(format!(
            "cluster {} infrastructure is not ready",
            machine.cluster_name
        ));
    }
    if cluster.control_plane_initialized {
        return match &cluster.endpoint {
            Some(host) => BootstrapPlan::Join(join_url(host)),
            None => BootstrapPlan::WaitForInfrastructure(format!(
                "cluster {} has no control plane endpoint",
                machine.cluster_name
            )),
        };
    }
    if machine.is_control_plane {
        BootstrapPlan::ContendForInit
    } else {
        BootstrapPlan::WaitForControlPlane
    }
}

/// Reconcile a NodeConfig
#[instrument(skip(config, ctx), fields(node_config = %config.name_any()))]
pub async fn reconcile(config: Arc<NodeConfig>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();
    let key = object_key(&namespace, &name);

    if let Some(secret) = config.data_secret_name() {
        debug!(secret = %secret, "bootstrap data frozen");
        ctx.backoff.reset(&key);
        return Ok(Action::await_change());
    }

    let mut redactor = Redactor::new();
    match converge(&config, &ctx, &mut redactor).await {
        Ok(action) => {
            ctx.backoff.reset(&key);
            Ok(action)
        }
        Err(e) => {
            report_failure(&config, &ctx, &e, &redactor).await;
            Err(e)
        }
    }
}

async fn converge(
    config: &NodeConfig,
    ctx: &Context,
    redactor: &mut Redactor,
) -> Result<Action, Error> {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();

    let Some(machine_name) = owner_machine_name(config) else {
        debug!("waiting for an owning Machine");
        return Ok(Action::requeue(OWNER_WAIT));
    };
    let Some(machine) = ctx.kube.get_machine(&namespace, &machine_name).await? else {
        debug!(machine = %machine_name, "owning Machine not found yet");
        return Ok(Action::requeue(OWNER_WAIT));
    };

    let cluster = ctx.kube.get_cluster(&namespace, &machine.cluster_name).await?;
    let server = match plan_bootstrap(&machine, cluster.as_ref()) {
        BootstrapPlan::WaitForInfrastructure(message) => {
            return Err(Error::not_ready(&name, message))
        }
        BootstrapPlan::WaitForControlPlane => {
            return Err(Error::not_ready(
                &name,
                format!("waiting for cluster {} control plane to initialize", machine.cluster_name),
            ))
        }
        BootstrapPlan::ContendForInit => {
            let held = ctx
                .kube
                .acquire_init_lock(&namespace, &machine.cluster_name, &machine.name)
                .await?;
            if !held {
                return Err(Error::not_ready(
                    &name,
                    format!("another machine is initializing cluster {}", machine.cluster_name),
                ));
            }
            info!(machine = %machine.name, "initializing cluster");
            None
        }
        BootstrapPlan::Join(url) => Some(url),
    };

    let token = ctx
        .kube
        .ensure_cluster_token(&namespace, &machine.cluster_name)
        .await?;
    redactor.add(&token);

    let resolver = Resolver::new(ctx.store.as_ref());
    let resolved = resolve_node_config(&name, &namespace, &config.spec, &resolver, redactor).await?;
    let registry = compile_registries(
        &name,
        &config.spec.private_registries_config,
        &resolved.registry_auth,
        &resolved.registry_tls,
    )?;

    let role = if machine.is_control_plane {
        NodeRole::Server
    } else {
        NodeRole::Agent
    };
    let payload = compile(
        &CompileInput {
            resource: &name,
            spec: &config.spec,
            role,
            version: machine.version.as_deref(),
            token: &token,
            server: server.as_deref(),
        },
        &resolved,
        &registry,
    )?;
    debug!(digest = %payload.digest, bytes = payload.data.len(), %role, "compiled bootstrap data");

    let secret_name = ctx
        .kube
        .ensure_data_secret(config, &machine.cluster_name, &payload)
        .await?;

    match ctx.kube.freeze_status(config, &frozen_status(config, &secret_name)).await {
        Ok(()) => {
            info!(secret = %secret_name, digest = %payload.digest, "bootstrap data frozen");
            Ok(Action::await_change())
        }
        Err(e) if e.is_conflict() => {
            // Lost the race; whoever won may already have frozen it
            match ctx.kube.get_node_config(&namespace, &name).await? {
                Some(latest) if latest.data_secret_name().is_some() => {
                    info!(
                        secret = ?latest.data_secret_name(),
                        "bootstrap data frozen by a concurrent pass"
                    );
                    Ok(Action::await_change())
                }
                _ => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

fn frozen_status(config: &NodeConfig, secret_name: &str) -> NodeConfigStatus {
    let mut status = config.status.clone().unwrap_or_default();
    status.data_secret_name = Some(secret_name.to_string());
    status.ready = true;
    status.observed_generation = config.metadata.generation;
    set_condition(
        &mut status.conditions,
        Condition::new(
            CONDITION_DATA_AVAILABLE,
            ConditionStatus::True,
            "DataSecretCreated",
            format!("bootstrap data stored in secret {}", secret_name),
        ),
    );
    set_condition(
        &mut status.conditions,
        Condition::new(CONDITION_READY, ConditionStatus::True, "Ready", "bootstrap data available"),
    );
    status
}

fn failed_status(config: &NodeConfig, error: &Error, redactor: &Redactor) -> NodeConfigStatus {
    let mut status = config.status.clone().unwrap_or_default();
    status.ready = false;
    status.observed_generation = config.metadata.generation;
    let message = redactor.redact(&error.to_string());
    for type_ in [CONDITION_DATA_AVAILABLE, CONDITION_READY] {
        set_condition(
            &mut status.conditions,
            Condition::new(type_, ConditionStatus::False, error.reason(), message.clone()),
        );
    }
    status
}

async fn report_failure(config: &NodeConfig, ctx: &Context, error: &Error, redactor: &Redactor) {
    // Conflicts re-run immediately; the next pass reports its own outcome
    if error.is_conflict() {
        return;
    }
    let status = failed_status(config, error, redactor);
    match ctx.kube.patch_status(config, &status).await {
        Ok(()) => {}
        // Moved since this pass read it, possibly frozen by a concurrent pass
        Err(e) if e.is_conflict() => {
            debug!("NodeConfig changed since it was read, not recording failure");
        }
        Err(e) => warn!(error = %e, "failed to record bootstrap failure on status"),
    }
}

/// Error policy for the NodeConfig controller
pub fn error_policy(config: Arc<NodeConfig>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&config.namespace().unwrap_or_default(), &config.name_any());
    error!(
        reason = error.reason(),
        node_config = %key,
        "reconciliation failed"
    );
    ctx.backoff.action_for(&key, error)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;
    use std::sync::{Arc as StdArc, Mutex};

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use trellis_common::crd::{find_condition, File, FileSource, NodeConfigSpec, SecretFileSource};

    use crate::client::MockKubeClient;
    use crate::resolver::{MockReferenceStore, SourceKind};

    fn machine(control_plane: bool) -> OwnerMachine {
        OwnerMachine {
            name: "m-0".to_string(),
            cluster_name: "prod".to_string(),
            version: Some("v1.31.2+rke2r1".to_string()),
            is_control_plane: control_plane,
        }
    }

    fn ready_cluster(initialized: bool) -> ClusterInfo {
        ClusterInfo {
            infrastructure_ready: true,
            control_plane_initialized: initialized,
            endpoint: Some("10.0.0.10".to_string()),
        }
    }

    fn node_config(spec: NodeConfigSpec) -> NodeConfig {
        let mut config = NodeConfig::new("m-0", spec);
        config.metadata.namespace = Some("default".to_string());
        config.metadata.resource_version = Some("41".to_string());
        config.metadata.generation = Some(1);
        config.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "cluster.x-k8s.io/v1beta1".to_string(),
            kind: "Machine".to_string(),
            name: "m-0".to_string(),
            uid: "uid-m-0".to_string(),
            ..Default::default()
        }]);
        config
    }

    fn frozen_config() -> NodeConfig {
        let mut config = node_config(NodeConfigSpec::default());
        config.status = Some(NodeConfigStatus {
            data_secret_name: Some("m-0".to_string()),
            ready: true,
            ..Default::default()
        });
        config
    }

    fn empty_store() -> Arc<MockReferenceStore> {
        Arc::new(MockReferenceStore::new())
    }

    mod planning {
        use super::*;

        #[test]
        fn missing_cluster_waits_for_infrastructure() {
            assert!(matches!(
                plan_bootstrap(&machine(true), None),
                BootstrapPlan::WaitForInfrastructure(_)
            ));
        }

        #[test]
        fn infrastructure_not_ready_waits() {
            let cluster = ClusterInfo {
                infrastructure_ready: false,
                ..ready_cluster(false)
            };
            assert!(matches!(
                plan_bootstrap(&machine(false), Some(&cluster)),
                BootstrapPlan::WaitForInfrastructure(_)
            ));
        }

        #[test]
        fn first_control_plane_machine_contends_for_init() {
            assert_eq!(
                plan_bootstrap(&machine(true), Some(&ready_cluster(false))),
                BootstrapPlan::ContendForInit
            );
        }

        #[test]
        fn worker_waits_for_control_plane() {
            assert_eq!(
                plan_bootstrap(&machine(false), Some(&ready_cluster(false))),
                BootstrapPlan::WaitForControlPlane
            );
        }

        #[test]
        fn initialized_cluster_is_joined_through_supervisor_port() {
            assert_eq!(
                plan_bootstrap(&machine(false), Some(&ready_cluster(true))),
                BootstrapPlan::Join("https://10.0.0.10:9345".to_string())
            );
        }

        #[test]
        fn initialized_cluster_without_endpoint_waits() {
            let cluster = ClusterInfo {
                endpoint: None,
                ..ready_cluster(true)
            };
            assert!(matches!(
                plan_bootstrap(&machine(true), Some(&cluster)),
                BootstrapPlan::WaitForInfrastructure(_)
            ));
        }
    }

    mod bootstrap_flow {
        use super::*;

        /// Captured status writes, split by kind of write
        #[derive(Clone, Default)]
        struct StatusCapture {
            frozen: StdArc<Mutex<Vec<NodeConfigStatus>>>,
            patched: StdArc<Mutex<Vec<NodeConfigStatus>>>,
        }

        impl StatusCapture {
            fn frozen(&self) -> Vec<NodeConfigStatus> {
                self.frozen.lock().expect("mutex should not be poisoned").clone()
            }

            fn last_patched(&self) -> Option<NodeConfigStatus> {
                self.patched
                    .lock()
                    .expect("mutex should not be poisoned")
                    .last()
                    .cloned()
            }
        }

        /// A client where the owner machine and cluster exist and no status is written
        fn happy_kube_without_status(control_plane: bool, initialized: bool) -> MockKubeClient {
            let mut kube = MockKubeClient::new();
            kube.expect_get_machine()
                .returning(move |_, _| Ok(Some(machine(control_plane))));
            kube.expect_get_cluster()
                .returning(move |_, _| Ok(Some(ready_cluster(initialized))));
            kube.expect_acquire_init_lock().returning(|_, _, _| Ok(true));
            kube.expect_ensure_cluster_token()
                .returning(|_, _| Ok("join-token-0123456789".to_string()));
            kube.expect_ensure_data_secret()
                .returning(|config, _, _| Ok(config.name_any()));
            kube
        }

        /// A client where the owner machine and cluster exist and every write succeeds
        fn happy_kube(control_plane: bool, initialized: bool, capture: &StatusCapture) -> MockKubeClient {
            let mut kube = happy_kube_without_status(control_plane, initialized);
            let frozen = capture.frozen.clone();
            kube.expect_freeze_status().returning(move |_, status| {
                frozen.lock().expect("mutex should not be poisoned").push(status.clone());
                Ok(())
            });
            let patched = capture.patched.clone();
            kube.expect_patch_status().returning(move |_, status| {
                patched.lock().expect("mutex should not be poisoned").push(status.clone());
                Ok(())
            });
            kube
        }

        /// Story: the first control-plane machine of a fresh cluster gets
        /// its payload compiled, stored, and frozen in one pass.
        #[tokio::test]
        async fn story_pending_config_is_compiled_and_frozen() {
            let capture = StatusCapture::default();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(happy_kube(true, false, &capture)),
                empty_store(),
            ));

            let action = reconcile(Arc::new(node_config(NodeConfigSpec::default())), ctx)
                .await
                .expect("reconcile should succeed");

            assert_eq!(action, Action::await_change());
            let frozen = capture.frozen();
            assert_eq!(frozen.len(), 1);
            assert_eq!(frozen[0].data_secret_name.as_deref(), Some("m-0"));
            assert!(frozen[0].ready);
            assert!(find_condition(&frozen[0].conditions, CONDITION_DATA_AVAILABLE)
                .is_some_and(|c| c.is_true()));
        }

        /// Story: once frozen, nothing is compiled or written again, no
        /// matter what the spec says now.
        #[tokio::test]
        async fn story_frozen_config_is_never_recompiled() {
            // No expectations: any call on these mocks fails the test
            let ctx = Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                empty_store(),
            ));
            let mut config = frozen_config();
            config.spec.pre_commands = vec!["echo edited".to_string()];

            let action = reconcile(Arc::new(config), ctx)
                .await
                .expect("frozen configs are a no-op");
            assert_eq!(action, Action::await_change());
        }

        /// Story: a NodeConfig whose Machine has not been linked yet waits
        /// quietly instead of failing.
        #[tokio::test]
        async fn story_unowned_config_waits_for_machine() {
            let ctx = Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                empty_store(),
            ));
            let mut config = node_config(NodeConfigSpec::default());
            config.metadata.owner_references = None;

            let action = reconcile(Arc::new(config), ctx).await.expect("waits");
            assert_eq!(action, Action::requeue(OWNER_WAIT));
        }

        /// Story: a worker on a cluster whose control plane is still coming
        /// up reports InfrastructureNotReady and retries later.
        #[tokio::test]
        async fn story_worker_waits_for_initialized_control_plane() {
            let capture = StatusCapture::default();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(happy_kube(false, false, &capture)),
                empty_store(),
            ));

            let err = reconcile(Arc::new(node_config(NodeConfigSpec::default())), ctx)
                .await
                .expect_err("worker must wait");

            assert!(matches!(err, Error::InfrastructureNotReady { .. }));
            assert!(capture.frozen().is_empty());
            let status = capture.last_patched().expect("failure recorded");
            let condition =
                find_condition(&status.conditions, CONDITION_DATA_AVAILABLE).expect("condition");
            assert_eq!(condition.reason, "InfrastructureNotReady");
        }

        /// Story: a control-plane machine that loses the init lock waits
        /// for the winner to initialize the cluster.
        #[tokio::test]
        async fn story_init_lock_loser_waits() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_machine().returning(|_, _| Ok(Some(machine(true))));
            kube.expect_get_cluster()
                .returning(|_, _| Ok(Some(ready_cluster(false))));
            kube.expect_acquire_init_lock().returning(|_, _, _| Ok(false));
            kube.expect_patch_status().returning(|_, _| Ok(()));
            let ctx = Arc::new(Context::for_testing(Arc::new(kube), empty_store()));

            let err = reconcile(Arc::new(node_config(NodeConfigSpec::default())), ctx)
                .await
                .expect_err("must wait");
            assert!(err.to_string().contains("another machine"));
        }

        /// Story: a missing referenced secret surfaces as ResolutionFailed,
        /// and the secret material that was resolved never reaches the
        /// condition message.
        #[tokio::test]
        async fn story_missing_reference_is_reported_without_secret_material() {
            let capture = StatusCapture::default();
            let kube = happy_kube(true, true, &capture);
            let mut store = MockReferenceStore::new();
            store.expect_get_data().returning(|kind, _, name| {
                if kind == SourceKind::Secret && name == "present" {
                    Ok(Some(BTreeMap::from([(
                        "k".to_string(),
                        b"super-secret-value".to_vec(),
                    )])))
                } else {
                    Ok(None)
                }
            });
            let ctx = Arc::new(Context::for_testing(Arc::new(kube), Arc::new(store)));

            let file = |path: &str, secret: &str| File {
                path: path.to_string(),
                content_from: Some(FileSource {
                    secret: SecretFileSource {
                        name: secret.to_string(),
                        key: "k".to_string(),
                    },
                }),
                ..Default::default()
            };
            let spec = NodeConfigSpec {
                files: vec![file("/etc/a", "present"), file("/etc/b", "absent")],
                ..Default::default()
            };

            let err = reconcile(Arc::new(node_config(spec)), ctx)
                .await
                .expect_err("absent secret");

            assert!(matches!(err, Error::Resolution { .. }));
            let status = capture.last_patched().expect("failure recorded");
            assert!(!status.ready);
            let condition =
                find_condition(&status.conditions, CONDITION_DATA_AVAILABLE).expect("condition");
            assert_eq!(condition.reason, "ResolutionFailed");
            assert!(!condition.message.contains("super-secret-value"));
            assert!(capture.frozen().is_empty());
        }

        /// Story: a pass working from a stale Pending read fails after a
        /// concurrent pass already froze the config. Its failure write is
        /// rejected by the resourceVersion guard, so the stored status stays
        /// ready and keeps pointing at the data secret.
        #[tokio::test]
        async fn story_stale_failure_does_not_unfreeze_config() {
            let stored = StdArc::new(Mutex::new({
                let mut config = frozen_config();
                config.metadata.resource_version = Some("42".to_string());
                config
            }));

            let mut kube = MockKubeClient::new();
            kube.expect_get_machine().returning(|_, _| Ok(Some(machine(true))));
            kube.expect_get_cluster()
                .returning(|_, _| Ok(Some(ready_cluster(true))));
            kube.expect_ensure_cluster_token()
                .returning(|_, _| Ok("join-token-0123456789".to_string()));
            kube.expect_freeze_status().never();
            let server = stored.clone();
            kube.expect_patch_status().returning(move |config, status| {
                let mut current = server.lock().expect("mutex should not be poisoned");
                if config.resource_version() != current.resource_version() {
                    return Err(Error::conflict("default/m-0", "object has been modified"));
                }
                current.status = Some(status.clone());
                Ok(())
            });
            let mut store = MockReferenceStore::new();
            store.expect_get_data().returning(|_, _, _| Ok(None));
            let ctx = Arc::new(Context::for_testing(Arc::new(kube), Arc::new(store)));

            let spec = NodeConfigSpec {
                files: vec![File {
                    path: "/etc/a".to_string(),
                    content_from: Some(FileSource {
                        secret: SecretFileSource {
                            name: "absent".to_string(),
                            key: "k".to_string(),
                        },
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            };
            let err = reconcile(Arc::new(node_config(spec)), ctx)
                .await
                .expect_err("absent secret");

            assert!(matches!(err, Error::Resolution { .. }));
            let status = stored
                .lock()
                .expect("mutex should not be poisoned")
                .status
                .clone()
                .expect("status");
            assert!(status.ready);
            assert_eq!(status.data_secret_name.as_deref(), Some("m-0"));
        }

        #[tokio::test]
        async fn failure_write_is_made_against_the_observed_revision() {
            let mut kube = happy_kube_without_status(false, false);
            kube.expect_patch_status()
                .withf(|config, status| {
                    config.resource_version().as_deref() == Some("41") && !status.ready
                })
                .times(1)
                .returning(|_, _| Ok(()));
            let ctx = Arc::new(Context::for_testing(Arc::new(kube), empty_store()));

            reconcile(Arc::new(node_config(NodeConfigSpec::default())), ctx)
                .await
                .expect_err("worker must wait");
        }

        /// Story: two passes race to freeze; the loser re-reads, sees the
        /// winner's dataSecretName, and finishes without error.
        #[tokio::test]
        async fn story_losing_freeze_race_observes_frozen() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_machine().returning(|_, _| Ok(Some(machine(true))));
            kube.expect_get_cluster()
                .returning(|_, _| Ok(Some(ready_cluster(true))));
            kube.expect_ensure_cluster_token()
                .returning(|_, _| Ok("join-token-0123456789".to_string()));
            kube.expect_ensure_data_secret()
                .returning(|config, _, _| Ok(config.name_any()));
            kube.expect_freeze_status()
                .returning(|_, _| Err(Error::conflict("default/m-0", "object has been modified")));
            kube.expect_get_node_config()
                .returning(|_, _| Ok(Some(frozen_config())));
            let ctx = Arc::new(Context::for_testing(Arc::new(kube), empty_store()));

            let action = reconcile(Arc::new(node_config(NodeConfigSpec::default())), ctx)
                .await
                .expect("losing the race is not an error");
            assert_eq!(action, Action::await_change());
        }

        /// Story: a conflict where nobody froze the object re-runs the pass
        /// immediately and does not write a failure condition.
        #[tokio::test]
        async fn story_unexplained_conflict_retries_immediately() {
            let mut kube = MockKubeClient::new();
            kube.expect_get_machine().returning(|_, _| Ok(Some(machine(true))));
            kube.expect_get_cluster()
                .returning(|_, _| Ok(Some(ready_cluster(true))));
            kube.expect_ensure_cluster_token()
                .returning(|_, _| Ok("join-token-0123456789".to_string()));
            kube.expect_ensure_data_secret()
                .returning(|config, _, _| Ok(config.name_any()));
            kube.expect_freeze_status()
                .returning(|_, _| Err(Error::conflict("default/m-0", "object has been modified")));
            kube.expect_get_node_config()
                .returning(|_, _| Ok(Some(node_config(NodeConfigSpec::default()))));
            kube.expect_patch_status().never();
            let ctx = Arc::new(Context::for_testing(Arc::new(kube), empty_store()));
            let config = Arc::new(node_config(NodeConfigSpec::default()));

            let err = reconcile(config.clone(), ctx.clone())
                .await
                .expect_err("conflict propagates");
            assert!(err.is_conflict());
            assert_eq!(error_policy(config, &err, ctx), Action::requeue(Duration::ZERO));
        }

        /// Story: a malformed spec is reported and then waits for an edit.
        #[tokio::test]
        async fn story_malformed_spec_awaits_change() {
            let capture = StatusCapture::default();
            let ctx = Arc::new(Context::for_testing(
                Arc::new(happy_kube(true, true, &capture)),
                empty_store(),
            ));
            let spec = NodeConfigSpec {
                files: vec![File {
                    path: "/etc/none".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            };
            let config = Arc::new(node_config(spec));

            let err = reconcile(config.clone(), ctx.clone())
                .await
                .expect_err("neither content nor contentFrom");
            assert!(matches!(err, Error::Configuration { .. }));
            let status = capture.last_patched().expect("failure recorded");
            assert_eq!(
                find_condition(&status.conditions, CONDITION_READY).map(|c| c.reason.as_str()),
                Some("InvalidConfiguration")
            );
            assert_eq!(error_policy(config, &err, ctx), Action::await_change());
        }
    }

    mod error_policy_tests {
        use super::*;
        use rstest::rstest;

        fn ctx() -> Arc<Context> {
            Arc::new(Context::for_testing(
                Arc::new(MockKubeClient::new()),
                empty_store(),
            ))
        }

        #[rstest]
        #[case::resolution(Error::resolution("secret default/x key=y", "object not found"))]
        #[case::not_ready(Error::not_ready("default/m-0", "waiting"))]
        #[case::serialization(Error::serialization("duplicate path"))]
        fn transient_errors_back_off(#[case] error: Error) {
            let config = Arc::new(node_config(NodeConfigSpec::default()));
            let ctx = ctx();

            assert_eq!(
                error_policy(config.clone(), &error, ctx.clone()),
                Action::requeue(Duration::from_secs(5))
            );
            assert_eq!(
                error_policy(config, &error, ctx),
                Action::requeue(Duration::from_secs(10))
            );
        }

        #[tokio::test]
        async fn success_resets_backoff() {
            let config = Arc::new(frozen_config());
            let ctx = ctx();
            let error = Error::not_ready("default/m-0", "waiting");
            error_policy(config.clone(), &error, ctx.clone());
            assert_eq!(ctx.backoff.failures("default/m-0"), 1);

            reconcile(config, ctx.clone())
                .await
                .expect("frozen is a no-op");
            assert_eq!(ctx.backoff.failures("default/m-0"), 0);
        }
    }
}
