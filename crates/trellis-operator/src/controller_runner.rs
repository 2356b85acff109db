//! Controller runner - builds controller futures for each provider
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use trellis_bootstrap::controller as bootstrap_ctrl;
use trellis_common::crd::{ControlPlane, NodeConfig};
use trellis_common::kube_utils::machine_api_resource;
use trellis_control_plane::controller as control_plane_ctrl;

use crate::config::Settings;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn machines(client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = machine_api_resource();
    match namespace {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    }
}

/// NodeConfig a Machine bootstraps from, if it uses one of ours
pub fn node_config_for_machine(machine: &DynamicObject) -> Option<ObjectRef<NodeConfig>> {
    let config_ref = machine.data.pointer("/spec/bootstrap/configRef")?;
    if config_ref.get("kind").and_then(|k| k.as_str()) != Some(NodeConfig::kind(&()).as_ref()) {
        return None;
    }
    let name = config_ref.get("name").and_then(|n| n.as_str())?;
    let namespace = config_ref
        .get("namespace")
        .and_then(|n| n.as_str())
        .map(str::to_string)
        .or_else(|| machine.namespace())?;
    Some(ObjectRef::new(name).within(&namespace))
}

/// Build the NodeConfig controller
///
/// Machines are watched too: a NodeConfig waits for its owning Machine, so
/// the Machine linking or changing re-triggers it.
pub fn build_bootstrap_controllers(
    client: Client,
    settings: &Settings,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(
        bootstrap_ctrl::Context::builder(client.clone())
            .field_manager(&settings.field_manager)
            .build(),
    );
    let namespace = settings.watch_namespace.as_deref();
    let configs: Api<NodeConfig> = scoped(client.clone(), namespace);

    tracing::info!("- NodeConfig controller");

    vec![Box::pin(
        Controller::new(configs, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .watches_with(
                machines(client, namespace),
                machine_api_resource(),
                WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
                |machine| node_config_for_machine(&machine),
            )
            .shutdown_on_signal()
            .run(bootstrap_ctrl::reconcile, bootstrap_ctrl::error_policy, ctx)
            .for_each(log_reconcile_result("NodeConfig")),
    )]
}

/// Build the ControlPlane controller
///
/// Machines carry a controller owner reference to their ControlPlane, so
/// any Machine change re-triggers its owner.
pub fn build_control_plane_controllers(
    client: Client,
    settings: &Settings,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Arc::new(
        control_plane_ctrl::Context::builder(client.clone())
            .field_manager(&settings.field_manager)
            .resync(settings.resync())
            .build(),
    );
    let namespace = settings.watch_namespace.as_deref();
    let control_planes: Api<ControlPlane> = scoped(client.clone(), namespace);

    tracing::info!("- ControlPlane controller");

    vec![Box::pin(
        Controller::new(
            control_planes,
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .owns_with(
            machines(client, namespace),
            machine_api_resource(),
            WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
        )
        .shutdown_on_signal()
        .run(
            control_plane_ctrl::reconcile,
            control_plane_ctrl::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("ControlPlane")),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
