//! Host release controller.
//!
//! Returns a `BareMetalHost` to the pool when the `Machine` named in its
//! `consumerRef` no longer exists, e.g. after a machine was force-deleted
//! without its finalizer running.

use std::sync::Arc;

use crds::{BareMetalHost, Machine, gvk_of};
use futures::StreamExt;
use kube::api::Patch;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::actuator::{FIELD_MANAGER, merge_params};
use crate::error::{ReconcileError, RegistrationError};
use crate::machine_controller::{record_result, scoped_api};
use crate::manager::{ControllerManager, Manager};

/// Name the controller is registered under
pub const CONTROLLER_NAME: &str = "host-release";

/// Auxiliary controllers attached after the machine controller.
pub const AUXILIARY_CONTROLLERS: [fn(&mut ControllerManager) -> Result<(), RegistrationError>; 1] =
    [add_to_manager];

/// Attach the host release controller.
pub fn add_to_manager(manager: &mut ControllerManager) -> Result<(), RegistrationError> {
    let kinds = [gvk_of::<BareMetalHost>(), gvk_of::<Machine>()];
    manager.require_kinds(CONTROLLER_NAME, &kinds)?;

    let client = manager.client();
    let namespace = manager.watch_namespace();
    let run = Controller::new(
        scoped_api::<BareMetalHost>(client.clone(), namespace),
        WatcherConfig::default(),
    )
    .watches(
        scoped_api::<Machine>(client.clone(), namespace),
        WatcherConfig::default(),
        host_for_machine,
    )
    .graceful_shutdown_on(manager.stopping())
    .run(reconcile, error_policy, Arc::new(client))
    .for_each(record_result(CONTROLLER_NAME, manager.metrics().clone()));

    manager.add_runnable(
        CONTROLLER_NAME,
        &kinds,
        Box::pin(async move {
            run.await;
            Ok(())
        }),
    )
}

/// Host recorded in a machine's annotation
pub fn host_for_machine(machine: Machine) -> Option<ObjectRef<BareMetalHost>> {
    let (namespace, name) = machine.host_key()?;
    Some(ObjectRef::new(name).within(namespace))
}

async fn reconcile(host: Arc<BareMetalHost>, client: Arc<Client>) -> Result<Action, ReconcileError> {
    let Some(consumer) = host.spec.consumer_ref.as_ref().filter(|c| c.is_machine()) else {
        return Ok(Action::await_change());
    };
    let host_namespace = host.namespace().unwrap_or_default();
    let machine_namespace = consumer.namespace.as_deref().unwrap_or(&host_namespace);

    let machines: Api<Machine> = Api::namespaced((*client).clone(), machine_namespace);
    if machines.get_opt(&consumer.name).await?.is_some() {
        return Ok(Action::await_change());
    }

    let patch = json!({
        "spec": { "consumerRef": null, "image": null, "userData": null, "online": false }
    });
    let hosts: Api<BareMetalHost> = Api::namespaced((*client).clone(), &host_namespace);
    hosts
        .patch(
            &host.name_any(),
            &merge_params(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;

    info!(
        host = %host.name_any(),
        machine = %consumer.name,
        "Released host whose machine no longer exists"
    );
    Ok(Action::await_change())
}

fn error_policy(host: Arc<BareMetalHost>, error: &ReconcileError, _client: Arc<Client>) -> Action {
    warn!(host = %host.name_any(), %error, "Host release reconciliation failed");
    Action::requeue(std::time::Duration::from_secs(60))
}
