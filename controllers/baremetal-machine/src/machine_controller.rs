//! Machine controller registration.
//!
//! Registration is a base step (a `Controller<Machine>` driving the
//! actuator) followed by an ordered list of augmentation steps. Each step
//! can add relationships the generic machine controller knows nothing
//! about, such as the extra watch on `BareMetalHost`.

use std::sync::Arc;
use std::time::Duration;

use crds::{BareMetalHost, Machine, gvk_of};
use futures::StreamExt;
use kube::core::GroupVersionKind;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::actuator::Actuator;
use crate::error::{ReconcileError, RegistrationError};
use crate::manager::{ControllerManager, Manager};
use crate::metrics::Metrics;

/// Name the machine controller is registered under
pub const CONTROLLER_NAME: &str = "machine";

/// Finalizer holding a machine until its host is released
pub const MACHINE_FINALIZER: &str = "machine.machine.openshift.io";

/// Requeue delay after a failed reconcile
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Api scoped to the watch namespace, or cluster-wide
pub fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = (), Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// One step layered onto the base machine controller.
pub trait Augmentation: Send + Sync {
    /// Name shown in the registration audit trail
    fn name(&self) -> String;

    /// Kinds the step reads or writes
    fn kinds(&self) -> Vec<GroupVersionKind>;

    fn apply(
        &self,
        controller: Controller<Machine>,
        client: &Client,
        namespace: Option<&str>,
    ) -> Controller<Machine>;
}

/// Re-reconcile a machine whenever the host it consumes changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostWatch;

impl Augmentation for HostWatch {
    fn name(&self) -> String {
        "watch:BareMetalHost".to_string()
    }

    fn kinds(&self) -> Vec<GroupVersionKind> {
        vec![gvk_of::<BareMetalHost>()]
    }

    fn apply(
        &self,
        controller: Controller<Machine>,
        client: &Client,
        namespace: Option<&str>,
    ) -> Controller<Machine> {
        controller.watches(
            scoped_api::<BareMetalHost>(client.clone(), namespace),
            WatcherConfig::default(),
            machine_for_host,
        )
    }
}

/// Machine referenced by a host's `consumerRef`
pub fn machine_for_host(host: BareMetalHost) -> Option<ObjectRef<Machine>> {
    let consumer = host.spec.consumer_ref.as_ref()?;
    if !consumer.is_machine() {
        return None;
    }
    let namespace = consumer
        .namespace
        .clone()
        .or_else(|| host.namespace())?;
    Some(ObjectRef::new(&consumer.name).within(&namespace))
}

/// Base machine controller plus its augmentation steps.
pub struct MachineControllerRegistration {
    actuator: Arc<dyn Actuator>,
    augmentations: Vec<Box<dyn Augmentation>>,
}

impl MachineControllerRegistration {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self {
            actuator,
            augmentations: Vec::new(),
        }
    }

    /// Append a step; steps apply in the order they were added.
    #[must_use]
    pub fn augment(mut self, step: impl Augmentation + 'static) -> Self {
        self.augmentations.push(Box::new(step));
        self
    }

    /// Audit trail: base registration first, then each step in order
    pub fn steps(&self) -> Vec<String> {
        std::iter::once(CONTROLLER_NAME.to_string())
            .chain(self.augmentations.iter().map(|step| step.name()))
            .collect()
    }

    /// Every kind the controller and its steps touch
    pub fn kinds(&self) -> Vec<GroupVersionKind> {
        let mut kinds = vec![gvk_of::<Machine>()];
        for step in &self.augmentations {
            for kind in step.kinds() {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
        }
        kinds
    }

    /// Build the controller and attach it to the manager.
    pub fn register(self, manager: &mut ControllerManager) -> Result<(), RegistrationError> {
        let kinds = self.kinds();
        let steps = self.steps();
        // fail before any watch is built
        manager.require_kinds(CONTROLLER_NAME, &kinds)?;

        let client = manager.client();
        let namespace = manager.watch_namespace().map(str::to_string);

        let mut controller = Controller::new(
            scoped_api::<Machine>(client.clone(), namespace.as_deref()),
            WatcherConfig::default(),
        );
        for step in &self.augmentations {
            info!(controller = CONTROLLER_NAME, step = %step.name(), "Applying controller augmentation");
            controller = step.apply(controller, &client, namespace.as_deref());
        }

        let context = Arc::new(MachineContext {
            client,
            actuator: self.actuator,
        });
        let metrics = manager.metrics().clone();
        let run = controller
            .graceful_shutdown_on(manager.stopping())
            .run(reconcile, error_policy, context)
            .for_each(record_result(CONTROLLER_NAME, metrics));

        manager.add_runnable(
            CONTROLLER_NAME,
            &kinds,
            Box::pin(async move {
                run.await;
                Ok(())
            }),
        )?;
        info!(controller = CONTROLLER_NAME, steps = ?steps, "Machine controller registered");
        Ok(())
    }
}

/// Count and log each reconcile outcome
pub fn record_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller: &'static str,
    metrics: Metrics,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => {
                metrics.record_reconcile(controller, true);
                debug!(?action, "{} reconciliation completed", controller);
            }
            Err(e) => {
                metrics.record_reconcile(controller, false);
                warn!(error = ?e, "{} reconciliation error", controller);
            }
        }
        std::future::ready(())
    }
}

struct MachineContext {
    client: Client,
    actuator: Arc<dyn Actuator>,
}

async fn reconcile(machine: Arc<Machine>, ctx: Arc<MachineContext>) -> Result<Action, ReconcileError> {
    let namespace = machine.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Machine> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, MACHINE_FINALIZER, machine, |event| async {
        match event {
            FinalizerEvent::Apply(machine) => {
                if ctx.actuator.exists(&machine).await? {
                    ctx.actuator.update(&machine).await?;
                } else {
                    info!(machine = %machine.name_any(), "Creating machine");
                    ctx.actuator.create(&machine).await?;
                }
                Ok::<_, ReconcileError>(Action::await_change())
            }
            FinalizerEvent::Cleanup(machine) => {
                info!(machine = %machine.name_any(), "Deleting machine");
                ctx.actuator.delete(&machine).await?;
                Ok::<_, ReconcileError>(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| ReconcileError::Finalizer(e.to_string()))
}

fn error_policy(machine: Arc<Machine>, error: &ReconcileError, _ctx: Arc<MachineContext>) -> Action {
    warn!(machine = %machine.name_any(), %error, "Machine reconciliation failed");
    Action::requeue(ERROR_REQUEUE)
}
