//! Machine actuator.
//!
//! Binds a `Machine` to a `BareMetalHost`: the host records the machine in
//! `spec.consumerRef`, the machine records the host in the
//! `metal3.io/BareMetalHost` annotation. Provisioning itself is left to the
//! bare-metal operator watching the host.

use async_trait::async_trait;
use crds::{BareMetalHost, BareMetalMachineProviderSpec, ConsumerReference, HOST_ANNOTATION, Machine};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use crate::error::ActuatorError;

/// Field manager used for every write
pub const FIELD_MANAGER: &str = "baremetal-machine-controller";

/// Reconciliation actions the machine controller drives.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Claim backing infrastructure for a new machine
    async fn create(&self, machine: &Machine) -> Result<(), ActuatorError>;

    /// Refresh an existing machine from its backing host
    async fn update(&self, machine: &Machine) -> Result<(), ActuatorError>;

    /// Whether the machine already has backing infrastructure
    async fn exists(&self, machine: &Machine) -> Result<bool, ActuatorError>;

    /// Release the machine's backing infrastructure
    async fn delete(&self, machine: &Machine) -> Result<(), ActuatorError>;
}

/// Inputs for [`BareMetalActuator::new`].
pub struct ActuatorParams {
    pub client: Client,
    pub field_manager: String,
}

impl ActuatorParams {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }
}

/// Actuator backed by Metal3 `BareMetalHost` objects.
#[derive(Clone)]
pub struct BareMetalActuator {
    client: Client,
    field_manager: String,
}

impl BareMetalActuator {
    pub fn new(params: ActuatorParams) -> Result<Self, ActuatorError> {
        if params.field_manager.trim().is_empty() {
            return Err(ActuatorError::InvalidParams(
                "field manager must not be empty".to_string(),
            ));
        }
        Ok(Self {
            client: params.client,
            field_manager: params.field_manager,
        })
    }

    fn hosts(&self, namespace: &str) -> Api<BareMetalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn patch_params(&self) -> PatchParams {
        merge_params(&self.field_manager)
    }

    /// Host recorded on the machine, if it still exists
    async fn recorded_host(&self, machine: &Machine) -> Result<Option<BareMetalHost>, ActuatorError> {
        let Some((namespace, name)) = machine.host_key() else {
            return Ok(None);
        };
        Ok(self.hosts(namespace).get_opt(name).await?)
    }

    async fn annotate_machine(&self, machine: &Machine, value: Option<String>) -> Result<(), ActuatorError> {
        let patch = json!({
            "metadata": { "annotations": { HOST_ANNOTATION: value } }
        });
        self.machines(&machine_namespace(machine))
            .patch(&machine.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Actuator for BareMetalActuator {
    async fn create(&self, machine: &Machine) -> Result<(), ActuatorError> {
        let name = machine.name_any();
        let namespace = machine_namespace(machine);
        let spec = BareMetalMachineProviderSpec::from_machine(machine).map_err(|source| {
            ActuatorError::ProviderSpec {
                machine: name.clone(),
                source,
            }
        })?;

        let hosts = self.hosts(&namespace).list(&ListParams::default()).await?;
        let host = select_host(&hosts.items, &spec, &name, &namespace)
            .ok_or_else(|| ActuatorError::NoAvailableHost(name.clone()))?;
        let host_name = host.name_any();

        if host.is_consumed_by(&name, &namespace) {
            // claimed earlier, but the machine annotation was never written
            info!(machine = %name, host = %host_name, "Adopting host already consumed by machine");
        } else {
            // resourceVersion makes the claim fail if another machine got there first
            let patch = json!({
                "metadata": { "resourceVersion": host.metadata.resource_version },
                "spec": {
                    "consumerRef": ConsumerReference::machine(&name, &namespace),
                    "image": spec.image,
                    "userData": spec.user_data,
                    "online": true,
                }
            });
            self.hosts(&namespace)
                .patch(&host_name, &self.patch_params(), &Patch::Merge(&patch))
                .await?;
        }
        self.annotate_machine(machine, Some(format!("{namespace}/{host_name}")))
            .await?;

        info!(machine = %name, host = %host_name, "Associated machine with host");
        Ok(())
    }

    async fn update(&self, machine: &Machine) -> Result<(), ActuatorError> {
        let Some(host) = self.recorded_host(machine).await? else {
            debug!(machine = %machine.name_any(), "Machine has no host to update from");
            return Ok(());
        };

        let Some(provider_id) = provider_id_for(&host) else {
            return Ok(());
        };
        if machine.spec.provider_id.as_deref() == Some(provider_id.as_str()) {
            return Ok(());
        }

        let patch = json!({ "spec": { "providerID": provider_id } });
        self.machines(&machine_namespace(machine))
            .patch(&machine.name_any(), &self.patch_params(), &Patch::Merge(&patch))
            .await?;
        info!(machine = %machine.name_any(), %provider_id, "Set machine provider ID");
        Ok(())
    }

    async fn exists(&self, machine: &Machine) -> Result<bool, ActuatorError> {
        let namespace = machine_namespace(machine);
        Ok(self
            .recorded_host(machine)
            .await?
            .is_some_and(|host| host.is_consumed_by(&machine.name_any(), &namespace)))
    }

    async fn delete(&self, machine: &Machine) -> Result<(), ActuatorError> {
        let name = machine.name_any();
        let namespace = machine_namespace(machine);

        if let Some(host) = self.recorded_host(machine).await? {
            if host.is_consumed_by(&name, &namespace) {
                let patch = json!({
                    "spec": { "consumerRef": null, "image": null, "userData": null, "online": false }
                });
                self.hosts(&host.namespace().unwrap_or_default())
                    .patch(&host.name_any(), &self.patch_params(), &Patch::Merge(&patch))
                    .await?;
                info!(machine = %name, host = %host.name_any(), "Released host");
            }
        }

        if machine.host_key().is_some() {
            self.annotate_machine(machine, None).await?;
        }
        Ok(())
    }
}

fn machine_namespace(machine: &Machine) -> String {
    machine.namespace().unwrap_or_else(|| "default".to_string())
}

/// Merge-patch parameters carrying the writer's field manager
pub fn merge_params(field_manager: &str) -> PatchParams {
    PatchParams {
        field_manager: Some(field_manager.to_string()),
        ..PatchParams::default()
    }
}

/// Host for a machine: the one it already consumes, otherwise the first
/// claimable host matching the provider spec, by name for a stable choice.
pub fn select_host<'a>(
    hosts: &'a [BareMetalHost],
    spec: &BareMetalMachineProviderSpec,
    machine_name: &str,
    machine_namespace: &str,
) -> Option<&'a BareMetalHost> {
    if let Some(held) = hosts
        .iter()
        .find(|host| host.is_consumed_by(machine_name, machine_namespace))
    {
        return Some(held);
    }

    hosts
        .iter()
        .filter(|host| host.is_available())
        .filter(|host| spec.host_selector.matches(host.metadata.labels.as_ref()))
        .min_by(|a, b| a.name_any().cmp(&b.name_any()))
}

/// Provider ID derived from the host's provisioning identifier
pub fn provider_id_for(host: &BareMetalHost) -> Option<String> {
    host.provisioning_id().map(|id| format!("metal3://{id}"))
}
