//! Production wiring for the bootstrap sequencer.

use std::sync::Arc;

use crds::SchemeBuilder;
use kube::Client;

use crate::actuator::{ActuatorParams, BareMetalActuator};
use crate::config::RuntimeConfig;
use crate::error::{ActuatorError, ManagerError, ReadinessError, RegistrationError};
use crate::host_controller::AUXILIARY_CONTROLLERS;
use crate::machine_controller::{HostWatch, MachineControllerRegistration};
use crate::manager::ControllerManager;
use crate::readiness::KubeDiscovery;
use crate::sequencer::Collaborators;

/// Cluster-backed collaborators.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubePlatform;

impl Collaborators for KubePlatform {
    type Discovery = KubeDiscovery;
    type Manager = ControllerManager;
    type Actuator = BareMetalActuator;

    fn discovery(&self, config: &RuntimeConfig) -> Result<KubeDiscovery, ReadinessError> {
        KubeDiscovery::new(config.cluster.clone())
    }

    fn manager(&self, config: &RuntimeConfig) -> Result<ControllerManager, ManagerError> {
        ControllerManager::new(config)
    }

    fn scheme_builders(&self) -> Vec<SchemeBuilder> {
        crds::SCHEME_BUILDERS.to_vec()
    }

    fn actuator(&self, client: Client) -> Result<BareMetalActuator, ActuatorError> {
        BareMetalActuator::new(ActuatorParams::new(client))
    }

    fn register_controllers(
        &self,
        manager: &mut ControllerManager,
        actuator: Arc<BareMetalActuator>,
    ) -> Result<(), RegistrationError> {
        MachineControllerRegistration::new(actuator)
            .augment(HostWatch)
            .register(manager)?;

        for add_to_manager in AUXILIARY_CONTROLLERS {
            add_to_manager(manager)?;
        }
        Ok(())
    }
}
