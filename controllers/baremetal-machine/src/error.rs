//! Controller-specific error types.
//!
//! Bootstrap distinguishes only two kinds of failure: the Metal3 API not
//! being served yet (retried inside the readiness probe, never surfaced) and
//! everything else, which is fatal and carried by [`BootstrapError`].

use std::fmt;

use crds::SchemeError;
use kube::Error as KubeError;
use thiserror::Error;

/// Ordered stages of the bootstrap sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ParseConfig,
    ProbeReadiness,
    ConstructManager,
    RegisterSchemes,
    ConstructActuator,
    RegisterControllers,
    Run,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ParseConfig => "parse_config",
            Stage::ProbeReadiness => "probe_readiness",
            Stage::ConstructManager => "construct_manager",
            Stage::RegisterSchemes => "register_schemes",
            Stage::ConstructActuator => "construct_actuator",
            Stage::RegisterControllers => "register_controllers",
            Stage::Run => "run",
        };
        f.write_str(name)
    }
}

/// Invalid command line or cluster connection settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Metrics bind address could not be parsed
    #[error("invalid metrics bind address {addr:?}: {reason}")]
    MetricsAddr { addr: String, reason: String },

    /// No kubeconfig or in-cluster configuration could be loaded
    #[error("unable to load cluster configuration: {0}")]
    Kubeconfig(#[from] kube::config::InferConfigError),
}

/// A single discovery attempt did not find the target API.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The API group is not served at all
    #[error("API group {0} is not served")]
    GroupAbsent(String),

    /// The group is served but not at the required version
    #[error("API group {group} does not serve version {version}")]
    VersionAbsent { group: String, version: String },

    /// The discovery request itself failed
    #[error("discovery request failed: {0}")]
    Request(#[from] KubeError),
}

/// The readiness probe gave up or could not start.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The discovery client could not be built from the connection config
    #[error("unable to create discovery client: {0}")]
    Client(#[source] KubeError),

    /// A bounded retry policy ran out of attempts
    #[error("API group {target} still unavailable after {attempts} attempts: {last}")]
    Exhausted {
        target: String,
        attempts: u32,
        #[source]
        last: DiscoveryError,
    },
}

/// Run-loop construction or execution failure.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Kubernetes client could not be created
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Metrics registry setup failed
    #[error("metrics setup failed: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Metrics endpoint could not bind or serve
    #[error("metrics server failed: {0}")]
    MetricsServer(#[from] std::io::Error),

    /// Leader election failed or the lease was lost
    #[error("leader election failed: {0}")]
    LeaderElection(String),

    /// A registered runnable exited with an error
    #[error("runnable {name} failed: {reason}")]
    Runnable { name: String, reason: String },
}

/// Actuator construction or operation failure.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// Constructor parameters were unusable
    #[error("invalid actuator parameters: {0}")]
    InvalidParams(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Provider spec on the machine could not be decoded
    #[error("invalid provider spec on machine {machine}: {source}")]
    ProviderSpec {
        machine: String,
        #[source]
        source: serde_json::Error,
    },

    /// No host satisfies the machine's selector
    #[error("no available BareMetalHost for machine {0}")]
    NoAvailableHost(String),
}

/// Controller registration failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// A controller needs a kind missing from the type registry
    #[error("controller {controller} requires unregistered kind {kind}")]
    UnknownKind { controller: String, kind: String },

    /// Two controllers were registered under the same name
    #[error("controller {0} registered twice")]
    Duplicate(String),
}

/// Error surfaced from a reconcile call; logged and requeued, never fatal.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Actuator operation failed
    #[error(transparent)]
    Actuator(#[from] ActuatorError),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Finalizer bookkeeping failed
    #[error("finalizer error: {0}")]
    Finalizer(String),
}

/// Fatal bootstrap error, tagged with the stage it ended.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("unable to load configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("unable to discover required APIs: {0}")]
    Readiness(#[from] ReadinessError),

    #[error("unable to set up overall controller manager: {0}")]
    Manager(#[source] ManagerError),

    #[error("unable to register type schemes: {0}")]
    Scheme(#[from] SchemeError),

    #[error("unable to construct machine actuator: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("failed to add controller to manager: {0}")]
    Registration(#[from] RegistrationError),

    #[error("unable to run manager: {0}")]
    Run(#[source] ManagerError),
}

impl BootstrapError {
    /// Stage the sequence stopped in
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            BootstrapError::Config(_) => Stage::ParseConfig,
            BootstrapError::Readiness(_) => Stage::ProbeReadiness,
            BootstrapError::Manager(_) => Stage::ConstructManager,
            BootstrapError::Scheme(_) => Stage::RegisterSchemes,
            BootstrapError::Actuator(_) => Stage::ConstructActuator,
            BootstrapError::Registration(_) => Stage::RegisterControllers,
            BootstrapError::Run(_) => Stage::Run,
        }
    }
}
