//! Bootstrap sequencer.
//!
//! Walks the fixed stage order
//! `ParseConfig → ProbeReadiness → ConstructManager → RegisterSchemes →
//! ConstructActuator → RegisterControllers → Run`. Each stage runs at most
//! once and the first failure ends the sequence; only the readiness probe
//! retries internally. Nothing is rolled back: the process exits instead of
//! continuing half-initialised.

use std::future::Future;
use std::sync::Arc;

use crds::{SchemeBuilder, register_schemes};
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{
    ActuatorError, BootstrapError, ConfigError, ManagerError, ReadinessError, RegistrationError,
    Stage,
};
use crate::manager::Manager;
use crate::readiness::{ApiDiscovery, ApiGroupTarget, METAL3_TARGET, RetryPolicy, wait_for_apis};

/// Everything the sequencer needs from the outside world.
pub trait Collaborators {
    type Discovery: ApiDiscovery;
    type Manager: Manager;
    type Actuator: Send + Sync + 'static;

    /// Build the discovery client; failure is fatal, not retried
    fn discovery(&self, config: &RuntimeConfig) -> Result<Self::Discovery, ReadinessError>;

    fn manager(&self, config: &RuntimeConfig) -> Result<Self::Manager, ManagerError>;

    fn scheme_builders(&self) -> Vec<SchemeBuilder>;

    fn actuator(
        &self,
        client: <Self::Manager as Manager>::Client,
    ) -> Result<Self::Actuator, ActuatorError>;

    /// Attach the actuator-driven controller and any auxiliary controllers
    fn register_controllers(
        &self,
        manager: &mut Self::Manager,
        actuator: Arc<Self::Actuator>,
    ) -> Result<(), RegistrationError>;
}

/// Ordered, fail-fast bootstrap of the controller manager.
pub struct Sequencer<C> {
    collaborators: C,
    target: ApiGroupTarget,
    retry: RetryPolicy,
}

impl<C: Collaborators> Sequencer<C> {
    pub fn new(collaborators: C) -> Self {
        Self {
            collaborators,
            target: METAL3_TARGET,
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run every stage, then block in the manager until `shutdown` resolves.
    pub async fn run<F, S>(self, config: F, shutdown: S) -> Result<(), BootstrapError>
    where
        F: Future<Output = Result<RuntimeConfig, ConfigError>>,
        S: Future<Output = ()> + Send + 'static,
    {
        enter(Stage::ParseConfig);
        let config = config.await?;

        enter(Stage::ProbeReadiness);
        let discovery = self.collaborators.discovery(&config)?;
        wait_for_apis(&discovery, &self.target, &self.retry).await?;

        enter(Stage::ConstructManager);
        let mut manager = self
            .collaborators
            .manager(&config)
            .map_err(BootstrapError::Manager)?;

        enter(Stage::RegisterSchemes);
        register_schemes(
            manager.type_registry_mut(),
            &self.collaborators.scheme_builders(),
        )?;
        info!(kinds = manager.type_registry().len(), "Type schemes registered");

        enter(Stage::ConstructActuator);
        let actuator = Arc::new(self.collaborators.actuator(manager.client())?);

        enter(Stage::RegisterControllers);
        self.collaborators
            .register_controllers(&mut manager, actuator)?;

        enter(Stage::Run);
        manager
            .start(Box::pin(shutdown))
            .await
            .map_err(BootstrapError::Run)
    }
}

fn enter(stage: Stage) {
    info!(%stage, "Entering bootstrap stage");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Cli;
    use crate::test_utils::{CapturedLogs, FakeManager, Journal, ScriptedDiscovery};
    use clap::Parser;
    use crds::{BareMetalHost, Machine, SchemeError, TypeRegistry, gvk_of};
    use kube::core::GroupVersionKind;

    /// Collaborators that record each stage and can fail at one of them
    struct FakePlatform {
        journal: Journal,
        discovery_failures: u32,
        fail_at: Option<Stage>,
    }

    impl FakePlatform {
        fn new(journal: &Journal) -> Self {
            Self {
                journal: journal.clone(),
                discovery_failures: 0,
                fail_at: None,
            }
        }

        fn failing_at(journal: &Journal, stage: Stage) -> Self {
            Self {
                fail_at: Some(stage),
                ..Self::new(journal)
            }
        }

        fn fails(&self, stage: Stage) -> bool {
            self.fail_at == Some(stage)
        }
    }

    fn conflicting_machine(registry: &mut TypeRegistry) -> Result<(), SchemeError> {
        registry.add_kind(
            GroupVersionKind::gvk("machine.openshift.io", "v1beta1", "Machine"),
            Some("machinez"),
        )
    }

    impl Collaborators for FakePlatform {
        type Discovery = ScriptedDiscovery;
        type Manager = FakeManager;
        type Actuator = String;

        fn discovery(&self, _config: &RuntimeConfig) -> Result<ScriptedDiscovery, ReadinessError> {
            self.journal.record("discovery");
            if self.fails(Stage::ProbeReadiness) {
                return Err(ReadinessError::Client(kube::Error::Service(
                    "malformed cluster endpoint".into(),
                )));
            }
            Ok(ScriptedDiscovery::failing_then_ok(self.discovery_failures))
        }

        fn manager(&self, _config: &RuntimeConfig) -> Result<FakeManager, ManagerError> {
            self.journal.record("manager");
            if self.fails(Stage::ConstructManager) {
                return Err(ManagerError::LeaderElection("no lease namespace".to_string()));
            }
            let mut manager = FakeManager::new(self.journal.clone());
            manager.fail_start = self.fails(Stage::Run);
            Ok(manager)
        }

        fn scheme_builders(&self) -> Vec<SchemeBuilder> {
            let mut builders = crds::SCHEME_BUILDERS.to_vec();
            if self.fails(Stage::RegisterSchemes) {
                builders.push(conflicting_machine);
            }
            builders
        }

        fn actuator(&self, client: &'static str) -> Result<String, ActuatorError> {
            self.journal.record("actuator");
            if self.fails(Stage::ConstructActuator) {
                return Err(ActuatorError::InvalidParams("empty field manager".to_string()));
            }
            Ok(format!("actuator({client})"))
        }

        fn register_controllers(
            &self,
            manager: &mut FakeManager,
            actuator: Arc<String>,
        ) -> Result<(), RegistrationError> {
            self.journal.record("controllers");
            let kinds = if self.fails(Stage::RegisterControllers) {
                vec![GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta1", "Cluster")]
            } else {
                vec![gvk_of::<Machine>(), gvk_of::<BareMetalHost>()]
            };
            manager.require_kinds("machine", &kinds)?;
            manager.controllers.push(format!("machine:{actuator}"));
            Ok(())
        }
    }

    fn config() -> Result<RuntimeConfig, ConfigError> {
        let cli = Cli::try_parse_from(["baremetal-machine-controller"]).unwrap();
        RuntimeConfig::from_parts(&cli, kube::Config::new("https://127.0.0.1:6443".parse().unwrap()))
    }

    async fn run(platform: FakePlatform) -> Result<(), BootstrapError> {
        Sequencer::new(platform)
            .run(async { config() }, std::future::ready(()))
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaches_run_without_retry_lines() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let journal = Journal::default();

        run(FakePlatform::new(&journal)).await.unwrap();

        assert_eq!(
            journal.entries(),
            vec!["discovery", "manager", "schemes", "actuator", "controllers", "start", "stopped"]
        );
        assert_eq!(logs.count("Waiting for API group"), 0);
        assert_eq!(logs.count("Found API group metal3.io/v1alpha1"), 1);
        assert_eq!(logs.count("stage=run"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_through_two_failures_then_continues() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let journal = Journal::default();
        let mut platform = FakePlatform::new(&journal);
        platform.discovery_failures = 2;

        run(platform).await.unwrap();

        assert_eq!(logs.count("Waiting for API group metal3.io/v1alpha1 to be available"), 2);
        assert_eq!(logs.count("Found API group metal3.io/v1alpha1"), 1);

        let lines = logs.lines();
        let found = lines.iter().position(|l| l.contains("Found API group")).unwrap();
        let manager = lines
            .iter()
            .position(|l| l.contains("stage=construct_manager"))
            .unwrap();
        assert!(found < manager);
        assert_eq!(journal.entries()[1], "manager");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stage_halts_later_stages() {
        let cases = [
            (Stage::ConstructManager, vec!["discovery", "manager"]),
            (Stage::RegisterSchemes, vec!["discovery", "manager", "schemes"]),
            (Stage::ConstructActuator, vec!["discovery", "manager", "schemes", "actuator"]),
            (
                Stage::RegisterControllers,
                vec!["discovery", "manager", "schemes", "actuator", "controllers"],
            ),
            (
                Stage::Run,
                vec!["discovery", "manager", "schemes", "actuator", "controllers", "start"],
            ),
        ];

        for (stage, expected) in cases {
            let journal = Journal::default();
            let err = run(FakePlatform::failing_at(&journal, stage)).await.unwrap_err();
            assert_eq!(err.stage(), stage, "{err}");
            assert_eq!(journal.entries(), expected, "failing at {stage}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_client_failure_is_not_retried() {
        let logs = CapturedLogs::default();
        let _guard = logs.install();
        let journal = Journal::default();

        let err = run(FakePlatform::failing_at(&journal, Stage::ProbeReadiness))
            .await
            .unwrap_err();

        assert!(matches!(err, BootstrapError::Readiness(ReadinessError::Client(_))));
        assert_eq!(journal.entries(), vec!["discovery"]);
        assert_eq!(logs.count("Waiting for API group"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_config_stops_before_discovery() {
        let journal = Journal::default();
        let err = Sequencer::new(FakePlatform::new(&journal))
            .run(
                async {
                    Err(ConfigError::MetricsAddr {
                        addr: "8080".to_string(),
                        reason: "missing port".to_string(),
                    })
                },
                std::future::ready(()),
            )
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::ParseConfig);
        assert!(journal.entries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_policy_surfaces_readiness_error() {
        let journal = Journal::default();
        let mut platform = FakePlatform::new(&journal);
        platform.discovery_failures = 5;

        let err = Sequencer::new(platform)
            .with_retry_policy(RetryPolicy::bounded(std::time::Duration::from_secs(1), 2))
            .run(async { config() }, std::future::ready(()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            BootstrapError::Readiness(ReadinessError::Exhausted { attempts: 2, .. })
        ));
        assert_eq!(journal.entries(), vec!["discovery"]);
    }
}
