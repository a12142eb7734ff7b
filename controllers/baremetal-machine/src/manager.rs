//! Supervising run-loop.
//!
//! The manager owns the cluster client, the type registry and every
//! registered runnable. During bootstrap the registry is reachable only
//! through `&mut` on the manager. Controllers check their kinds against it
//! when they are registered, and `start` consumes the manager, so nothing
//! can add a kind once the controllers are running.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use crds::{TypeRegistry, describe};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use kube::Client;
use kube::core::GroupVersionKind;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{ManagerError, RegistrationError};
use crate::leader::LeaderLease;
use crate::metrics::{Metrics, MetricsServer};

/// How long controllers get to drain after the shutdown signal
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// A controller or other long-running task attached to the manager.
///
/// Runnables are expected to finish once [`ControllerManager::stopping`]
/// resolves.
pub type Runnable = BoxFuture<'static, Result<(), ManagerError>>;

/// Resolves once the manager starts shutting down; cloneable and `Sync`, as
/// `Controller::graceful_shutdown_on` requires.
pub type StopSignal = Shared<BoxFuture<'static, ()>>;

/// Run-loop contract consumed by the bootstrap sequencer.
#[async_trait]
pub trait Manager: Send + Sized {
    /// Client handed to the actuator
    type Client: Clone + Send + Sync + 'static;

    fn client(&self) -> Self::Client;

    fn type_registry(&self) -> &TypeRegistry;

    fn type_registry_mut(&mut self) -> &mut TypeRegistry;

    /// Run every registered runnable until `shutdown` resolves.
    async fn start(self, shutdown: BoxFuture<'static, ()>) -> Result<(), ManagerError>;

    /// Check that `controller` only touches registered kinds.
    fn require_kinds(
        &self,
        controller: &str,
        kinds: &[GroupVersionKind],
    ) -> Result<(), RegistrationError> {
        let registry = self.type_registry();
        match kinds.iter().find(|gvk| !registry.recognizes(gvk)) {
            Some(missing) => Err(RegistrationError::UnknownKind {
                controller: controller.to_string(),
                kind: describe(missing),
            }),
            None => Ok(()),
        }
    }
}

/// Kube-backed manager.
pub struct ControllerManager {
    client: Client,
    registry: TypeRegistry,
    metrics: Metrics,
    watch_namespace: Option<String>,
    metrics_addr: Option<SocketAddr>,
    leader_election: Option<(String, String)>,
    runnables: Vec<(String, Runnable)>,
    stop_tx: watch::Sender<bool>,
    stopping: StopSignal,
}

impl ControllerManager {
    /// Connect to the cluster and prepare an empty manager.
    pub fn new(config: &RuntimeConfig) -> Result<Self, ManagerError> {
        let client = Client::try_from(config.cluster.clone())?;
        let leader_election = config.leader_election.then(|| {
            (
                config.lease_namespace().to_string(),
                config.leader_election_id.clone(),
            )
        });

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stopping = async move {
            // Sender dropped also means stop
            let _ = stop_rx.wait_for(|stopped| *stopped).await;
        }
        .boxed()
        .shared();

        Ok(Self {
            client,
            registry: TypeRegistry::new(),
            metrics: Metrics::new()?,
            watch_namespace: config.watch_namespace.clone(),
            metrics_addr: config.metrics_addr,
            leader_election,
            runnables: Vec::new(),
            stop_tx,
            stopping,
        })
    }

    /// Shutdown trigger for runnables and controllers
    pub fn stopping(&self) -> StopSignal {
        self.stopping.clone()
    }

    /// `None` when watching every namespace
    pub fn watch_namespace(&self) -> Option<&str> {
        self.watch_namespace.as_deref()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Attach a named runnable that reads or writes `kinds`.
    pub fn add_runnable(
        &mut self,
        name: &str,
        kinds: &[GroupVersionKind],
        runnable: Runnable,
    ) -> Result<(), RegistrationError> {
        self.require_kinds(name, kinds)?;
        if self.runnables.iter().any(|(existing, _)| existing == name) {
            return Err(RegistrationError::Duplicate(name.to_string()));
        }
        info!(controller = %name, "Registered controller");
        self.runnables.push((name.to_string(), runnable));
        Ok(())
    }

    /// Names of the registered runnables, in registration order
    pub fn runnable_names(&self) -> Vec<&str> {
        self.runnables.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[async_trait]
impl Manager for ControllerManager {
    type Client = Client;

    fn client(&self) -> Client {
        self.client.clone()
    }

    fn type_registry(&self) -> &TypeRegistry {
        &self.registry
    }

    fn type_registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    async fn start(self, mut shutdown: BoxFuture<'static, ()>) -> Result<(), ManagerError> {
        info!(
            kinds = self.registry.len(),
            controllers = ?self.runnable_names(),
            "Starting manager"
        );
        for gvk in self.registry.kinds() {
            debug!(
                kind = %describe(gvk),
                plural = self.registry.plural(gvk).unwrap_or("-"),
                "Registered kind"
            );
        }

        let ControllerManager {
            client,
            metrics,
            metrics_addr,
            leader_election,
            runnables,
            stop_tx,
            ..
        } = self;

        let metrics_task = match metrics_addr {
            Some(addr) => {
                let server = MetricsServer::bind(addr, metrics).await?;
                Some(tokio::spawn(server.serve(stop_tx.subscribe())))
            }
            None => None,
        };

        let lease = match &leader_election {
            Some((namespace, name)) => {
                let lease = LeaderLease::new(client, namespace, name);
                tokio::select! {
                    acquired = lease.acquire() => {
                        if let Err(e) = acquired {
                            stop_metrics(&stop_tx, metrics_task).await;
                            return Err(e);
                        }
                    }
                    () = &mut shutdown => {
                        info!("Shutdown signal received before acquiring leadership");
                        stop_metrics(&stop_tx, metrics_task).await;
                        return Ok(());
                    }
                }
                Some(lease)
            }
            None => None,
        };

        let mut controllers: FuturesUnordered<_> = runnables
            .into_iter()
            .map(|(name, runnable)| async move { (name, runnable.await) })
            .collect();

        let result = {
            let holding = async {
                match &lease {
                    Some(lease) => lease.hold().await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(holding);

            loop {
                tokio::select! {
                    () = &mut shutdown => {
                        info!("Shutdown signal received, stopping controllers");
                        break Ok(());
                    }
                    lost = &mut holding => {
                        error!(error = %lost, "Leader lease lost");
                        break Err(lost);
                    }
                    Some((name, outcome)) = controllers.next() => {
                        match outcome {
                            Ok(()) => {
                                warn!(controller = %name, "Controller stopped before shutdown");
                            }
                            Err(e) => {
                                break Err(ManagerError::Runnable { name, reason: e.to_string() });
                            }
                        }
                    }
                }
            }
        };

        // Every exit path stops the remaining controllers and waits for them
        stop_tx.send_replace(true);
        let drain = async {
            while let Some((name, outcome)) = controllers.next().await {
                if let Err(e) = outcome {
                    warn!(controller = %name, error = %e, "Controller exited with error during shutdown");
                }
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!(grace = ?SHUTDOWN_GRACE, "Controllers did not finish in time");
        }

        if let Some(lease) = &lease {
            lease.release().await;
        }
        stop_metrics(&stop_tx, metrics_task).await;
        info!("Manager stopped");
        result
    }
}

async fn stop_metrics(
    stop_tx: &watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<std::io::Result<()>>>,
) {
    stop_tx.send_replace(true);
    if let Some(task) = task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Metrics server exited with error"),
            Err(e) => warn!(error = %e, "Metrics server task panicked"),
        }
    }
}
