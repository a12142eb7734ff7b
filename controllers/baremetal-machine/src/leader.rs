//! Lease-based leader election.
//!
//! A single `coordination.k8s.io/v1` Lease guards the controllers. Expiry is
//! judged from local observation: a lease whose resourceVersion has not
//! changed for a full lease duration is considered abandoned. Clock skew
//! between replicas therefore never matters.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ManagerError;

/// How long a lease stays valid without renewal
pub const LEASE_DURATION: Duration = Duration::from_secs(15);

/// How often the holder renews
pub const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// The holder steps down when no renewal succeeded for this long. Must stay
/// below `LEASE_DURATION` so it stops before a candidate may take over.
pub const RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// How often a candidate retries acquisition, and a holder a failed renewal
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Last lease version a candidate saw and when it first saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    resource_version: String,
    since: Instant,
}

/// Whether the candidate may write itself into the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Acquire,
    Wait,
}

/// Decide whether to take the lease given its current holder.
///
/// Updates `observed` when the lease has changed since the last look.
pub fn decide(
    holder: Option<&str>,
    resource_version: &str,
    identity: &str,
    observed: &mut Option<Observation>,
    now: Instant,
) -> Decision {
    match holder {
        None | Some("") => return Decision::Acquire,
        Some(h) if h == identity => return Decision::Acquire,
        Some(_) => {}
    }

    match observed {
        Some(seen) if seen.resource_version == resource_version => {
            if now.duration_since(seen.since) >= LEASE_DURATION {
                Decision::Acquire
            } else {
                Decision::Wait
            }
        }
        _ => {
            *observed = Some(Observation {
                resource_version: resource_version.to_string(),
                since: now,
            });
            Decision::Wait
        }
    }
}

/// Holder-side handle on the leader lease.
pub struct LeaderLease {
    api: Api<Lease>,
    name: String,
    identity: String,
}

impl LeaderLease {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        let host = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| "baremetal-machine-controller".to_string());
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            identity: format!("{}_{}", host, uuid::Uuid::new_v4()),
        }
    }

    /// Block until this process holds the lease.
    pub async fn acquire(&self) -> Result<(), ManagerError> {
        info!(lease = %self.name, identity = %self.identity, "Attempting to acquire leader lease");
        let mut observed = None;
        loop {
            match self.try_acquire(&mut observed).await {
                Ok(true) => {
                    info!(lease = %self.name, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => debug!(lease = %self.name, "Leader lease held by another instance"),
                Err(e) => warn!(lease = %self.name, error = %e, "Failed to acquire leader lease, retrying"),
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    async fn try_acquire(&self, observed: &mut Option<Observation>) -> Result<bool, kube::Error> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return self.create().await;
        };

        let spec = lease.spec.unwrap_or_default();
        let resource_version = lease.metadata.resource_version.unwrap_or_default();
        let holder = spec.holder_identity.as_deref();

        if decide(holder, &resource_version, &self.identity, observed, Instant::now())
            == Decision::Wait
        {
            return Ok(false);
        }

        let transitions = spec.lease_transitions.unwrap_or(0)
            + i32::from(holder != Some(self.identity.as_str()));
        let now = now_micro();
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": LEASE_DURATION.as_secs(),
                "acquireTime": now,
                "renewTime": now,
                "leaseTransitions": transitions,
            }
        });

        match self
            .api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self) -> Result<bool, kube::Error> {
        let now = now_micro();
        let lease: Lease = serde_json::from_value(json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": { "name": self.name },
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": LEASE_DURATION.as_secs(),
                "acquireTime": now,
                "renewTime": now,
                "leaseTransitions": 0,
            }
        }))
        .map_err(kube::Error::SerdeError)?;

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Renew the lease until it is lost; only returns on loss.
    pub async fn hold(&self) -> ManagerError {
        let mut last_renewal = Instant::now();
        let mut wait = RENEW_INTERVAL;
        loop {
            tokio::time::sleep(wait).await;

            // a renewal still in flight at the deadline counts as failed
            let budget = RENEW_DEADLINE.saturating_sub(last_renewal.elapsed());
            let reason = match tokio::time::timeout(budget, self.renew()).await {
                Ok(Ok(true)) => {
                    last_renewal = Instant::now();
                    wait = RENEW_INTERVAL;
                    continue;
                }
                Ok(Ok(false)) => {
                    return ManagerError::LeaderElection(format!(
                        "lease {} taken over by another instance",
                        self.name
                    ));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => "renewal timed out".to_string(),
            };

            match retry_delay(last_renewal.elapsed()) {
                Some(delay) => {
                    warn!(lease = %self.name, error = %reason, "Failed to renew leader lease, retrying");
                    wait = delay;
                }
                None => {
                    return ManagerError::LeaderElection(format!(
                        "lease {} not renewed within {:?}: {}",
                        self.name, RENEW_DEADLINE, reason
                    ));
                }
            }
        }
    }

    async fn renew(&self) -> Result<bool, kube::Error> {
        let lease = self.api.get(&self.name).await?;
        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let patch = json!({
            "metadata": { "resourceVersion": lease.metadata.resource_version },
            "spec": { "renewTime": now_micro() }
        });
        self.api
            .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(true)
    }

    /// Give the lease up so another replica can take over immediately.
    pub async fn release(&self) {
        let result = async {
            let lease = self.api.get(&self.name).await?;
            let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
            if holder != Some(self.identity.as_str()) {
                return Ok(());
            }
            let patch = json!({
                "metadata": { "resourceVersion": lease.metadata.resource_version },
                "spec": { "holderIdentity": "", "leaseDurationSeconds": 1 }
            });
            self.api
                .patch(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map(|_| ())
        }
        .await;

        match result {
            Ok(()) => info!(lease = %self.name, "Released leader lease"),
            Err(e) => warn!(lease = %self.name, error = %e, "Failed to release leader lease"),
        }
    }
}

/// Delay before retrying a failed renewal, or `None` once the renew
/// deadline has passed.
pub fn retry_delay(since_renewal: Duration) -> Option<Duration> {
    let left = RENEW_DEADLINE.checked_sub(since_renewal)?;
    (!left.is_zero()).then(|| RETRY_PERIOD.min(left))
}

fn now_micro() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
