//! API readiness probe.
//!
//! Blocks bootstrap until the cluster serves the Metal3 API. Nothing else in
//! the agent can do useful work before that, so the probe waits for as long
//! as it takes: fixed interval, no growth, no attempt limit.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use crds::{METAL3_GROUP, METAL3_VERSION};
use kube::Client;
use tracing::info;

use crate::error::{DiscoveryError, ReadinessError};

/// Delay between discovery attempts
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// API group/version that must be served before bootstrap continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiGroupTarget {
    pub group: &'static str,
    pub version: &'static str,
}

/// The Metal3 API served by the bare-metal operator
pub const METAL3_TARGET: ApiGroupTarget = ApiGroupTarget {
    group: METAL3_GROUP,
    version: METAL3_VERSION,
};

impl fmt::Display for ApiGroupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.version)
    }
}

/// How often, and how many times, to ask discovery again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry at a fixed interval with no attempt limit
    #[must_use]
    pub const fn forever(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    /// Retry at a fixed interval, giving up after `max_attempts` failures
    #[must_use]
    pub const fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    /// Whether another attempt is allowed after `attempts` failures
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::forever(PROBE_INTERVAL)
    }
}

/// Answers "is this API group/version served?"
#[async_trait]
pub trait ApiDiscovery: Send + Sync {
    /// `Ok(())` when the target is served
    async fn supports(&self, target: &ApiGroupTarget) -> Result<(), DiscoveryError>;
}

/// Discovery against the cluster's `/apis` endpoint.
#[derive(Clone)]
pub struct KubeDiscovery {
    client: Client,
}

impl KubeDiscovery {
    /// Build a discovery client from the connection config.
    ///
    /// A config that cannot produce a client is fatal; the probe loop is
    /// never entered.
    pub fn new(config: kube::Config) -> Result<Self, ReadinessError> {
        let client = Client::try_from(config).map_err(ReadinessError::Client)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ApiDiscovery for KubeDiscovery {
    async fn supports(&self, target: &ApiGroupTarget) -> Result<(), DiscoveryError> {
        let groups = self.client.list_api_groups().await?;
        let group = groups
            .groups
            .iter()
            .find(|g| g.name == target.group)
            .ok_or_else(|| DiscoveryError::GroupAbsent(target.group.to_string()))?;

        if group.versions.iter().any(|v| v.version == target.version) {
            Ok(())
        } else {
            Err(DiscoveryError::VersionAbsent {
                group: target.group.to_string(),
                version: target.version.to_string(),
            })
        }
    }
}

/// Poll discovery until `target` is served.
///
/// Returns the number of attempts it took. With an unbounded policy this only
/// returns on success; the caller's task is occupied for the whole wait.
pub async fn wait_for_apis<D>(
    discovery: &D,
    target: &ApiGroupTarget,
    policy: &RetryPolicy,
) -> Result<u32, ReadinessError>
where
    D: ApiDiscovery + ?Sized,
{
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        match discovery.supports(target).await {
            Ok(()) => {
                info!("Found API group {}", target);
                return Ok(attempts);
            }
            Err(err) => {
                info!("Waiting for API group {} to be available: {}", target, err);
                if !policy.allows_retry(attempts) {
                    return Err(ReadinessError::Exhausted {
                        target: target.to_string(),
                        attempts,
                        last: err,
                    });
                }
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}
