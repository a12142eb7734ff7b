//! Command line and cluster connection configuration.

use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use tracing::info;

use crate::error::ConfigError;

/// Name of the Lease used when leader election is enabled
pub const LEADER_ELECTION_ID: &str = "controller-leader-election-capbm";

/// Bare-metal machine controller manager
#[derive(Parser, Debug, Clone)]
#[command(name = "baremetal-machine-controller", version, about, long_about = None)]
pub struct Cli {
    /// Namespace that the controller watches to reconcile machine-api objects.
    /// If unspecified, the controller watches for machine-api objects across
    /// all namespaces.
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// The address the metric endpoint binds to ("0" disables it)
    #[arg(long = "metrics-addr", env = "METRICS_ADDR", default_value = ":8080")]
    pub metrics_addr: String,

    /// Enable leader election for controller manager. Enabling this will
    /// ensure there is only one active controller manager.
    #[arg(long = "enable-leader-election", env = "ENABLE_LEADER_ELECTION")]
    pub enable_leader_election: bool,
}

/// Process-lifetime configuration, immutable once loaded.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Cluster endpoint and credentials
    pub cluster: kube::Config,
    /// `None` watches every namespace
    pub watch_namespace: Option<String>,
    /// `None` disables the metrics endpoint
    pub metrics_addr: Option<SocketAddr>,
    pub leader_election: bool,
    pub leader_election_id: String,
}

impl RuntimeConfig {
    /// Resolve the cluster connection (kubeconfig or in-cluster) and combine
    /// it with the parsed flags.
    pub async fn load(cli: Cli) -> Result<Self, ConfigError> {
        let cluster = kube::Config::infer().await?;
        Self::from_parts(&cli, cluster)
    }

    /// Combine parsed flags with an already resolved cluster connection.
    pub fn from_parts(cli: &Cli, cluster: kube::Config) -> Result<Self, ConfigError> {
        let watch_namespace = Some(cli.namespace.trim())
            .filter(|ns| !ns.is_empty())
            .map(str::to_string);

        if let Some(ns) = &watch_namespace {
            info!("Watching machine-api objects only in namespace {:?} for reconciliation.", ns);
        }

        Ok(Self {
            cluster,
            watch_namespace,
            metrics_addr: parse_metrics_addr(&cli.metrics_addr)?,
            leader_election: cli.enable_leader_election,
            leader_election_id: LEADER_ELECTION_ID.to_string(),
        })
    }

    /// Namespace holding the leader-election Lease
    #[must_use]
    pub fn lease_namespace(&self) -> &str {
        self.watch_namespace
            .as_deref()
            .unwrap_or(&self.cluster.default_namespace)
    }
}

/// Parse a bind address in the `host:port` form, accepting the host-less
/// `:port` shorthand and `0` for "disabled".
pub fn parse_metrics_addr(addr: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let addr = addr.trim();
    if addr == "0" {
        return Ok(None);
    }

    let invalid = |reason: &str| ConfigError::MetricsAddr {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(Some(parsed));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    let ip = match host {
        "" => Ipv4Addr::UNSPECIFIED,
        "localhost" => Ipv4Addr::LOCALHOST,
        _ => return Err(invalid("host must be an IP address or localhost")),
    };

    Ok(Some(SocketAddr::from((ip, port))))
}
