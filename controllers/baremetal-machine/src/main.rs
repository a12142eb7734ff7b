//! Bare-metal Machine Controller
//!
//! Waits until the Metal3 `metal3.io/v1alpha1` API is served, then brings up
//! a controller manager running:
//! - machine: drives the `BareMetalHost` actuator for each `Machine`, and
//!   also watches hosts so host changes reach the consuming machine
//! - host-release: returns hosts whose consuming machine has disappeared
//!
//! Any bootstrap failure exits with status 1; a clean shutdown on SIGINT or
//! SIGTERM exits with status 0.

mod actuator;
mod config;
mod error;
mod host_controller;
mod leader;
mod machine_controller;
mod manager;
mod metrics;
mod platform;
mod readiness;
mod sequencer;
#[cfg(test)]
mod test_utils;

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::{Cli, RuntimeConfig};
use crate::platform::KubePlatform;
use crate::sequencer::Sequencer;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        error!("Failed to install rustls crypto provider");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "Starting bare-metal machine controller");

    match Sequencer::new(KubePlatform)
        .run(RuntimeConfig::load(cli), shutdown_signal())
        .await
    {
        Ok(()) => {
            info!("Controller manager exited cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(stage = %e.stage(), error = %e, "Bootstrap failed");
            ExitCode::FAILURE
        }
    }
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received SIGINT"),
        () = terminate => info!("Received SIGTERM"),
    }
}
