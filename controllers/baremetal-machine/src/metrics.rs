//! Prometheus metrics and the scrape endpoint.
//!
//! ## Metrics
//! - `capbm_reconcile_total{controller, result}` - Counter of reconcile calls
//!
//! The endpoint also answers `/healthz` and `/readyz` so the same port can
//! back the pod's probes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

/// Metrics shared by every controller attached to the manager.
#[derive(Clone)]
pub struct Metrics {
    reconciles: IntCounterVec,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create the metric set on a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());

        let reconciles = IntCounterVec::new(
            Opts::new("reconcile_total", "Total number of reconcile calls").namespace("capbm"),
            &["controller", "result"],
        )?;
        registry.register(Box::new(reconciles.clone()))?;

        Ok(Self {
            reconciles,
            registry,
        })
    }

    /// Count one reconcile outcome
    pub fn record_reconcile(&self, controller: &str, success: bool) {
        let result = if success { "success" } else { "error" };
        self.reconciles
            .with_label_values(&[controller, result])
            .inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// A bound, not yet serving, metrics endpoint.
pub struct MetricsServer {
    listener: TcpListener,
    metrics: Metrics,
}

impl MetricsServer {
    /// Bind the endpoint; binding failures surface before any controller starts.
    pub async fn bind(addr: SocketAddr, metrics: Metrics) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Metrics endpoint listening");
        Ok(Self { listener, metrics })
    }

    /// Serve until `stop` flips to `true`.
    pub async fn serve(self, mut stop: watch::Receiver<bool>) -> std::io::Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(|| async { "ok" }))
            .route("/readyz", get(|| async { "ok" }))
            .with_state(self.metrics);

        axum::serve(self.listener, app)
            .with_graceful_shutdown(async move {
                // Sender dropped also means stop
                let _ = stop.wait_for(|stopped| *stopped).await;
            })
            .await
    }
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_reconciles() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile("machine", true);
        metrics.record_reconcile("machine", true);
        metrics.record_reconcile("host-release", false);

        let text = metrics.render().unwrap();
        assert!(text.contains(r#"capbm_reconcile_total{controller="machine",result="success"} 2"#));
        assert!(text.contains(r#"capbm_reconcile_total{controller="host-release",result="error"} 1"#));
    }

    #[tokio::test]
    async fn test_server_stops_when_signalled() {
        let metrics = Metrics::new().unwrap();
        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), metrics)
            .await
            .unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(stop_rx));

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
