//! Prometheus metrics for the server, served over a small HTTP exporter
//! when `prometheus.enabled` is set.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{http::header, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::PrometheusSection;
use crate::error::{SserverError, SserverResult};
use crate::task_manager::TaskManager;

pub struct ServerMetrics {
    registry: Registry,
    pub sessions: IntGauge,
    pub connections_total: IntCounter,
    pub job_broadcasts: IntCounterVec,
    pub shares_accepted: IntCounterVec,
    pub shares_rejected: IntCounterVec,
    pub last_notify_age: IntGaugeVec,
}

impl ServerMetrics {
    pub fn new() -> SserverResult<Self> {
        let registry = Registry::new();

        let sessions = IntGauge::new("sserver_sessions", "Live miner sessions")?;
        let connections_total =
            IntCounter::new("sserver_connections_total", "Accepted TCP connections")?;
        let job_broadcasts = IntCounterVec::new(
            Opts::new("sserver_job_broadcasts_total", "Jobs broadcast to sessions"),
            &["chain"],
        )?;
        let shares_accepted = IntCounterVec::new(
            Opts::new("sserver_shares_accepted_total", "Shares accepted"),
            &["chain"],
        )?;
        let shares_rejected = IntCounterVec::new(
            Opts::new("sserver_shares_rejected_total", "Shares rejected"),
            &["chain"],
        )?;
        let last_notify_age = IntGaugeVec::new(
            Opts::new(
                "sserver_last_notify_age_seconds",
                "Seconds since the last mining notify",
            ),
            &["chain"],
        )?;

        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(job_broadcasts.clone()))?;
        registry.register(Box::new(shares_accepted.clone()))?;
        registry.register(Box::new(shares_rejected.clone()))?;
        registry.register(Box::new(last_notify_age.clone()))?;

        Ok(Self {
            registry,
            sessions,
            connections_total,
            job_broadcasts,
            shares_accepted,
            shares_rejected,
            last_notify_age,
        })
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!("failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Binds the exporter and serves the metrics route until shutdown.
pub async fn spawn_exporter(
    metrics: Arc<ServerMetrics>,
    config: &PrometheusSection,
    notify_shutdown: &broadcast::Sender<()>,
    task_manager: &TaskManager,
) -> SserverResult<()> {
    if !config.path.starts_with('/') {
        return Err(SserverError::Config(format!(
            "prometheus.path must start with '/': {}",
            config.path
        )));
    }
    let ip: IpAddr = config
        .address
        .parse()
        .map_err(|_| SserverError::Config(format!("invalid prometheus.address: {}", config.address)))?;
    let addr = SocketAddr::new(ip, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let app = Router::new().route(
        &config.path,
        get(move || {
            let metrics = metrics.clone();
            async move {
                (
                    [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                    metrics.render(),
                )
                    .into_response()
            }
        }),
    );

    let mut shutdown_rx = notify_shutdown.subscribe();
    info!("metrics exporter listening on {}{}", addr, config.path);
    task_manager.spawn("metrics exporter", async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("metrics exporter failed: {}", e);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_series() {
        let metrics = ServerMetrics::new().unwrap();
        metrics.sessions.set(3);
        metrics.job_broadcasts.with_label_values(&["btc"]).inc();

        let text = metrics.render();
        assert!(text.contains("sserver_sessions 3"));
        assert!(text.contains("sserver_job_broadcasts_total{chain=\"btc\"} 1"));
    }
}
