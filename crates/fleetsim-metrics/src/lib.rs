//! ---
//! fleetsim_section: "04-observability"
//! fleetsim_subsection: "module"
//! fleetsim_type: "source"
//! fleetsim_scope: "code"
//! fleetsim_description: "Metrics collection and export utilities."
//! fleetsim_version: "v0.1.0"
//! fleetsim_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shared registry type used across the simulator.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let bound = std_listener
        .local_addr()
        .with_context(|| "failed to read metrics listener address")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %bound, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr: bound,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        ),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/plain"),
                )],
                String::from("metrics encoding error"),
            )
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bound address; differs from the requested one when port 0 was used.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Counters and gauges recorded by streaming sessions.
#[derive(Clone, Debug)]
pub struct FleetMetrics {
    registry: SharedRegistry,
    telemetry_sent: IntCounterVec,
    acknowledgements: IntCounterVec,
    terminations: IntCounterVec,
    active_sessions: IntGauge,
}

impl FleetMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let telemetry_sent = IntCounterVec::new(
            Opts::new(
                "fleetsim_telemetry_sent_total",
                "Telemetry messages handed to the transport, by vehicle",
            ),
            &["vehicle_id"],
        )?;
        registry.register(Box::new(telemetry_sent.clone()))?;

        let acknowledgements = IntCounterVec::new(
            Opts::new(
                "fleetsim_acknowledgements_total",
                "Non-default acknowledgements received from the ingestion service, by vehicle",
            ),
            &["vehicle_id"],
        )?;
        registry.register(Box::new(acknowledgements.clone()))?;

        let terminations = IntCounterVec::new(
            Opts::new(
                "fleetsim_session_terminations_total",
                "Streaming sessions that ended, by vehicle and outcome",
            ),
            &["vehicle_id", "outcome"],
        )?;
        registry.register(Box::new(terminations.clone()))?;

        let active_sessions = IntGauge::with_opts(Opts::new(
            "fleetsim_active_sessions",
            "Streaming sessions currently running",
        ))?;
        registry.register(Box::new(active_sessions.clone()))?;

        Ok(Self {
            registry,
            telemetry_sent,
            acknowledgements,
            terminations,
            active_sessions,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_tick(&self, vehicle_id: &str) {
        self.telemetry_sent.with_label_values(&[vehicle_id]).inc();
    }

    pub fn record_ack(&self, vehicle_id: &str) {
        self.acknowledgements.with_label_values(&[vehicle_id]).inc();
    }

    pub fn record_termination(&self, vehicle_id: &str, outcome: &str) {
        self.terminations
            .with_label_values(&[vehicle_id, outcome])
            .inc();
    }

    pub fn session_started(&self) {
        self.active_sessions.inc();
    }

    pub fn session_ended(&self) {
        self.active_sessions.dec();
    }

    pub fn ticks_sent(&self, vehicle_id: &str) -> u64 {
        self.telemetry_sent.with_label_values(&[vehicle_id]).get()
    }

    pub fn acknowledgements(&self, vehicle_id: &str) -> u64 {
        self.acknowledgements.with_label_values(&[vehicle_id]).get()
    }

    pub fn terminations(&self, vehicle_id: &str, outcome: &str) -> u64 {
        self.terminations
            .with_label_values(&[vehicle_id, outcome])
            .get()
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn counters_are_labelled_per_vehicle() {
        let metrics = FleetMetrics::new(new_registry()).unwrap();
        metrics.record_tick("CAR-001");
        metrics.record_tick("CAR-001");
        metrics.record_tick("CAR-002");
        metrics.record_ack("CAR-002");
        metrics.record_termination("CAR-002", "failed");

        assert_eq!(metrics.ticks_sent("CAR-001"), 2);
        assert_eq!(metrics.ticks_sent("CAR-002"), 1);
        assert_eq!(metrics.acknowledgements("CAR-001"), 0);
        assert_eq!(metrics.acknowledgements("CAR-002"), 1);
        assert_eq!(metrics.terminations("CAR-002", "failed"), 1);
        assert_eq!(metrics.terminations("CAR-002", "completed"), 0);
    }

    #[test]
    fn active_gauge_tracks_start_and_end() {
        let metrics = FleetMetrics::new(new_registry()).unwrap();
        metrics.session_started();
        metrics.session_started();
        metrics.session_ended();
        assert_eq!(metrics.active_sessions(), 1);
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = new_registry();
        FleetMetrics::new(registry.clone()).unwrap();
        assert!(FleetMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn exporter_serves_text_format() {
        let metrics = FleetMetrics::new(new_registry()).unwrap();
        metrics.record_tick("CAR-007");

        let server = spawn_http_server(metrics.registry(), "127.0.0.1:0".parse().unwrap()).unwrap();
        let mut stream = tokio::net::TcpStream::connect(server.addr()).await.unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"));
        assert!(response.contains("fleetsim_telemetry_sent_total{vehicle_id=\"CAR-007\"} 1"));

        server.shutdown().await.unwrap();
    }
}
