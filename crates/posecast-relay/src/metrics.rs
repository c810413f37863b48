use crate::registry::DeviceSummary;
use crate::server::RelayState;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

#[derive(Serialize)]
struct DevicesResponse {
    count: usize,
    devices: Vec<DeviceSummary>,
}

/// Shared readiness state.
#[derive(Clone, Default, Debug)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a new health state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// `/health`, `/ready` and `/devices`, without the Prometheus scrape route.
pub fn routes(health_state: HealthState, state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())))
        .route("/devices", get(move || devices_handler(Arc::clone(&state))))
}

/// # Errors
///
/// Returns an error if installing the recorder or binding the HTTP server fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
    state: Arc<RelayState>,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = routes(health_state, state).route(
        "/metrics",
        get(move || {
            let h = handle.clone();
            async move { h.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 while draining.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

async fn devices_handler(state: Arc<RelayState>) -> Json<DevicesResponse> {
    let devices = state.registry.list();
    Json(DevicesResponse {
        count: devices.len(),
        devices,
    })
}

/// Connection and registry gauges.
pub mod gauges {
    /// Increment the active connections gauge.
    pub fn inc_connections_active() {
        metrics::gauge!("posecast_connections_active").increment(1.0);
    }

    /// Decrement the active connections gauge.
    pub fn dec_connections_active() {
        metrics::gauge!("posecast_connections_active").decrement(1.0);
    }

    /// Set the registered devices gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn devices_registered(count: usize) {
        metrics::gauge!("posecast_devices_registered").set(count as f64);
    }

    /// Set the active workouts gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn workouts_active(count: usize) {
        metrics::gauge!("posecast_workouts_active").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record an inbound telemetry message of the given type.
    pub fn messages_received_total(kind: &'static str) {
        metrics::counter!("posecast_messages_received_total", "type" => kind).increment(1);
    }

    /// Increment the dropped-messages counter with the given reason label.
    pub fn messages_dropped_total(reason: &'static str) {
        metrics::counter!("posecast_messages_dropped_total", "reason" => reason).increment(1);
    }

    /// Increment the feedback counter.
    pub fn feedback_sent_total() {
        metrics::counter!("posecast_feedback_sent_total").increment(1);
    }

    /// Increment the performance metrics push counter.
    pub fn metrics_pushed_total() {
        metrics::counter!("posecast_metrics_pushed_total").increment(1);
    }

    /// Record an operator command delivered to a device.
    pub fn commands_sent_total(action: &'static str) {
        metrics::counter!("posecast_commands_sent_total", "action" => action).increment(1);
    }
}
