//! Liveness and readiness endpoints.
//!
//! - `GET /health` answers 200 while the process runs.
//! - `GET /ready` answers 200 once the signaling listener is accepting and
//!   the registry actor is running, and 503 before that or while draining.
//! - `GET /metrics` renders Prometheus text when a recorder handle is given.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health state shared between `main` and the health router.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    ready: AtomicBool,
    instance_id: String,
}

impl HealthState {
    /// Live, not yet ready.
    #[must_use]
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
            instance_id: instance_id.into(),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness, e.g. on shutdown.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    instance_id: String,
}

/// Build the health router. `/metrics` is mounted only when a handle is given.
pub fn health_router(health_state: Arc<HealthState>, metrics: Option<PrometheusHandle>) -> Router {
    let checks = Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state);

    match metrics {
        Some(handle) => checks.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(handle),
        ),
        None => checks,
    }
}

async fn liveness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<HealthBody>) {
    health_response(state.is_live(), "alive", &state)
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<HealthBody>) {
    health_response(state.is_ready(), "ready", &state)
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn health_response(
    ok: bool,
    ok_status: &'static str,
    state: &HealthState,
) -> (StatusCode, Json<HealthBody>) {
    let (code, status) = if ok {
        (StatusCode::OK, ok_status)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (
        code,
        Json(HealthBody {
            status,
            instance_id: state.instance_id.clone(),
        }),
    )
}
