use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{Router, http::StatusCode, response::IntoResponse, routing::get};

use crate::metrics;

/* ============================= STATE ============================= */

/// Shared readiness flags, flipped by the components that own them.
#[derive(Default)]
pub struct HealthState {
    bus_connected: AtomicBool,
    cache_synced: AtomicBool,
    pool_running: AtomicBool,
}

impl HealthState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_bus_connected(&self, connected: bool) {
        self.bus_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_cache_synced(&self, synced: bool) {
        self.cache_synced.store(synced, Ordering::Relaxed);
    }

    pub fn set_pool_running(&self, running: bool) {
        self.pool_running.store(running, Ordering::Relaxed);
    }

    pub fn healthy(&self) -> bool {
        self.bus_connected.load(Ordering::Relaxed)
    }

    pub fn ready(&self) -> bool {
        self.healthy()
            && self.cache_synced.load(Ordering::Relaxed)
            && self.pool_running.load(Ordering::Relaxed)
    }
}

/* ============================= ROUTER ============================= */

pub fn build_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get({
            let state = state.clone();
            move || health_handler(state.clone())
        }))
        .route("/readyz", get({
            let state = state.clone();
            move || ready_handler(state.clone())
        }))
}

async fn health_handler(state: Arc<HealthState>) -> impl IntoResponse {
    if state.healthy() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "BUS DISCONNECTED")
    }
}

async fn ready_handler(state: Arc<HealthState>) -> impl IntoResponse {
    if state.ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics encoding error".to_string(),
        ),
    }
}

/* ============================= TESTS ============================= */
