//! HTTP request handlers.

use super::AppState;
use crate::agent::{Agent, HealthStatus};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::fmt::Write;
use std::sync::Arc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn upgrade(state: &AppState) -> Result<Arc<Agent>, Response> {
    state.agent.upgrade().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable" })),
        )
            .into_response()
    })
}

// ============================================================================
// Liveness & readiness
// ============================================================================

pub async fn handle_health(State(state): State<AppState>) -> Response {
    let agent = match upgrade(&state) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let health = agent.health().await;
    let code = match health.status {
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };

    let body = json!({
        "status": health.status,
        "version": VERSION,
        "state": agent.state(),
        "uptimeSeconds": health.uptime_seconds,
        "health": health,
    });
    (code, Json(body)).into_response()
}

pub async fn handle_live() -> impl IntoResponse {
    Json(json!({ "status": "alive", "version": VERSION }))
}

/// Ready only when running and every adapter passes a round trip.
pub async fn handle_ready(State(state): State<AppState>) -> Response {
    let agent = match upgrade(&state) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let adapters = agent.storage_deep_health().await;
    let ready = agent.is_running() && !adapters.is_empty() && adapters.values().all(|ok| *ok);

    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(json!({ "ready": ready, "adapters": adapters }))).into_response()
}

// ============================================================================
// Status & metrics
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> Response {
    match upgrade(&state) {
        Ok(agent) => Json(agent.status().await).into_response(),
        Err(resp) => resp,
    }
}

/// Prometheus text exposition.
pub async fn handle_metrics(State(state): State<AppState>) -> Response {
    let agent = match upgrade(&state) {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let status = agent.status().await;
    let health = &status.health;

    let mut out = String::with_capacity(1024);
    let _ = writeln!(out, "# HELP probeagent_up Whether the agent is running.");
    let _ = writeln!(out, "# TYPE probeagent_up gauge");
    let _ = writeln!(out, "probeagent_up {}", u8::from(status.running));
    let _ = writeln!(out, "# HELP probeagent_uptime_seconds Seconds since the agent started.");
    let _ = writeln!(out, "# TYPE probeagent_uptime_seconds gauge");
    let _ = writeln!(out, "probeagent_uptime_seconds {}", health.uptime_seconds);
    let _ = writeln!(out, "# HELP probeagent_memory_megabytes Resident memory of the agent process.");
    let _ = writeln!(out, "# TYPE probeagent_memory_megabytes gauge");
    let _ = writeln!(out, "probeagent_memory_megabytes {}", health.memory_mb);
    let _ = writeln!(out, "# HELP probeagent_cpu_percent CPU usage of the agent process.");
    let _ = writeln!(out, "# TYPE probeagent_cpu_percent gauge");
    let _ = writeln!(out, "probeagent_cpu_percent {}", health.cpu_percent);
    let _ = writeln!(out, "# HELP probeagent_active_collectors Collectors with a live timer.");
    let _ = writeln!(out, "# TYPE probeagent_active_collectors gauge");
    let _ = writeln!(out, "probeagent_active_collectors {}", health.active_collectors);
    let _ = writeln!(out, "# HELP probeagent_buffer_size Results waiting for the next flush.");
    let _ = writeln!(out, "# TYPE probeagent_buffer_size gauge");
    let _ = writeln!(out, "probeagent_buffer_size {}", health.buffer_size);

    let _ = writeln!(out, "# HELP probeagent_storage_adapter_healthy Adapter connection state.");
    let _ = writeln!(out, "# TYPE probeagent_storage_adapter_healthy gauge");
    for (name, healthy) in &health.storage_adapters {
        let _ = writeln!(out, "probeagent_storage_adapter_healthy{{adapter=\"{}\"}} {}", name, u8::from(*healthy));
    }

    let _ = writeln!(out, "# HELP probeagent_collector_cycles_total Completed collection cycles.");
    let _ = writeln!(out, "# TYPE probeagent_collector_cycles_total counter");
    for c in &status.collectors {
        let _ = writeln!(out, "probeagent_collector_cycles_total{{collector=\"{}\"}} {}", c.name, c.cycles);
    }
    let _ = writeln!(out, "# HELP probeagent_collector_failures_total Failed probe results.");
    let _ = writeln!(out, "# TYPE probeagent_collector_failures_total counter");
    for c in &status.collectors {
        let _ = writeln!(
            out,
            "probeagent_collector_failures_total{{collector=\"{}\"}} {}",
            c.name, c.failures_total
        );
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
        .into_response()
}

pub async fn handle_not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" })))
}
