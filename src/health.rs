//! Liveness and readiness reporting for `GET /healthz`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::upstream::StorageServer;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Health {
    Ok,
    Degraded,
    Unhealthy,
}

/// Flat snapshot of what the proxy can currently do.
#[derive(Debug, Serialize)]
struct HealthReport {
    status: Health,
    upstreams_reachable: usize,
    upstreams_total: usize,
    cache_writable: bool,
}

/// Count upstreams that answer a HEAD on their listing at all.  Any HTTP
/// status counts as alive; only transport failures do not.
async fn reachable_upstreams(servers: &[Arc<dyn StorageServer>]) -> usize {
    let mut reachable = 0;
    for server in servers {
        if server.probe("/registries").await.is_ok() {
            reachable += 1;
        }
    }
    reachable
}

/// Readiness probe.  Degraded (still 200) while at least one upstream
/// answers; 503 once nothing can be fetched or the scratch directory
/// rejects writes.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let upstreams_total = state.servers.len();
    let upstreams_reachable = reachable_upstreams(&state.servers).await;
    // A scratch file that cannot be opened means no download can complete.
    let cache_writable = state.engine.store().temp_file().is_ok();

    let status = if !cache_writable || upstreams_reachable == 0 {
        Health::Unhealthy
    } else if upstreams_reachable < upstreams_total {
        Health::Degraded
    } else {
        Health::Ok
    };

    let code = if status == Health::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        code,
        Json(HealthReport {
            status,
            upstreams_reachable,
            upstreams_total,
            cache_writable,
        }),
    )
}
