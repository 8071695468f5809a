//! Main axum router and HTTP request handlers for the caching proxy.
//!
//! Routes:
//! - `GET /registries`                    - Consolidated registry listing
//! - `GET /registry/{uuid}/{hash}`        - Registry snapshot
//! - `GET /package/{uuid}/{hash}`         - Package tarball
//! - `GET /artifact/{hash}`               - Binary artifact
//! - `GET /healthz`                       - Health check
//! - `GET /metrics`                       - Prometheus metrics
//!
//! The four resource shapes are matched by the classifier on the raw request
//! target, so they are handled by the router fallback rather than individual
//! routes; anything else is a 404.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::resource::{classify, ResourceKind};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Assemble the router: explicit routes for health and metrics, the
/// classifying fallback for everything else.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .fallback(handle_resource)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Front door
// ---------------------------------------------------------------------------

/// Classify the raw request target, read the resource through the fetch
/// engine, and stream the cached file back.  Every rejection is a plain 404;
/// only `GET` is meaningful for this proxy.
async fn handle_resource(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
) -> Response {
    if method != Method::GET {
        return StatusCode::NOT_FOUND.into_response();
    }

    // Classify the full target: a query string or trailing slash makes it
    // unservable.
    let target = uri
        .path_and_query()
        .map(|target| target.as_str())
        .unwrap_or_else(|| uri.path());

    match classify(target) {
        None => {
            debug!(target, "rejected unservable target");
            StatusCode::NOT_FOUND.into_response()
        }
        // The listing is published locally by the convergence loop and is
        // never fetched from an upstream.
        Some(ResourceKind::Listing) => {
            stream_file(state.engine.store().listing_path(), "text/plain").await
        }
        Some(_) => {
            let constrained = state.converger.servers_for(target);
            match state.engine.fetch(target, constrained.as_deref()).await {
                Some(path) => stream_file(path, "application/octet-stream").await,
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
    }
}

/// Stream a cache file as the response body.
async fn stream_file(path: PathBuf, content_type: &'static str) -> Response {
    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            let stream = ReaderStream::new(file);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, content_type)],
                Body::from_stream(stream),
            )
                .into_response()
        }
        Err(error) => {
            warn!(path = %path.display(), error = %error, "cache file not readable");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(error) => {
            warn!(error = %error, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
