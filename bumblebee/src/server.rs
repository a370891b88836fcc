//! Application-server boundary
//!
//! The web application's own request handling lives outside this crate;
//! what belongs here is the contract the orchestrator owes it: start only
//! once the migration gate has succeeded and both stateful dependencies
//! are ready, expose liveness/readiness, and surface the dead-letter
//! queue for inspection. Business code offloads asynchronous work by
//! enqueueing onto the shared job queue.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::error::Result;
use crate::queue::{DeadLetter, JobQueue};
use crate::readiness::HealthProbe;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    queue: Arc<dyn JobQueue>,
    probes: Arc<Vec<Box<dyn HealthProbe>>>,
}

impl AppState {
    /// Bundle the queue and the dependency probes.
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, probes: Vec<Box<dyn HealthProbe>>) -> Self {
        Self {
            queue,
            probes: Arc::new(probes),
        }
    }
}

/// Build the boundary router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/admin/dead-letters", get(dead_letters))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until shutdown.
///
/// # Errors
///
/// Bind or accept-loop failures.
pub async fn serve(state: AppState, bind: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "application server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("application server stopped");
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failing: Vec<String>,
}

/// Live probe fan-out over the stateful dependencies.
async fn readyz(State(state): State<AppState>) -> Response {
    let mut failing = Vec::new();
    for probe in state.probes.iter() {
        if let Err(err) = probe.check().await {
            tracing::debug!(dependency = probe.name(), error = %err, "readiness probe failed");
            failing.push(probe.name().to_string());
        }
    }
    if failing.is_empty() {
        Json(ReadyResponse {
            status: "ready",
            failing,
        })
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "unready",
                failing,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct DeadLetterListResponse {
    total: usize,
    jobs: Vec<DeadLetter>,
}

/// Read-only listing of jobs that exhausted their retry budget, including
/// the original payload and the recorded failure history.
async fn dead_letters(State(state): State<AppState>) -> Response {
    match state.queue.dead_letters().await {
        Ok(jobs) => Json(DeadLetterListResponse {
            total: jobs.len(),
            jobs,
        })
        .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "dead-letter listing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
