// Copyright 2026 Tagwatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP API for the crawl service.
//!
//! Starts and stops runs, reports run status, triggers retry processing and
//! streams progress as Server-Sent Events.

use crate::model::Target;
use crate::orchestrator::Orchestrator;
use crate::pool::BrowserPool;
use crate::progress::ProgressSender;
use crate::retry::RetryQueue;
use crate::store::Store;
use crate::targets::TargetSource;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};

/// Everything the handlers need.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub retry_queue: Arc<RetryQueue>,
    pub targets: Arc<dyn TargetSource>,
    pub store: Arc<Store>,
    pub pool: Arc<BrowserPool>,
    pub progress: ProgressSender,
    pub started_at: Instant,
}

/// Build the axum Router with all endpoints.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/runs", get(list_runs).post(start_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/stop", post(stop_run))
        .route("/api/v1/retry-queue/process", post(process_retry_queue))
        .route("/api/v1/progress", get(progress_sse))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` resolves.
pub async fn start(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!("HTTP API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────

fn error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    let body = json!({ "error": { "code": code, "message": message.into() } });
    (status, Json(body)).into_response()
}

fn internal(e: impl std::fmt::Display) -> Response {
    tracing::error!("request failed: {e}");
    error(StatusCode::INTERNAL_SERVER_ERROR, "E_INTERNAL", e.to_string())
}

/// Narrow `active` to the requested IDs, preserving order. Unknown IDs are
/// returned separately.
fn select_targets(active: Vec<Target>, wanted: Option<&[String]>) -> (Vec<Target>, Vec<String>) {
    let Some(wanted) = wanted else {
        return (active, Vec::new());
    };
    let unknown = wanted
        .iter()
        .filter(|id| !active.iter().any(|t| &t.id == *id))
        .cloned()
        .collect();
    let selected = active
        .into_iter()
        .filter(|t| wanted.contains(&t.id))
        .collect();
    (selected, unknown)
}

// ── Handlers ────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs_f64(),
        "pool": {
            "size": state.pool.size(),
            "available": state.pool.available_count(),
        },
        "live_runs": state.orchestrator.live_runs(),
    }))
}

#[derive(Debug, Default, Deserialize)]
struct StartRunBody {
    /// Restrict the run to these target IDs.
    target_ids: Option<Vec<String>>,
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StartRunBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let active = match state.targets.active_targets().await {
        Ok(targets) => targets,
        Err(e) => return internal(format!("{e:#}")),
    };
    let (targets, unknown) = select_targets(active, body.target_ids.as_deref());
    if !unknown.is_empty() {
        return error(
            StatusCode::BAD_REQUEST,
            "E_UNKNOWN_TARGET",
            format!("unknown or inactive targets: {}", unknown.join(", ")),
        );
    }
    if targets.is_empty() {
        return error(StatusCode::BAD_REQUEST, "E_NO_TARGETS", "no active targets");
    }
    let planned = targets.len();
    match state.orchestrator.start_run(targets) {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(json!({ "run_id": run_id, "planned": planned })),
        )
            .into_response(),
        Err(e) => internal(e),
    }
}

async fn stop_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if state.orchestrator.stop(&id) {
        return Json(json!({ "run_id": id, "stopping": true })).into_response();
    }
    match state.store.get_run(&id) {
        Ok(Some(run)) if run.status.is_terminal() => error(
            StatusCode::CONFLICT,
            "E_NOT_RUNNING",
            format!("run {id} is {}", run.status),
        ),
        // Still `running` in the store but owned by another process
        Ok(Some(_)) => error(
            StatusCode::CONFLICT,
            "E_NOT_OWNED",
            format!("run {id} is not executing in this process"),
        ),
        Ok(None) => error(StatusCode::NOT_FOUND, "E_NOT_FOUND", format!("run {id} not found")),
        Err(e) => internal(e),
    }
}

async fn get_run(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let run = match state.store.get_run(&id) {
        Ok(Some(run)) => run,
        Ok(None) => {
            return error(StatusCode::NOT_FOUND, "E_NOT_FOUND", format!("run {id} not found"))
        }
        Err(e) => return internal(e),
    };
    let results = match state.store.authoritative_results(&id) {
        Ok(results) => results,
        Err(e) => return internal(e),
    };
    let retries = match state.store.retries_for_run(&id) {
        Ok(retries) => retries,
        Err(e) => return internal(e),
    };
    Json(json!({
        "run": run,
        "live": state.orchestrator.is_live(&id),
        "results": results,
        "retries": retries,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Response {
    let limit = params.limit.unwrap_or(20).clamp(1, 500);
    match state.store.list_runs(limit) {
        Ok(runs) => Json(json!({ "runs": runs })).into_response(),
        Err(e) => internal(e),
    }
}

async fn process_retry_queue(State(state): State<Arc<AppState>>) -> Response {
    match state.retry_queue.process_queue().await {
        Ok(report) => Json(report).into_response(),
        Err(e) => internal(e),
    }
}

/// SSE query parameters.
#[derive(Debug, Default, Deserialize)]
struct ProgressParams {
    run_id: Option<String>,
}

/// Streams progress events, optionally filtered by `?run_id=`.
async fn progress_sse(
    Query(params): Query<ProgressParams>,
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.progress.subscribe();
    let run_filter = params.run_id;

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(ref run_id) = run_filter {
                        if &event.run_id != run_id {
                            continue;
                        }
                    }
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().data(json));
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress subscriber lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
