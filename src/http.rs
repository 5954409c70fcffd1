//! HTTP trigger surface.
//!
//! `POST /api/sync/push` and `POST /api/sync/pull` run one direction each and
//! answer with a single message; `GET /api/sync/status` reports the state of
//! the most recent run.

use crate::error::Error;
use crate::metrics::MetricsSnapshot;
use crate::sync::{Direction, RunState, SyncService};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Body of every trigger response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageBody {
    /// Human-readable outcome
    pub message: String,
}

/// Body of `GET /api/sync/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBody {
    /// State of the most recent run
    pub state: RunState,
    /// Run counters since the service started
    pub metrics: MetricsSnapshot,
}

/// Router with the sync routes bound to `service`.
pub fn build_router(service: Arc<SyncService>) -> Router {
    Router::new()
        .route("/api/sync/push", post(push))
        .route("/api/sync/pull", post(pull))
        .route("/api/sync/status", get(status))
        .with_state(service)
}

async fn push(State(service): State<Arc<SyncService>>) -> (StatusCode, Json<MessageBody>) {
    trigger(&service, Direction::Push).await
}

async fn pull(State(service): State<Arc<SyncService>>) -> (StatusCode, Json<MessageBody>) {
    trigger(&service, Direction::Pull).await
}

async fn status(State(service): State<Arc<SyncService>>) -> Json<StatusBody> {
    Json(StatusBody {
        state: service.state(),
        metrics: service.metrics(),
    })
}

async fn trigger(service: &SyncService, direction: Direction) -> (StatusCode, Json<MessageBody>) {
    let (code, message) = match service.run(direction).await {
        Ok(report) => {
            info!(run_id = %report.run_id, "{} request completed", direction);
            (StatusCode::OK, direction.success_message().to_string())
        }
        Err(Error::Busy) => (
            StatusCode::CONFLICT,
            "⏳ A sync run is already in progress".to_string(),
        ),
        Err(e) => {
            error!("{} request failed: {}", direction, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                direction.failure_message().to_string(),
            )
        }
    };
    (code, Json(MessageBody { message }))
}
