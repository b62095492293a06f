use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use chrono::Utc;
use uuid::Uuid;

use crate::api::rest::actor::CurrentActor;
use crate::api::rest::drivers::CancelRequest;
use crate::engine::cancellation::PassengerCancellation;
use crate::engine::lifecycle::{PassengerView, Placement};
use crate::error::AppError;
use crate::models::passenger_request::NewPassengerRequest;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/passenger-requests", post(create_passenger_request))
        .route("/passenger-requests/:id", get(poll_passenger_request))
        .route("/passenger-requests/:id/cancel", post(cancel_passenger_request))
}

async fn create_passenger_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<NewPassengerRequest>,
) -> Result<Json<Vec<Placement>>, AppError> {
    let placements = state.engine.create_passenger_request(actor, payload).await?;
    Ok(Json(placements))
}

async fn poll_passenger_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> Result<Json<PassengerView>, AppError> {
    let view = state
        .engine
        .poll_passenger_request(actor, id, Utc::now())
        .await?;
    Ok(Json(view))
}

async fn cancel_passenger_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<PassengerCancellation>, AppError> {
    let cancellation = state
        .engine
        .cancel_passenger_request(actor, id, payload.expected_status, payload.reason)
        .await?;
    Ok(Json(cancellation))
}
