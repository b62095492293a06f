use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{delete, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::actor::CurrentActor;
use crate::engine::cancellation::DriverCancellation;
use crate::engine::lifecycle::{RegisterAvailability, Registration, StreetPickup};
use crate::error::AppError;
use crate::models::driver_request::DriverRequest;
use crate::state::AppState;
use crate::status::JourneyStatus;
use crate::store::LinkedRecordSet;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/driver-requests", post(register_availability))
        .route("/driver-requests/:id", delete(delete_driver_request))
        .route("/driver-requests/:id/cancel", post(cancel_driver_request))
        .route("/street-pickups", post(street_pickup))
}

/// The status the caller last saw; a stale value is refused as a conflict.
#[derive(Deserialize)]
pub struct CancelRequest {
    pub expected_status: JourneyStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

async fn register_availability(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<RegisterAvailability>,
) -> Result<Json<Registration>, AppError> {
    let registration = state.engine.register_availability(actor, payload).await?;
    Ok(Json(registration))
}

async fn cancel_driver_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<DriverCancellation>, AppError> {
    let cancellation = state
        .engine
        .cancel_driver_request(actor, id, payload.expected_status, payload.reason)
        .await?;
    Ok(Json(cancellation))
}

async fn delete_driver_request(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> Result<Json<DriverRequest>, AppError> {
    Ok(Json(state.engine.delete_driver_request(actor, id).await?))
}

async fn street_pickup(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<StreetPickup>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.street_pickup(actor, payload).await?))
}
