use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::rest::actor::CurrentActor;
use crate::error::AppError;
use crate::models::driver_request::GeoPoint;
use crate::models::journey::JourneyRoutePoint;
use crate::state::AppState;
use crate::store::LinkedRecordSet;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/decisions/:id", get(get_decision))
        .route("/decisions/:id/bid", post(bid))
        .route("/decisions/:id/accept", post(accept))
        .route("/decisions/:id/reject", post(reject))
        .route("/decisions/:id/start", post(start))
        .route("/decisions/:id/complete", post(complete))
        .route("/decisions/:id/route-points", post(route_point))
}

#[derive(Deserialize)]
pub struct BidRequest {
    pub price: f64,
}

#[derive(Deserialize)]
pub struct LocationRequest {
    pub location: GeoPoint,
}

async fn get_decision(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.linked_records(actor, id).await?))
}

async fn bid(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    Json(payload): Json<BidRequest>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.bid(actor, id, payload.price).await?))
}

async fn accept(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.accept_bidder(actor, id).await?))
}

async fn reject(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.reject_bidder(actor, id).await?))
}

async fn start(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.start_journey(actor, id, payload.location).await?))
}

async fn complete(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.complete_journey(actor, id, payload.location).await?))
}

async fn route_point(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
    Json(payload): Json<LocationRequest>,
) -> Result<Json<JourneyRoutePoint>, AppError> {
    Ok(Json(
        state.engine.record_route_point(actor, id, payload.location).await?,
    ))
}
