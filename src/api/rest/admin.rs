use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::rest::actor::CurrentActor;
use crate::error::AppError;
use crate::models::seen::{SeenKind, SeenState};
use crate::state::AppState;
use crate::store::{LinkedRecordSet, SeenTarget};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/decisions/:id/complete", post(complete_by_admin))
        .route("/seen", post(acknowledge))
}

#[derive(Deserialize)]
pub struct AcknowledgeRequest {
    pub target: SeenTarget,
    pub kind: SeenKind,
}

#[derive(Serialize)]
pub struct AcknowledgeResponse {
    pub target: SeenTarget,
    pub kind: SeenKind,
    pub state: SeenState,
}

async fn complete_by_admin(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Path(id): Path<Uuid>,
) -> Result<Json<LinkedRecordSet>, AppError> {
    Ok(Json(state.engine.complete_by_admin(actor, id).await?))
}

async fn acknowledge(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
    Json(payload): Json<AcknowledgeRequest>,
) -> Result<Json<AcknowledgeResponse>, AppError> {
    let seen = state
        .engine
        .acknowledge(actor, payload.target, payload.kind)
        .await?;
    Ok(Json(AcknowledgeResponse {
        target: payload.target,
        kind: payload.kind,
        state: seen,
    }))
}
