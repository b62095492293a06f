use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::get;

use crate::api::rest::actor::CurrentActor;
use crate::error::AppError;
use crate::models::event::NotificationEvent;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/notifications", get(drain_notifications))
}

/// Pending events for the caller, oldest first. Each event is returned once.
async fn drain_notifications(
    State(state): State<Arc<AppState>>,
    CurrentActor(actor): CurrentActor,
) -> Result<Json<Vec<NotificationEvent>>, AppError> {
    Ok(Json(state.dispatcher.drain_inbox(actor.id)))
}
