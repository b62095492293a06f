use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::actor::ActorRole;
use crate::models::decision::JourneyDecision;
use crate::status::JourneyStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventType {
    Matched,
    BidReceived,
    BidAccepted,
    NotSelectedInBid,
    BidRejected,
    JourneyStarted,
    JourneyCompleted,
    CompletedByAdmin,
    CancelledByDriver,
    CancelledByPassenger,
    CancelledByAdmin,
    CancelledBySystem,
    NoAnswerFromDriver,
    SearchRestarted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkedIds {
    pub passenger_request_id: Option<Uuid>,
    pub driver_request_id: Option<Uuid>,
    pub decision_id: Option<Uuid>,
    pub journey_id: Option<Uuid>,
}

impl LinkedIds {
    pub fn of_decision(decision: &JourneyDecision) -> Self {
        Self {
            passenger_request_id: Some(decision.passenger_request_id),
            driver_request_id: Some(decision.driver_request_id),
            decision_id: Some(decision.id),
            journey_id: None,
        }
    }

    pub fn with_journey(mut self, journey_id: Option<Uuid>) -> Self {
        self.journey_id = journey_id;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub status_code: i16,
    pub linked_ids: LinkedIds,
    pub actor_role: ActorRole,
}

/// Handed to the notification dispatcher after a transition commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub event_type: EventType,
    pub recipient_user_id: Uuid,
    pub payload: EventPayload,
}

impl NotificationEvent {
    pub fn new(
        event_type: EventType,
        recipient_user_id: Uuid,
        status: JourneyStatus,
        linked_ids: LinkedIds,
        actor_role: ActorRole,
    ) -> Self {
        Self {
            event_type,
            recipient_user_id,
            payload: EventPayload {
                status_code: status.code(),
                linked_ids,
                actor_role,
            },
        }
    }
}
