use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::actor::ActorRole;
use crate::models::seen::SeenFlags;
use crate::status::JourneyStatus;

/// Pairs one driver request with one passenger request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyDecision {
    pub id: Uuid,
    pub driver_request_id: Uuid,
    pub passenger_request_id: Uuid,
    pub status: JourneyStatus,
    pub proposed_cost: Option<f64>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<ActorRole>,
    pub seen: SeenFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JourneyDecision {
    pub fn new(driver_request_id: Uuid, passenger_request_id: Uuid, status: JourneyStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            driver_request_id,
            passenger_request_id,
            status,
            proposed_cost: None,
            decided_at: None,
            decided_by: None,
            seen: SeenFlags::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn decide(&mut self, status: JourneyStatus, role: ActorRole) {
        let now = Utc::now();
        self.status = status;
        self.decided_at = Some(now);
        self.decided_by = Some(role);
        self.updated_at = now;
    }
}
