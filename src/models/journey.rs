use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver_request::GeoPoint;
use crate::status::JourneyStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Journey {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub status: JourneyStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub fare: Option<f64>,
}

impl Journey {
    pub fn started(decision_id: Uuid, fare: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision_id,
            status: JourneyStatus::JourneyStarted,
            started_at: Utc::now(),
            ended_at: None,
            fare,
        }
    }
}

/// Append-only GPS sample. Keyed by decision so samples can precede the
/// journey row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyRoutePoint {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub location: GeoPoint,
    pub recorded_at: DateTime<Utc>,
}

impl JourneyRoutePoint {
    pub fn new(decision_id: Uuid, location: GeoPoint) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision_id,
            location,
            recorded_at: Utc::now(),
        }
    }
}
