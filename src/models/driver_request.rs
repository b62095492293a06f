use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::seen::SeenFlags;
use crate::status::JourneyStatus;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A driver's availability window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRequest {
    pub id: Uuid,
    pub driver_id: Uuid,
    pub vehicle_type_id: Uuid,
    pub location: GeoPoint,
    pub status: JourneyStatus,
    pub seen: SeenFlags,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DriverRequest {
    pub fn new(driver_id: Uuid, vehicle_type_id: Uuid, location: GeoPoint, status: JourneyStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            driver_id,
            vehicle_type_id,
            location,
            status,
            seen: SeenFlags::default(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.deleted_at.is_none() && self.status.is_open()
    }
}
