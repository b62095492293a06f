use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::actor::{Actor, ActorRole};
use crate::models::driver_request::GeoPoint;
use crate::models::seen::SeenFlags;
use crate::status::JourneyStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub item: String,
    pub quantity: u32,
    pub pickup_at: Option<DateTime<Utc>>,
    pub deliver_by: Option<DateTime<Utc>>,
    pub quoted_cost: Option<f64>,
}

fn one() -> u32 {
    1
}

/// Input for placing a shipment. `passenger_id` is required when an admin
/// or driver places it on a shipper's behalf.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPassengerRequest {
    #[serde(default)]
    pub passenger_id: Option<Uuid>,
    pub vehicle_type_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    #[serde(default)]
    pub origin_label: String,
    #[serde(default)]
    pub destination_label: String,
    pub shipment: Shipment,
    #[serde(default = "one")]
    pub vehicles_needed: u32,
}

/// One shipment request. Sibling requests needing several vehicles share a
/// `batch_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerRequest {
    pub id: Uuid,
    pub passenger_id: Uuid,
    pub vehicle_type_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub origin_label: String,
    pub destination_label: String,
    pub shipment: Shipment,
    pub status: JourneyStatus,
    pub batch_id: Option<Uuid>,
    pub created_by: Uuid,
    pub creator_role: ActorRole,
    pub seen: SeenFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PassengerRequest {
    pub fn from_new(
        new: &NewPassengerRequest,
        passenger_id: Uuid,
        creator: &Actor,
        status: JourneyStatus,
        batch_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            passenger_id,
            vehicle_type_id: new.vehicle_type_id,
            origin: new.origin,
            destination: new.destination,
            origin_label: new.origin_label.clone(),
            destination_label: new.destination_label.clone(),
            shipment: new.shipment.clone(),
            status,
            batch_id,
            created_by: creator.id,
            creator_role: creator.role,
            seen: SeenFlags::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh `waiting` copy for a new match episode.
    pub fn reopened(&self) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: JourneyStatus::Waiting,
            seen: SeenFlags::default(),
            created_at: now,
            updated_at: now,
            ..self.clone()
        }
    }
}
