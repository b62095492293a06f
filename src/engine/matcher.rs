use crate::geo::BoundingBox;
use crate::models::driver_request::DriverRequest;
use crate::models::passenger_request::PassengerRequest;
use crate::status::JourneyStatus;
use crate::store::Transaction;

pub const DEFAULT_RADIUS_DEGREES: f64 = 0.01;

/// Proximity search between drivers and shipments. Picks the first
/// qualifying row in discovery order; there is no ranking beyond the filter.
#[derive(Debug, Clone, Copy)]
pub struct MatchFinder {
    radius_degrees: f64,
}

impl Default for MatchFinder {
    fn default() -> Self {
        Self::new(DEFAULT_RADIUS_DEGREES)
    }
}

impl MatchFinder {
    pub fn new(radius_degrees: f64) -> Self {
        Self { radius_degrees }
    }

    pub fn radius_degrees(&self) -> f64 {
        self.radius_degrees
    }

    /// Shipment filter for a searching driver, without the rejection lookup.
    pub fn shipment_qualifies(&self, driver: &DriverRequest, request: &PassengerRequest) -> bool {
        JourneyStatus::MATCHABLE.contains(&request.status)
            && request.vehicle_type_id == driver.vehicle_type_id
            && request.passenger_id != driver.driver_id
            && BoundingBox::around(&driver.location, self.radius_degrees).contains(&request.origin)
    }

    /// Driver filter for a searching shipment, without the rejection lookup.
    pub fn driver_qualifies(&self, request: &PassengerRequest, driver: &DriverRequest) -> bool {
        driver.status == JourneyStatus::Waiting
            && driver.deleted_at.is_none()
            && driver.vehicle_type_id == request.vehicle_type_id
            && driver.driver_id != request.passenger_id
            && BoundingBox::around(&request.origin, self.radius_degrees).contains(&driver.location)
    }

    /// First shipment `driver` may be offered. Passengers who rejected this
    /// driver before, and shipments the driver request already holds a
    /// decision on, are skipped.
    pub fn find_match(&self, tx: &dyn Transaction, driver: &DriverRequest) -> Option<PassengerRequest> {
        tx.find_passenger_requests(|request| self.shipment_qualifies(driver, request))
            .into_iter()
            .find(|request| {
                !tx.has_rejected(request.passenger_id, driver.driver_id)
                    && !tx.has_decision_between(driver.id, request.id)
            })
    }

    /// First waiting driver `request` may be offered to.
    pub fn find_driver(&self, tx: &dyn Transaction, request: &PassengerRequest) -> Option<DriverRequest> {
        tx.find_driver_requests(|driver| self.driver_qualifies(request, driver))
            .into_iter()
            .find(|driver| !tx.has_rejected(request.passenger_id, driver.driver_id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::MatchFinder;
    use crate::models::actor::ActorRole;
    use crate::models::driver_request::{DriverRequest, GeoPoint};
    use crate::models::passenger_request::{PassengerRequest, Shipment};
    use crate::models::seen::SeenFlags;
    use crate::status::JourneyStatus;

    fn truck() -> Uuid {
        Uuid::from_u128(1)
    }

    fn driver(lat: f64, lng: f64) -> DriverRequest {
        DriverRequest::new(Uuid::new_v4(), truck(), GeoPoint { lat, lng }, JourneyStatus::Waiting)
    }

    fn shipment(lat: f64, lng: f64, status: JourneyStatus) -> PassengerRequest {
        let passenger_id = Uuid::new_v4();
        PassengerRequest {
            id: Uuid::new_v4(),
            passenger_id,
            vehicle_type_id: truck(),
            origin: GeoPoint { lat, lng },
            destination: GeoPoint { lat: lat + 0.2, lng: lng + 0.2 },
            origin_label: "warehouse".to_string(),
            destination_label: "port".to_string(),
            shipment: Shipment {
                item: "cement".to_string(),
                quantity: 40,
                pickup_at: None,
                deliver_by: None,
                quoted_cost: Some(1200.0),
            },
            status,
            batch_id: None,
            created_by: passenger_id,
            creator_role: ActorRole::Passenger,
            seen: SeenFlags::default(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn nearby_waiting_shipment_with_same_vehicle_type_qualifies() {
        let finder = MatchFinder::default();
        let request = shipment(9.001, 38.741, JourneyStatus::Waiting);
        assert!(finder.shipment_qualifies(&driver(9.00, 38.74), &request));
    }

    #[test]
    fn shipments_already_bid_on_remain_discoverable() {
        let finder = MatchFinder::default();
        let near = driver(9.00, 38.74);
        assert!(finder.shipment_qualifies(&near, &shipment(9.0, 38.74, JourneyStatus::AcceptedByDriver)));
        assert!(!finder.shipment_qualifies(&near, &shipment(9.0, 38.74, JourneyStatus::AcceptedByPassenger)));
    }

    #[test]
    fn other_vehicle_type_is_skipped() {
        let finder = MatchFinder::default();
        let mut request = shipment(9.0, 38.74, JourneyStatus::Waiting);
        request.vehicle_type_id = Uuid::from_u128(2);
        assert!(!finder.shipment_qualifies(&driver(9.0, 38.74), &request));
    }

    #[test]
    fn far_shipment_is_skipped() {
        let finder = MatchFinder::default();
        let request = shipment(9.2, 38.74, JourneyStatus::Waiting);
        assert!(!finder.shipment_qualifies(&driver(9.0, 38.74), &request));
    }

    #[test]
    fn only_waiting_drivers_are_offered() {
        let finder = MatchFinder::default();
        let request = shipment(9.0, 38.74, JourneyStatus::Waiting);
        let mut busy = driver(9.0, 38.74);
        busy.status = JourneyStatus::Requested;
        assert!(finder.driver_qualifies(&request, &driver(9.0, 38.74)));
        assert!(!finder.driver_qualifies(&request, &busy));
    }

    #[test]
    fn a_driver_never_matches_their_own_shipment() {
        let finder = MatchFinder::default();
        let request = shipment(9.0, 38.74, JourneyStatus::Waiting);
        let mut own = driver(9.0, 38.74);
        own.driver_id = request.passenger_id;
        assert!(!finder.shipment_qualifies(&own, &request));
    }
}
