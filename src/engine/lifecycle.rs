use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::engine::classifier::{PassengerReversion, passenger_reversion};
use crate::engine::{
    Committed, Engine, Pairing, ensure_driver_owns, ensure_in_step, ensure_passenger_owns,
    require_role, transition, validate_amount, validate_point,
};
use crate::error::AppError;
use crate::models::actor::{Actor, ActorRole};
use crate::models::decision::JourneyDecision;
use crate::models::driver_request::{DriverRequest, GeoPoint};
use crate::models::event::{EventType, LinkedIds, NotificationEvent};
use crate::models::journey::{Journey, JourneyRoutePoint};
use crate::models::passenger_request::{NewPassengerRequest, PassengerRequest, Shipment};
use crate::models::seen::SeenKind;
use crate::status::{JourneyStatus, Trigger, next_status};
use crate::store::{LinkedRecordSet, Transaction};

const MAX_VEHICLES_PER_BATCH: u32 = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterAvailability {
    pub location: GeoPoint,
    pub vehicle_type_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub driver_request: DriverRequest,
    pub pairing: Option<Pairing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub passenger_request: PassengerRequest,
    pub pairing: Option<Pairing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassengerView {
    pub passenger_request: PassengerRequest,
    pub decisions: Vec<JourneyDecision>,
    /// Set when an unanswered match closed the polled request and a fresh
    /// one took its place.
    pub replaced_request_id: Option<Uuid>,
}

/// A driver who already has the goods on board.
#[derive(Debug, Clone, Deserialize)]
pub struct StreetPickup {
    pub passenger_id: Uuid,
    pub vehicle_type_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    #[serde(default)]
    pub origin_label: String,
    #[serde(default)]
    pub destination_label: String,
    pub shipment: Shipment,
    pub fare: f64,
}

impl Engine {
    /// A driver announces availability. The new request is matched against
    /// waiting shipments in the same unit of work.
    pub async fn register_availability(
        &self,
        actor: Actor,
        command: RegisterAvailability,
    ) -> Result<Registration, AppError> {
        require_role(&actor, ActorRole::Driver)?;
        validate_point("location", &command.location)?;
        let matcher = self.matcher;

        self.transact("register_availability", self.settings.tx_timeout, move |tx| {
            if let Some(open) = tx.open_driver_request_for(actor.id) {
                return Err(AppError::Conflict(format!(
                    "driver {} already has open request {} ({})",
                    actor.id, open.id, open.status
                )));
            }

            let waiting = next_status(Trigger::AnnounceAvailability, None).ok_or_else(|| {
                AppError::Invariant("availability has no initial status".to_string())
            })?;
            let driver_request =
                DriverRequest::new(actor.id, command.vehicle_type_id, command.location, waiting);
            tx.insert_driver_request(driver_request.clone())?;

            let Some(passenger_request) = matcher.find_match(tx, &driver_request) else {
                debug!(driver_request_id = %driver_request.id, "no shipment in range");
                return Ok(Committed::new(Registration {
                    driver_request,
                    pairing: None,
                }));
            };

            let (pairing, events) = pair(tx, &driver_request, &passenger_request, actor.role)?;
            info!(
                decision_id = %pairing.decision.id,
                driver_request_id = %pairing.driver_request.id,
                passenger_request_id = %pairing.passenger_request.id,
                "driver matched"
            );
            Ok(Committed::new(Registration {
                driver_request: pairing.driver_request.clone(),
                pairing: Some(pairing),
            })
            .with_events(events))
        })
        .await
    }

    /// Places one shipment, or a batch of siblings when several vehicles are
    /// needed. Each request immediately looks for a waiting driver.
    pub async fn create_passenger_request(
        &self,
        actor: Actor,
        new: NewPassengerRequest,
    ) -> Result<Vec<Placement>, AppError> {
        let passenger_id = resolve_passenger(&actor, new.passenger_id)?;
        validate_point("origin", &new.origin)?;
        validate_point("destination", &new.destination)?;
        validate_shipment(&new.shipment)?;
        if new.vehicles_needed == 0 || new.vehicles_needed > MAX_VEHICLES_PER_BATCH {
            return Err(AppError::Validation(format!(
                "vehicles_needed must be between 1 and {MAX_VEHICLES_PER_BATCH}"
            )));
        }
        let matcher = self.matcher;

        self.transact("create_passenger_request", self.settings.tx_timeout, move |tx| {
            let batch_id = (new.vehicles_needed > 1).then(Uuid::new_v4);
            let mut placements = Vec::new();
            let mut events = Vec::new();

            for _ in 0..new.vehicles_needed {
                let request =
                    PassengerRequest::from_new(&new, passenger_id, &actor, JourneyStatus::Waiting, batch_id);
                tx.insert_passenger_request(request.clone())?;

                match matcher.find_driver(tx, &request) {
                    Some(driver_request) => {
                        let (pairing, mut paired_events) = pair(tx, &driver_request, &request, actor.role)?;
                        events.append(&mut paired_events);
                        placements.push(Placement {
                            passenger_request: pairing.passenger_request.clone(),
                            pairing: Some(pairing),
                        });
                    }
                    None => placements.push(Placement {
                        passenger_request: request,
                        pairing: None,
                    }),
                }
            }

            info!(
                passenger_id = %passenger_id,
                batch_id = ?batch_id,
                requests = placements.len(),
                "passenger requests placed"
            );
            Ok(Committed::new(placements).with_events(events))
        })
        .await
    }

    /// The passenger-side read. Stale unanswered matches are expired first,
    /// and a waiting request gets another driver search.
    pub async fn poll_passenger_request(
        &self,
        actor: Actor,
        passenger_request_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PassengerView, AppError> {
        let matcher = self.matcher;
        let cutoff = self.no_answer_cutoff(now)?;

        self.transact("poll_passenger_request", self.settings.tx_timeout, move |tx| {
            let request = tx.passenger_request(passenger_request_id)?;
            ensure_passenger_owns(&actor, &request)?;

            let mut events = Vec::new();
            let mut current = request.clone();
            let mut replaced_request_id = None;

            let stale: Vec<JourneyDecision> = tx
                .decisions_for_passenger(request.id)
                .into_iter()
                .filter(|decision| {
                    decision.status == JourneyStatus::Requested && decision.created_at <= cutoff
                })
                .collect();
            for decision in stale {
                let expiry = super::sweep::expire_decision(tx, &decision)?;
                events.extend(expiry.events);
                if let Some(fresh) = expiry.replacement {
                    replaced_request_id = Some(current.id);
                    current = fresh;
                }
            }

            current = tx.passenger_request(current.id)?;
            if current.status == JourneyStatus::Waiting {
                if let Some(driver_request) = matcher.find_driver(tx, &current) {
                    let (pairing, mut paired_events) = pair(tx, &driver_request, &current, actor.role)?;
                    events.append(&mut paired_events);
                    current = pairing.passenger_request;
                }
            }

            let decisions = tx.decisions_for_passenger(current.id);
            Ok(Committed::new(PassengerView {
                passenger_request: current,
                decisions,
                replaced_request_id,
            })
            .with_events(events))
        })
        .await
    }

    /// `requested -> acceptedByDriver`: the driver commits with a price.
    pub async fn bid(&self, actor: Actor, decision_id: Uuid, price: f64) -> Result<LinkedRecordSet, AppError> {
        require_role(&actor, ActorRole::Driver)?;
        validate_amount("price", price)?;
        let (from, to) = transition(Trigger::Bid)?;

        self.transact("bid", self.settings.tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_driver_owns(&actor, &driver_request)?;
            ensure_in_step(&decision, &driver_request)?;
            let passenger_request = tx.passenger_request(decision.passenger_request_id)?;

            let decision = tx.update_decision(decision.id, &[from], |row| {
                row.proposed_cost = Some(price);
                row.decide(to, actor.role);
            })?;
            // Later bidders find the shipment already at `to`.
            let passenger_request =
                tx.update_passenger_request(passenger_request.id, &[from, to], |row| row.status = to)?;
            tx.update_driver_request(driver_request.id, &[from], |row| row.status = to)?;

            let events = vec![NotificationEvent::new(
                EventType::BidReceived,
                passenger_request.passenger_id,
                to,
                LinkedIds::of_decision(&decision),
                actor.role,
            )];
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }

    /// `acceptedByDriver -> acceptedByPassenger`. Every other open bid on the
    /// shipment becomes `notSelectedInBid`; those drivers' requests are left
    /// as they are.
    pub async fn accept_bidder(&self, actor: Actor, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        let (from, to) = transition(Trigger::AcceptBidder)?;

        self.transact("accept_bidder", self.settings.wide_tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            let passenger_request = tx.passenger_request(decision.passenger_request_id)?;
            ensure_passenger_owns(&actor, &passenger_request)?;
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_in_step(&decision, &driver_request)?;

            let decision = tx.update_decision(decision.id, &[from], |row| row.decide(to, actor.role))?;

            let mut events = Vec::new();
            let siblings: Vec<JourneyDecision> = tx
                .decisions_for_passenger(passenger_request.id)
                .into_iter()
                .filter(|other| other.id != decision.id && other.status.is_open())
                .collect();
            for sibling in siblings {
                let sibling = tx.update_decision(sibling.id, &[sibling.status], |row| {
                    row.decide(JourneyStatus::NotSelectedInBid, actor.role);
                    row.seen.raise(SeenKind::NotSelected);
                })?;
                let loser = tx.driver_request(sibling.driver_request_id)?;
                events.push(NotificationEvent::new(
                    EventType::NotSelectedInBid,
                    loser.driver_id,
                    JourneyStatus::NotSelectedInBid,
                    LinkedIds::of_decision(&sibling),
                    actor.role,
                ));
            }

            tx.update_passenger_request(passenger_request.id, &[from], |row| row.status = to)?;
            tx.update_driver_request(driver_request.id, &[from], |row| row.status = to)?;

            events.insert(
                0,
                NotificationEvent::new(
                    EventType::BidAccepted,
                    driver_request.driver_id,
                    to,
                    LinkedIds::of_decision(&decision),
                    actor.role,
                ),
            );
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }

    /// The passenger turns a bidder down. The rejection is remembered and
    /// keeps this driver out of the passenger's future matches.
    pub async fn reject_bidder(&self, actor: Actor, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        self.transact("reject_bidder", self.settings.tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            let passenger_request = tx.passenger_request(decision.passenger_request_id)?;
            ensure_passenger_owns(&actor, &passenger_request)?;
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_in_step(&decision, &driver_request)?;
            if !decision.status.is_bid_stage() {
                return Err(AppError::Conflict(format!(
                    "decision {} is {}, only bids can be rejected",
                    decision.id, decision.status
                )));
            }

            let open_decisions = tx.count_open_decisions(passenger_request.id);
            let prior = decision.status;

            let decision = tx.update_decision(decision.id, &[prior], |row| {
                row.decide(JourneyStatus::RejectedByPassenger, actor.role);
                row.seen.raise(SeenKind::Rejection);
            })?;
            if passenger_reversion(open_decisions) == PassengerReversion::RevertToWaiting {
                tx.update_passenger_request(passenger_request.id, &[passenger_request.status], |row| {
                    row.status = JourneyStatus::Waiting;
                })?;
            }
            tx.update_driver_request(driver_request.id, &[prior], |row| {
                row.status = JourneyStatus::RejectedByPassenger;
                row.seen.raise(SeenKind::Rejection);
            })?;

            let events = vec![NotificationEvent::new(
                EventType::BidRejected,
                driver_request.driver_id,
                JourneyStatus::RejectedByPassenger,
                LinkedIds::of_decision(&decision),
                actor.role,
            )];
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }

    /// `acceptedByPassenger -> journeyStarted` at the pickup location. The
    /// journey row is created here if it does not exist yet.
    pub async fn start_journey(
        &self,
        actor: Actor,
        decision_id: Uuid,
        location: GeoPoint,
    ) -> Result<LinkedRecordSet, AppError> {
        require_role(&actor, ActorRole::Driver)?;
        validate_point("location", &location)?;
        let (from, to) = transition(Trigger::Start)?;

        self.transact("start_journey", self.settings.tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_driver_owns(&actor, &driver_request)?;
            ensure_in_step(&decision, &driver_request)?;

            let decision = tx.update_decision(decision.id, &[from], |row| row.decide(to, actor.role))?;
            let passenger_request =
                tx.update_passenger_request(decision.passenger_request_id, &[from], |row| row.status = to)?;
            tx.update_driver_request(driver_request.id, &[from], |row| {
                row.status = to;
                row.location = location;
            })?;
            let journey = match tx.journey_for_decision(decision.id) {
                Some(existing) => existing,
                None => {
                    let journey = Journey::started(decision.id, decision.proposed_cost);
                    tx.insert_journey(journey.clone())?;
                    journey
                }
            };
            tx.append_route_point(JourneyRoutePoint::new(decision.id, location))?;

            let events = vec![NotificationEvent::new(
                EventType::JourneyStarted,
                passenger_request.passenger_id,
                to,
                LinkedIds::of_decision(&decision).with_journey(Some(journey.id)),
                actor.role,
            )];
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }

    /// `journeyStarted -> journeyCompleted` at the drop-off location. Only
    /// updates the journey; a missing one means the chain is corrupt.
    pub async fn complete_journey(
        &self,
        actor: Actor,
        decision_id: Uuid,
        location: GeoPoint,
    ) -> Result<LinkedRecordSet, AppError> {
        require_role(&actor, ActorRole::Driver)?;
        validate_point("location", &location)?;
        let (from, to) = transition(Trigger::Complete)?;

        self.transact("complete_journey", self.settings.tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_driver_owns(&actor, &driver_request)?;
            ensure_in_step(&decision, &driver_request)?;
            let journey = tx.journey_for_decision(decision.id);

            // The status check runs first so a stale caller sees a conflict.
            let decision = tx.update_decision(decision.id, &[from], |row| row.decide(to, actor.role))?;
            let journey = journey.ok_or_else(|| {
                AppError::Invariant(format!("started decision {} has no journey", decision.id))
            })?;
            let passenger_request =
                tx.update_passenger_request(decision.passenger_request_id, &[from], |row| {
                    row.status = to;
                    row.seen.raise(SeenKind::Completion);
                })?;
            tx.update_driver_request(driver_request.id, &[from], |row| {
                row.status = to;
                row.location = location;
            })?;
            tx.update_journey(journey.id, &[from], |row| {
                row.status = to;
                row.ended_at = Some(Utc::now());
            })?;
            tx.append_route_point(JourneyRoutePoint::new(decision.id, location))?;

            let events = vec![NotificationEvent::new(
                EventType::JourneyCompleted,
                passenger_request.passenger_id,
                to,
                LinkedIds::of_decision(&decision).with_journey(Some(journey.id)),
                actor.role,
            )];
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }

    /// Appends a GPS sample while the driver is heading to or running the job.
    pub async fn record_route_point(
        &self,
        actor: Actor,
        decision_id: Uuid,
        location: GeoPoint,
    ) -> Result<JourneyRoutePoint, AppError> {
        require_role(&actor, ActorRole::Driver)?;
        validate_point("location", &location)?;

        self.transact("record_route_point", self.settings.tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_driver_owns(&actor, &driver_request)?;
            if !matches!(
                decision.status,
                JourneyStatus::AcceptedByPassenger | JourneyStatus::JourneyStarted
            ) {
                return Err(AppError::Conflict(format!(
                    "decision {} is {}, route points need an accepted or started journey",
                    decision.id, decision.status
                )));
            }
            let point = JourneyRoutePoint::new(decision.id, location);
            tx.append_route_point(point.clone())?;
            Ok(Committed::new(point))
        })
        .await
    }

    /// Creates the whole chain directly at `journeyStarted`.
    pub async fn street_pickup(&self, actor: Actor, pickup: StreetPickup) -> Result<LinkedRecordSet, AppError> {
        require_role(&actor, ActorRole::Driver)?;
        validate_point("origin", &pickup.origin)?;
        validate_point("destination", &pickup.destination)?;
        validate_shipment(&pickup.shipment)?;
        validate_amount("fare", pickup.fare)?;
        if pickup.passenger_id == actor.id {
            return Err(AppError::Validation(
                "a driver cannot pick up their own shipment".to_string(),
            ));
        }

        self.transact("street_pickup", self.settings.tx_timeout, move |tx| {
            if let Some(open) = tx.open_driver_request_for(actor.id) {
                return Err(AppError::Conflict(format!(
                    "driver {} already has open request {} ({})",
                    actor.id, open.id, open.status
                )));
            }

            let started = JourneyStatus::JourneyStarted;
            let new = NewPassengerRequest {
                passenger_id: Some(pickup.passenger_id),
                vehicle_type_id: pickup.vehicle_type_id,
                origin: pickup.origin,
                destination: pickup.destination,
                origin_label: pickup.origin_label,
                destination_label: pickup.destination_label,
                shipment: pickup.shipment,
                vehicles_needed: 1,
            };
            let passenger_request =
                PassengerRequest::from_new(&new, pickup.passenger_id, &actor, started, None);
            let driver_request =
                DriverRequest::new(actor.id, pickup.vehicle_type_id, pickup.origin, started);
            let mut decision = JourneyDecision::new(driver_request.id, passenger_request.id, started);
            decision.proposed_cost = Some(pickup.fare);
            decision.decide(started, actor.role);
            let journey = Journey::started(decision.id, Some(pickup.fare));

            tx.insert_decision(decision.clone())?;
            tx.insert_passenger_request(passenger_request.clone())?;
            tx.insert_driver_request(driver_request)?;
            tx.insert_journey(journey.clone())?;
            tx.append_route_point(JourneyRoutePoint::new(decision.id, pickup.origin))?;

            info!(decision_id = %decision.id, driver_id = %actor.id, "street pickup started");
            let events = vec![NotificationEvent::new(
                EventType::JourneyStarted,
                passenger_request.passenger_id,
                started,
                LinkedIds::of_decision(&decision).with_journey(Some(journey.id)),
                actor.role,
            )];
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }
}

/// `waiting -> requested`: creates the decision and moves both sides. A
/// shipment already in its bid stage keeps its status.
pub(crate) fn pair(
    tx: &mut dyn Transaction,
    driver_request: &DriverRequest,
    passenger_request: &PassengerRequest,
    actor_role: ActorRole,
) -> Result<(Pairing, Vec<NotificationEvent>), AppError> {
    let (from, to) = transition(Trigger::Match)?;

    let decision = JourneyDecision::new(driver_request.id, passenger_request.id, to);
    tx.insert_decision(decision.clone())?;
    let passenger_request = if passenger_request.status == from {
        tx.update_passenger_request(passenger_request.id, &[from], |row| row.status = to)?
    } else {
        passenger_request.clone()
    };
    let driver_request = tx.update_driver_request(driver_request.id, &[from], |row| row.status = to)?;

    let linked = LinkedIds::of_decision(&decision);
    let events = vec![
        NotificationEvent::new(EventType::Matched, driver_request.driver_id, to, linked.clone(), actor_role),
        NotificationEvent::new(EventType::Matched, passenger_request.passenger_id, to, linked, actor_role),
    ];
    Ok((
        Pairing {
            decision,
            driver_request,
            passenger_request,
        },
        events,
    ))
}

fn resolve_passenger(actor: &Actor, requested: Option<Uuid>) -> Result<Uuid, AppError> {
    match (actor.role, requested) {
        (ActorRole::Passenger, None) => Ok(actor.id),
        (ActorRole::Passenger, Some(id)) if id == actor.id => Ok(id),
        (ActorRole::Passenger, Some(_)) => Err(AppError::Ownership(
            "passengers can only place their own requests".to_string(),
        )),
        (_, Some(id)) => Ok(id),
        (_, None) => Err(AppError::Validation(
            "passenger_id is required when placing a request on someone's behalf".to_string(),
        )),
    }
}

fn validate_shipment(shipment: &Shipment) -> Result<(), AppError> {
    if shipment.item.trim().is_empty() {
        return Err(AppError::Validation("shipment item cannot be empty".to_string()));
    }
    if shipment.quantity == 0 {
        return Err(AppError::Validation("shipment quantity must be > 0".to_string()));
    }
    if let Some(cost) = shipment.quoted_cost {
        if !cost.is_finite() || cost < 0.0 {
            return Err(AppError::Validation("quoted cost cannot be negative".to_string()));
        }
    }
    if let (Some(pickup), Some(deadline)) = (shipment.pickup_at, shipment.deliver_by) {
        if deadline < pickup {
            return Err(AppError::Validation(
                "delivery deadline precedes pickup".to_string(),
            ));
        }
    }
    Ok(())
}
