pub mod cancellation;
pub mod classifier;
pub mod lifecycle;
pub mod matcher;
pub mod sweep;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::actor::{Actor, ActorRole};
use crate::models::decision::JourneyDecision;
use crate::models::driver_request::{DriverRequest, GeoPoint};
use crate::models::event::NotificationEvent;
use crate::models::passenger_request::PassengerRequest;
use crate::models::seen::{SeenKind, SeenState};
use crate::notify::NotificationDispatcher;
use crate::notify::audit::{CancellationAudit, CancellationRecord};
use crate::observability::metrics::Metrics;
use crate::status::{JourneyStatus, Trigger, next_status, required_status};
use crate::store::{LinkedRecordSet, RecordStore, SeenTarget, Transaction, UnitOfWork};

use self::matcher::MatchFinder;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub match_radius_degrees: f64,
    pub no_answer_timeout: chrono::Duration,
    /// Operations touching one linked-record set.
    pub tx_timeout: Duration,
    /// Operations fanning out over every bidder of a passenger request.
    pub wide_tx_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            match_radius_degrees: matcher::DEFAULT_RADIUS_DEGREES,
            no_answer_timeout: chrono::Duration::seconds(300),
            tx_timeout: Duration::from_secs(10),
            wide_tx_timeout: Duration::from_secs(30),
        }
    }
}

/// What a unit of work hands back: its result plus the side effects that
/// may only run once the writes are durable.
pub(crate) struct Committed<T> {
    value: T,
    events: Vec<NotificationEvent>,
    audit: Option<CancellationRecord>,
}

impl<T> Committed<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value,
            events: Vec::new(),
            audit: None,
        }
    }

    pub(crate) fn with_events(mut self, events: Vec<NotificationEvent>) -> Self {
        self.events = events;
        self
    }

    pub(crate) fn with_audit(mut self, record: CancellationRecord) -> Self {
        self.audit = Some(record);
        self
    }
}

/// A freshly paired driver and shipment.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Pairing {
    pub decision: JourneyDecision,
    pub driver_request: DriverRequest,
    pub passenger_request: PassengerRequest,
}

/// The status transition engine. Every multi-record change runs as one unit
/// of work on the store; notifications and audit records go out after commit.
pub struct Engine {
    store: Arc<dyn RecordStore>,
    matcher: MatchFinder,
    dispatcher: Arc<dyn NotificationDispatcher>,
    audit: Arc<dyn CancellationAudit>,
    settings: EngineSettings,
    metrics: Metrics,
}

impl Engine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        audit: Arc<dyn CancellationAudit>,
        settings: EngineSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            matcher: MatchFinder::new(settings.match_radius_degrees),
            dispatcher,
            audit,
            settings,
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) async fn transact<T, F>(
        &self,
        op: &'static str,
        timeout: Duration,
        work: F,
    ) -> Result<T, AppError>
    where
        T: Send,
        F: FnOnce(&mut dyn Transaction) -> Result<Committed<T>, AppError> + Send,
    {
        let start = Instant::now();
        let mut output = None;
        let unit: UnitOfWork<'_> = Box::new(|tx| {
            output = Some(work(tx)?);
            Ok(())
        });
        let outcome = self.store.transact(op, timeout, unit).await;
        let result = outcome.and_then(|()| {
            output.take().ok_or_else(|| {
                AppError::Internal(format!("{op}: unit of work committed without a result"))
            })
        });
        let elapsed = start.elapsed().as_secs_f64();

        match result {
            Ok(committed) => {
                self.metrics.record_transition(op, "committed", elapsed);
                info!(op, events = committed.events.len(), "transition committed");
                self.publish(&committed.events);
                if let Some(record) = committed.audit {
                    if let Err(err) = self.audit.record(record) {
                        warn!(op, error = %err, "failed to append cancellation audit record");
                    }
                }
                Ok(committed.value)
            }
            Err(err) => {
                self.metrics.record_transition(op, err.kind(), elapsed);
                Err(err)
            }
        }
    }

    fn publish(&self, events: &[NotificationEvent]) {
        for event in events {
            match self.dispatcher.dispatch(event) {
                Ok(()) => {
                    self.metrics
                        .notifications_total
                        .with_label_values(&["delivered"])
                        .inc();
                }
                Err(err) => {
                    self.metrics
                        .notifications_total
                        .with_label_values(&["failed"])
                        .inc();
                    warn!(
                        recipient = %event.recipient_user_id,
                        event_type = ?event.event_type,
                        error = %err,
                        "notification dropped"
                    );
                }
            }
        }
    }

    /// Oldest creation time a `requested` decision may have and still be
    /// waiting on its driver.
    pub(crate) fn no_answer_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AppError> {
        now.checked_sub_signed(self.settings.no_answer_timeout)
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "no-answer timeout {} reaches past the supported time range",
                    self.settings.no_answer_timeout
                ))
            })
    }

    /// Read of one linked-record set, for either party or staff.
    pub async fn linked_records(&self, actor: Actor, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        let records = self.store().linked_records(decision_id).await?;
        let involved = records.driver_request.driver_id == actor.id
            || records.passenger_request.passenger_id == actor.id;
        if !involved && !actor.is_staff() {
            return Err(AppError::Ownership(format!(
                "actor {} is not part of decision {decision_id}",
                actor.id
            )));
        }
        Ok(records)
    }

    /// Marks a notification as seen. Single-row write, so no transaction.
    pub async fn acknowledge(&self, actor: Actor, target: SeenTarget, kind: SeenKind) -> Result<SeenState, AppError> {
        let store = self.store();
        let owner = match target {
            SeenTarget::PassengerRequest(id) => store.passenger_request(id).await?.passenger_id,
            SeenTarget::DriverRequest(id) => store.driver_request(id).await?.driver_id,
            SeenTarget::Decision(id) => {
                let decision = store.decision(id).await?;
                store.driver_request(decision.driver_request_id).await?.driver_id
            }
        };
        if owner != actor.id && !actor.is_staff() {
            return Err(AppError::Ownership(format!(
                "actor {} cannot acknowledge {target:?}",
                actor.id
            )));
        }
        store.acknowledge(target, kind).await
    }
}

pub(crate) fn require_role(actor: &Actor, role: ActorRole) -> Result<(), AppError> {
    if actor.role != role {
        return Err(AppError::Ownership(format!(
            "{:?} actors cannot perform this action",
            actor.role
        )));
    }
    Ok(())
}

pub(crate) fn ensure_driver_owns(actor: &Actor, driver_request: &DriverRequest) -> Result<(), AppError> {
    if actor.role != ActorRole::Driver || driver_request.driver_id != actor.id {
        return Err(AppError::Ownership(format!(
            "driver request {} does not belong to actor {}",
            driver_request.id, actor.id
        )));
    }
    Ok(())
}

pub(crate) fn ensure_passenger_owns(actor: &Actor, request: &PassengerRequest) -> Result<(), AppError> {
    let owner = actor.role == ActorRole::Passenger && request.passenger_id == actor.id;
    if !owner && !actor.is_staff() {
        return Err(AppError::Ownership(format!(
            "passenger request {} does not belong to actor {}",
            request.id, actor.id
        )));
    }
    Ok(())
}

/// An open decision and its driver request always carry the same status.
pub(crate) fn ensure_in_step(decision: &JourneyDecision, driver_request: &DriverRequest) -> Result<(), AppError> {
    if decision.status.is_open() && decision.status != driver_request.status {
        return Err(AppError::Invariant(format!(
            "decision {} is {} but driver request {} is {}",
            decision.id, decision.status, driver_request.id, driver_request.status
        )));
    }
    Ok(())
}

/// `(from, to)` for a forward trigger, straight from the transition table.
pub(crate) fn transition(trigger: Trigger) -> Result<(JourneyStatus, JourneyStatus), AppError> {
    let from = required_status(trigger)
        .ok_or_else(|| AppError::Invariant(format!("{trigger:?} has no source status")))?;
    let to = next_status(trigger, Some(from))
        .ok_or_else(|| AppError::Invariant(format!("{trigger:?} has no target status")))?;
    Ok((from, to))
}

pub(crate) fn validate_point(field: &str, point: &GeoPoint) -> Result<(), AppError> {
    if !point.is_valid() {
        return Err(AppError::Validation(format!(
            "{field} must be a valid coordinate, got ({}, {})",
            point.lat, point.lng
        )));
    }
    Ok(())
}

pub(crate) fn validate_amount(field: &str, amount: f64) -> Result<(), AppError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(AppError::Validation(format!("{field} must be > 0")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{ensure_in_step, ensure_passenger_owns, transition, validate_amount, validate_point};
    use crate::models::actor::Actor;
    use crate::models::decision::JourneyDecision;
    use crate::models::driver_request::{DriverRequest, GeoPoint};
    use crate::models::passenger_request::{NewPassengerRequest, PassengerRequest, Shipment};
    use crate::status::{JourneyStatus, Trigger};

    #[test]
    fn transition_reads_the_table() {
        assert_eq!(
            transition(Trigger::Start).unwrap(),
            (JourneyStatus::AcceptedByPassenger, JourneyStatus::JourneyStarted)
        );
        assert!(transition(Trigger::AnnounceAvailability).is_err());
    }

    #[test]
    fn diverging_open_statuses_are_an_invariant_violation() {
        let driver = DriverRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            GeoPoint { lat: 0.0, lng: 0.0 },
            JourneyStatus::Requested,
        );
        let mut decision = JourneyDecision::new(driver.id, Uuid::new_v4(), JourneyStatus::AcceptedByDriver);
        assert!(ensure_in_step(&decision, &driver).is_err());

        decision.status = JourneyStatus::NotSelectedInBid;
        assert!(ensure_in_step(&decision, &driver).is_ok());
    }

    #[test]
    fn staff_may_act_for_passengers() {
        let request_owner = Uuid::new_v4();
        let new = NewPassengerRequest {
            passenger_id: None,
            vehicle_type_id: Uuid::new_v4(),
            origin: GeoPoint { lat: 9.0, lng: 38.74 },
            destination: GeoPoint { lat: 9.1, lng: 38.8 },
            origin_label: String::new(),
            destination_label: String::new(),
            shipment: Shipment {
                item: "coffee".to_string(),
                quantity: 10,
                pickup_at: None,
                deliver_by: None,
                quoted_cost: None,
            },
            vehicles_needed: 1,
        };
        let owner = Actor::passenger(request_owner);
        let request = PassengerRequest::from_new(&new, request_owner, &owner, JourneyStatus::Waiting, None);
        assert!(ensure_passenger_owns(&Actor::passenger(request_owner), &request).is_ok());
        assert!(ensure_passenger_owns(&Actor::admin(Uuid::new_v4()), &request).is_ok());
        assert!(ensure_passenger_owns(&Actor::passenger(Uuid::new_v4()), &request).is_err());
        assert!(ensure_passenger_owns(&Actor::driver(request_owner), &request).is_err());
    }

    #[test]
    fn inputs_are_validated_before_storage() {
        assert!(validate_point("origin", &GeoPoint { lat: 91.0, lng: 0.0 }).is_err());
        assert!(validate_point("origin", &GeoPoint { lat: f64::NAN, lng: 0.0 }).is_err());
        assert!(validate_point("origin", &GeoPoint { lat: 9.0, lng: 38.7 }).is_ok());
        assert!(validate_amount("price", 0.0).is_err());
        assert!(validate_amount("price", 150.0).is_ok());
    }
}
