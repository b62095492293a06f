use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::classifier::{
    PassengerReversion, passenger_reversion, terminate_driver_side, terminate_passenger_side,
};
use crate::engine::{Committed, Engine, ensure_in_step, ensure_passenger_owns};
use crate::error::AppError;
use crate::models::actor::{Actor, ActorRole};
use crate::models::decision::JourneyDecision;
use crate::models::driver_request::DriverRequest;
use crate::models::event::{EventType, LinkedIds, NotificationEvent};
use crate::models::passenger_request::PassengerRequest;
use crate::models::seen::SeenKind;
use crate::notify::audit::CancellationRecord;
use crate::status::JourneyStatus;
use crate::store::LinkedRecordSet;

#[derive(Debug, Clone, Serialize)]
pub struct DriverCancellation {
    pub driver_request: DriverRequest,
    pub decision: Option<JourneyDecision>,
    pub passenger_request: Option<PassengerRequest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PassengerCancellation {
    pub passenger_request: PassengerRequest,
    pub decisions: Vec<JourneyDecision>,
}

impl Engine {
    /// Driver-side termination. The caller states the status they believe
    /// the driver request is in; the classification is made from it.
    pub async fn cancel_driver_request(
        &self,
        actor: Actor,
        driver_request_id: Uuid,
        expected: JourneyStatus,
        reason: Option<String>,
    ) -> Result<DriverCancellation, AppError> {
        self.transact("cancel_driver_request", self.settings.tx_timeout, move |tx| {
            let driver_request = tx.driver_request(driver_request_id)?;
            if actor.role == ActorRole::Driver && driver_request.driver_id != actor.id {
                return Err(AppError::Ownership(format!(
                    "driver request {} does not belong to actor {}",
                    driver_request.id, actor.id
                )));
            }
            let termination = terminate_driver_side(actor.role, expected)?;
            if driver_request.status != expected {
                return Err(AppError::Conflict(format!(
                    "driver request {} is {}, expected {}",
                    driver_request.id, driver_request.status, expected
                )));
            }
            if !driver_request.is_open() {
                return Err(AppError::Conflict(format!(
                    "driver request {} is already closed ({})",
                    driver_request.id, driver_request.status
                )));
            }

            let mut events = Vec::new();

            // Waiting, or left behind after losing a bid: nobody else is involved.
            let Some(decision) = tx.open_decision_for_driver_request(driver_request.id) else {
                let driver_request = tx.update_driver_request(driver_request.id, &[expected], |row| {
                    row.status = termination.status;
                })?;
                if actor.is_staff() {
                    events.push(NotificationEvent::new(
                        staff_event(actor.role),
                        driver_request.driver_id,
                        termination.status,
                        LinkedIds {
                            driver_request_id: Some(driver_request.id),
                            ..LinkedIds::default()
                        },
                        actor.role,
                    ));
                }
                info!(driver_request_id = %driver_request.id, status = %termination.status, reason = ?reason, "driver request closed");
                return Ok(Committed::new(DriverCancellation {
                    driver_request,
                    decision: None,
                    passenger_request: None,
                })
                .with_events(events));
            };

            ensure_in_step(&decision, &driver_request)?;
            let passenger_request = tx.passenger_request(decision.passenger_request_id)?;
            let open_decisions = tx.count_open_decisions(passenger_request.id);
            let journey = tx.journey_for_decision(decision.id);

            let decision = tx.update_decision(decision.id, &[expected], |row| {
                row.decide(termination.status, actor.role);
            })?;
            let revert = passenger_reversion(open_decisions) == PassengerReversion::RevertToWaiting;
            let passenger_request = if revert || termination.passenger_flag.is_some() {
                tx.update_passenger_request(passenger_request.id, &[passenger_request.status], |row| {
                    if revert {
                        row.status = JourneyStatus::Waiting;
                    }
                    if let Some(kind) = termination.passenger_flag {
                        row.seen.raise(kind);
                    }
                })?
            } else {
                passenger_request
            };
            let driver_request = tx.update_driver_request(driver_request.id, &[expected], |row| {
                row.status = termination.status;
            })?;
            if let Some(journey) = &journey {
                tx.update_journey(journey.id, &[journey.status], |row| {
                    row.status = termination.status;
                    row.ended_at = Some(Utc::now());
                })?;
            }

            let linked = LinkedIds::of_decision(&decision).with_journey(journey.map(|journey| journey.id));
            if let Some(event_type) = termination.passenger_event {
                events.push(NotificationEvent::new(
                    event_type,
                    passenger_request.passenger_id,
                    termination.status,
                    linked.clone(),
                    actor.role,
                ));
            }
            if actor.is_staff() {
                events.push(NotificationEvent::new(
                    staff_event(actor.role),
                    driver_request.driver_id,
                    termination.status,
                    linked,
                    actor.role,
                ));
            }

            info!(
                decision_id = %decision.id,
                status = %termination.status,
                passenger_reverted = revert,
                reason = ?reason,
                "driver side terminated"
            );
            Ok(Committed::new(DriverCancellation {
                driver_request,
                decision: Some(decision),
                passenger_request: Some(passenger_request),
            })
            .with_events(events))
        })
        .await
    }

    /// Passenger-side cancellation, cascading to every open decision, its
    /// driver request and journey. Each affected driver is notified.
    pub async fn cancel_passenger_request(
        &self,
        actor: Actor,
        passenger_request_id: Uuid,
        expected: JourneyStatus,
        reason: Option<String>,
    ) -> Result<PassengerCancellation, AppError> {
        let (status, driver_event) = terminate_passenger_side(actor.role)?;

        self.transact("cancel_passenger_request", self.settings.wide_tx_timeout, move |tx| {
            let passenger_request = tx.passenger_request(passenger_request_id)?;
            ensure_passenger_owns(&actor, &passenger_request)?;
            if passenger_request.status != expected {
                return Err(AppError::Conflict(format!(
                    "passenger request {} is {}, expected {}",
                    passenger_request.id, passenger_request.status, expected
                )));
            }
            if passenger_request.status.is_terminal() {
                return Err(AppError::Conflict(format!(
                    "passenger request {} is already closed ({})",
                    passenger_request.id, passenger_request.status
                )));
            }

            let mut chains = Vec::new();
            for decision in tx
                .decisions_for_passenger(passenger_request.id)
                .into_iter()
                .filter(|decision| decision.status.is_open())
            {
                let driver_request = tx.driver_request(decision.driver_request_id)?;
                ensure_in_step(&decision, &driver_request)?;
                let journey = tx.journey_for_decision(decision.id);
                chains.push((decision, driver_request, journey));
            }

            let mut decisions = Vec::new();
            for (decision, _, _) in &chains {
                decisions.push(tx.update_decision(decision.id, &[decision.status], |row| {
                    row.decide(status, actor.role);
                })?);
            }
            let passenger_request = tx.update_passenger_request(passenger_request.id, &[expected], |row| {
                row.status = status;
                if actor.is_staff() {
                    row.seen.raise(SeenKind::Cancellation);
                }
            })?;
            for (decision, driver_request, _) in &chains {
                tx.update_driver_request(driver_request.id, &[decision.status], |row| {
                    row.status = status;
                    row.seen.raise(SeenKind::Cancellation);
                })?;
            }
            for journey in chains.iter().filter_map(|(_, _, journey)| journey.as_ref()) {
                tx.update_journey(journey.id, &[journey.status], |row| {
                    row.status = status;
                    row.ended_at = Some(Utc::now());
                })?;
            }

            let mut events: Vec<NotificationEvent> = chains
                .iter()
                .zip(&decisions)
                .map(|((_, driver_request, journey), decision)| {
                    NotificationEvent::new(
                        driver_event,
                        driver_request.driver_id,
                        status,
                        LinkedIds::of_decision(decision).with_journey(journey.as_ref().map(|j| j.id)),
                        actor.role,
                    )
                })
                .collect();
            if actor.is_staff() {
                events.push(NotificationEvent::new(
                    driver_event,
                    passenger_request.passenger_id,
                    status,
                    LinkedIds {
                        passenger_request_id: Some(passenger_request.id),
                        ..LinkedIds::default()
                    },
                    actor.role,
                ));
            }

            let record = CancellationRecord {
                passenger_request_id: passenger_request.id,
                cancelled_by: actor.id,
                actor_role: actor.role,
                status,
                reason,
                affected_decisions: decisions.iter().map(|decision| decision.id).collect(),
                recorded_at: Utc::now(),
            };

            info!(
                passenger_request_id = %passenger_request.id,
                status = %status,
                drivers = decisions.len(),
                "passenger request cancelled"
            );
            Ok(Committed::new(PassengerCancellation {
                passenger_request,
                decisions,
            })
            .with_events(events)
            .with_audit(record))
        })
        .await
    }

    /// Staff closes a committed chain as completed on the parties' behalf.
    pub async fn complete_by_admin(&self, actor: Actor, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        if !actor.is_staff() {
            return Err(AppError::Ownership(
                "only staff can complete a journey on someone's behalf".to_string(),
            ));
        }
        let completed = JourneyStatus::CompletedByAdmin;

        self.transact("complete_by_admin", self.settings.tx_timeout, move |tx| {
            let decision = tx.decision(decision_id)?;
            if !matches!(
                decision.status,
                JourneyStatus::AcceptedByPassenger | JourneyStatus::JourneyStarted
            ) {
                return Err(AppError::Conflict(format!(
                    "decision {} is {}, only accepted or started journeys can be completed",
                    decision.id, decision.status
                )));
            }
            let driver_request = tx.driver_request(decision.driver_request_id)?;
            ensure_in_step(&decision, &driver_request)?;
            let passenger_request = tx.passenger_request(decision.passenger_request_id)?;
            let journey = tx.journey_for_decision(decision.id);
            let prior = decision.status;

            let decision = tx.update_decision(decision.id, &[prior], |row| row.decide(completed, actor.role))?;
            tx.update_passenger_request(passenger_request.id, &[prior], |row| {
                row.status = completed;
                row.seen.raise(SeenKind::Completion);
            })?;
            tx.update_driver_request(driver_request.id, &[prior], |row| row.status = completed)?;
            if let Some(journey) = &journey {
                tx.update_journey(journey.id, &[journey.status], |row| {
                    row.status = completed;
                    row.ended_at = Some(Utc::now());
                })?;
            }

            let linked = LinkedIds::of_decision(&decision).with_journey(journey.map(|journey| journey.id));
            let events = vec![
                NotificationEvent::new(
                    EventType::CompletedByAdmin,
                    passenger_request.passenger_id,
                    completed,
                    linked.clone(),
                    actor.role,
                ),
                NotificationEvent::new(
                    EventType::CompletedByAdmin,
                    driver_request.driver_id,
                    completed,
                    linked,
                    actor.role,
                ),
            ];
            Ok(Committed::new(tx.linked_records(decision.id)?).with_events(events))
        })
        .await
    }

    /// Soft delete; only closed driver requests may go.
    pub async fn delete_driver_request(&self, actor: Actor, driver_request_id: Uuid) -> Result<DriverRequest, AppError> {
        self.transact("delete_driver_request", self.settings.tx_timeout, move |tx| {
            let driver_request = tx.driver_request(driver_request_id)?;
            if driver_request.driver_id != actor.id && !actor.is_staff() {
                return Err(AppError::Ownership(format!(
                    "driver request {} does not belong to actor {}",
                    driver_request.id, actor.id
                )));
            }
            if driver_request.status.is_open() {
                return Err(AppError::Conflict(format!(
                    "driver request {} is still active ({})",
                    driver_request.id, driver_request.status
                )));
            }
            if driver_request.deleted_at.is_some() {
                return Ok(Committed::new(driver_request));
            }
            let deleted = tx.update_driver_request(driver_request.id, &[driver_request.status], |row| {
                row.deleted_at = Some(Utc::now());
            })?;
            Ok(Committed::new(deleted))
        })
        .await
    }
}

fn staff_event(role: ActorRole) -> EventType {
    match role {
        ActorRole::System => EventType::CancelledBySystem,
        _ => EventType::CancelledByAdmin,
    }
}
