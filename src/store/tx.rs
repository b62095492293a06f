use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::decision::JourneyDecision;
use crate::models::driver_request::DriverRequest;
use crate::models::journey::{Journey, JourneyRoutePoint};
use crate::models::passenger_request::PassengerRequest;
use crate::status::JourneyStatus;
use crate::store::{LinkedRecordSet, RequestStore, Tables};

/// A unit of work handed to a [`RecordStore`](crate::store::RecordStore).
pub type UnitOfWork<'a> = Box<dyn FnOnce(&mut dyn Transaction) -> Result<(), AppError> + Send + 'a>;

/// Reads and conditional writes available inside one unit of work. Every
/// write is undone unless the unit of work commits.
pub trait Transaction {
    fn passenger_request(&self, id: Uuid) -> Result<PassengerRequest, AppError>;
    fn driver_request(&self, id: Uuid) -> Result<DriverRequest, AppError>;
    fn decision(&self, id: Uuid) -> Result<JourneyDecision, AppError>;
    fn linked_records(&self, decision_id: Uuid) -> Result<LinkedRecordSet, AppError>;
    fn journey_for_decision(&self, decision_id: Uuid) -> Option<Journey>;
    fn decisions_for_passenger(&self, passenger_request_id: Uuid) -> Vec<JourneyDecision>;
    fn count_open_decisions(&self, passenger_request_id: Uuid) -> usize;
    fn open_driver_request_for(&self, driver_id: Uuid) -> Option<DriverRequest>;
    fn open_decision_for_driver_request(&self, driver_request_id: Uuid) -> Option<JourneyDecision>;
    /// Whether `driver_request_id` already has any decision on this passenger request.
    fn has_decision_between(&self, driver_request_id: Uuid, passenger_request_id: Uuid) -> bool;
    /// Whether `passenger_id` ever rejected a bid from `driver_id`.
    fn has_rejected(&self, passenger_id: Uuid, driver_id: Uuid) -> bool;
    /// `requested` decisions created at or before `cutoff`, oldest first.
    fn unanswered_decisions(&self, cutoff: DateTime<Utc>) -> Vec<JourneyDecision>;
    /// Passenger requests matching `filter`, in discovery order.
    fn passenger_requests_where(&self, filter: &dyn Fn(&PassengerRequest) -> bool) -> Vec<PassengerRequest>;
    /// Driver requests matching `filter`, in discovery order.
    fn driver_requests_where(&self, filter: &dyn Fn(&DriverRequest) -> bool) -> Vec<DriverRequest>;

    fn insert_passenger_request(&mut self, row: PassengerRequest) -> Result<(), AppError>;
    fn insert_driver_request(&mut self, row: DriverRequest) -> Result<(), AppError>;
    fn insert_decision(&mut self, row: JourneyDecision) -> Result<(), AppError>;
    fn insert_journey(&mut self, row: Journey) -> Result<(), AppError>;
    fn append_route_point(&mut self, point: JourneyRoutePoint) -> Result<(), AppError>;

    /// Conditional update: fails with a conflict unless the stored status is
    /// one of `expected`.
    fn update_passenger_request_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut PassengerRequest),
    ) -> Result<PassengerRequest, AppError>;
    fn update_driver_request_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut DriverRequest),
    ) -> Result<DriverRequest, AppError>;
    fn update_decision_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut JourneyDecision),
    ) -> Result<JourneyDecision, AppError>;
    fn update_journey_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut Journey),
    ) -> Result<Journey, AppError>;
}

impl<'t> dyn Transaction + 't {
    pub fn find_passenger_requests<F>(&self, filter: F) -> Vec<PassengerRequest>
    where
        F: Fn(&PassengerRequest) -> bool,
    {
        self.passenger_requests_where(&filter)
    }

    pub fn find_driver_requests<F>(&self, filter: F) -> Vec<DriverRequest>
    where
        F: Fn(&DriverRequest) -> bool,
    {
        self.driver_requests_where(&filter)
    }

    pub fn update_passenger_request<F>(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: F,
    ) -> Result<PassengerRequest, AppError>
    where
        F: FnOnce(&mut PassengerRequest),
    {
        let mut mutate = Some(mutate);
        self.update_passenger_request_with(id, expected, &mut |row| {
            if let Some(mutate) = mutate.take() {
                mutate(row);
            }
        })
    }

    pub fn update_driver_request<F>(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: F,
    ) -> Result<DriverRequest, AppError>
    where
        F: FnOnce(&mut DriverRequest),
    {
        let mut mutate = Some(mutate);
        self.update_driver_request_with(id, expected, &mut |row| {
            if let Some(mutate) = mutate.take() {
                mutate(row);
            }
        })
    }

    pub fn update_decision<F>(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: F,
    ) -> Result<JourneyDecision, AppError>
    where
        F: FnOnce(&mut JourneyDecision),
    {
        let mut mutate = Some(mutate);
        self.update_decision_with(id, expected, &mut |row| {
            if let Some(mutate) = mutate.take() {
                mutate(row);
            }
        })
    }

    pub fn update_journey<F>(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: F,
    ) -> Result<Journey, AppError>
    where
        F: FnOnce(&mut Journey),
    {
        let mut mutate = Some(mutate);
        self.update_journey_with(id, expected, &mut |row| {
            if let Some(mutate) = mutate.take() {
                mutate(row);
            }
        })
    }
}

enum Undo {
    PassengerRequest(Uuid, Option<PassengerRequest>),
    DriverRequest(Uuid, Option<DriverRequest>),
    Decision(Uuid, Option<JourneyDecision>),
    Journey(Uuid, Option<Journey>),
    RoutePoint,
}

/// Transaction handle over the in-process tables. It only exists inside
/// [`RequestStore::run`], and every write it records is undone unless the
/// unit of work finishes before its deadline.
pub struct Tx<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
    op: &'static str,
    deadline: Instant,
    committed: bool,
}

impl<'a> Tx<'a> {
    fn begin(tables: &'a mut Tables, op: &'static str, deadline: Instant) -> Self {
        Self {
            tables,
            undo: Vec::new(),
            op,
            deadline,
            committed: false,
        }
    }

    fn ensure_live(&self) -> Result<(), AppError> {
        if Instant::now() > self.deadline {
            return Err(AppError::Transaction(format!(
                "{}: deadline exceeded",
                self.op
            )));
        }
        Ok(())
    }

    fn commit(mut self) -> usize {
        self.committed = true;
        self.undo.len()
    }

    fn rollback(&mut self) -> usize {
        let undone = self.undo.len();
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::PassengerRequest(id, previous) => {
                    restore(&mut self.tables.passenger_requests, id, previous)
                }
                Undo::DriverRequest(id, previous) => {
                    restore(&mut self.tables.driver_requests, id, previous)
                }
                Undo::Decision(id, previous) => restore(&mut self.tables.decisions, id, previous),
                Undo::Journey(id, previous) => restore(&mut self.tables.journeys, id, previous),
                Undo::RoutePoint => {
                    self.tables.route_points.pop();
                }
            }
        }
        undone
    }
}

impl Transaction for Tx<'_> {
    fn passenger_request(&self, id: Uuid) -> Result<PassengerRequest, AppError> {
        self.tables.passenger_request(id).cloned()
    }

    fn driver_request(&self, id: Uuid) -> Result<DriverRequest, AppError> {
        self.tables.driver_request(id).cloned()
    }

    fn decision(&self, id: Uuid) -> Result<JourneyDecision, AppError> {
        self.tables.decision(id).cloned()
    }

    fn linked_records(&self, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        self.tables.linked_records(decision_id)
    }

    fn journey_for_decision(&self, decision_id: Uuid) -> Option<Journey> {
        self.tables.journey_for_decision(decision_id).cloned()
    }

    fn decisions_for_passenger(&self, passenger_request_id: Uuid) -> Vec<JourneyDecision> {
        self.tables
            .decisions_for_passenger(passenger_request_id)
            .into_iter()
            .cloned()
            .collect()
    }

    fn count_open_decisions(&self, passenger_request_id: Uuid) -> usize {
        self.tables
            .decisions_for_passenger(passenger_request_id)
            .into_iter()
            .filter(|decision| decision.status.is_open())
            .count()
    }

    fn passenger_requests_where(&self, filter: &dyn Fn(&PassengerRequest) -> bool) -> Vec<PassengerRequest> {
        let mut rows: Vec<&PassengerRequest> = self
            .tables
            .passenger_requests
            .values()
            .filter(|request| filter(request))
            .collect();
        rows.sort_by_key(|request| (request.created_at, request.id));
        rows.into_iter().cloned().collect()
    }

    fn driver_requests_where(&self, filter: &dyn Fn(&DriverRequest) -> bool) -> Vec<DriverRequest> {
        let mut rows: Vec<&DriverRequest> = self
            .tables
            .driver_requests
            .values()
            .filter(|request| filter(request))
            .collect();
        rows.sort_by_key(|request| (request.created_at, request.id));
        rows.into_iter().cloned().collect()
    }

    fn open_driver_request_for(&self, driver_id: Uuid) -> Option<DriverRequest> {
        self.tables
            .driver_requests
            .values()
            .find(|request| request.driver_id == driver_id && request.is_open())
            .cloned()
    }

    fn open_decision_for_driver_request(&self, driver_request_id: Uuid) -> Option<JourneyDecision> {
        self.tables
            .decisions
            .values()
            .find(|decision| {
                decision.driver_request_id == driver_request_id && decision.status.is_open()
            })
            .cloned()
    }

    fn has_decision_between(&self, driver_request_id: Uuid, passenger_request_id: Uuid) -> bool {
        self.tables.decisions.values().any(|decision| {
            decision.driver_request_id == driver_request_id
                && decision.passenger_request_id == passenger_request_id
        })
    }

    fn has_rejected(&self, passenger_id: Uuid, driver_id: Uuid) -> bool {
        self.tables
            .decisions
            .values()
            .filter(|decision| decision.status == JourneyStatus::RejectedByPassenger)
            .any(|decision| {
                let by_driver = self
                    .tables
                    .driver_requests
                    .get(&decision.driver_request_id)
                    .is_some_and(|request| request.driver_id == driver_id);
                let from_passenger = self
                    .tables
                    .passenger_requests
                    .get(&decision.passenger_request_id)
                    .is_some_and(|request| request.passenger_id == passenger_id);
                by_driver && from_passenger
            })
    }

    fn unanswered_decisions(&self, cutoff: DateTime<Utc>) -> Vec<JourneyDecision> {
        let mut rows: Vec<&JourneyDecision> = self
            .tables
            .decisions
            .values()
            .filter(|decision| {
                decision.status == JourneyStatus::Requested && decision.created_at <= cutoff
            })
            .collect();
        rows.sort_by_key(|decision| (decision.created_at, decision.id));
        rows.into_iter().cloned().collect()
    }

    fn insert_passenger_request(&mut self, row: PassengerRequest) -> Result<(), AppError> {
        self.ensure_live()?;
        let previous = self.tables.passenger_requests.insert(row.id, row.clone());
        self.undo.push(Undo::PassengerRequest(row.id, previous));
        Ok(())
    }

    fn insert_driver_request(&mut self, row: DriverRequest) -> Result<(), AppError> {
        self.ensure_live()?;
        let previous = self.tables.driver_requests.insert(row.id, row.clone());
        self.undo.push(Undo::DriverRequest(row.id, previous));
        Ok(())
    }

    fn insert_decision(&mut self, row: JourneyDecision) -> Result<(), AppError> {
        self.ensure_live()?;
        let previous = self.tables.decisions.insert(row.id, row.clone());
        self.undo.push(Undo::Decision(row.id, previous));
        Ok(())
    }

    fn insert_journey(&mut self, row: Journey) -> Result<(), AppError> {
        self.ensure_live()?;
        if self.tables.journey_for_decision(row.decision_id).is_some() {
            return Err(AppError::Invariant(format!(
                "decision {} already has a journey",
                row.decision_id
            )));
        }
        let previous = self.tables.journeys.insert(row.id, row.clone());
        self.undo.push(Undo::Journey(row.id, previous));
        Ok(())
    }

    fn append_route_point(&mut self, point: JourneyRoutePoint) -> Result<(), AppError> {
        self.ensure_live()?;
        self.tables.decision(point.decision_id)?;
        self.tables.route_points.push(point);
        self.undo.push(Undo::RoutePoint);
        Ok(())
    }

    fn update_passenger_request_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut PassengerRequest),
    ) -> Result<PassengerRequest, AppError> {
        self.ensure_live()?;
        let row = self
            .tables
            .passenger_requests
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("passenger request {id} not found")))?;
        check_status("passenger request", id, row.status, expected)?;
        let previous = row.clone();
        mutate(row);
        row.updated_at = Utc::now();
        let updated = row.clone();
        self.undo.push(Undo::PassengerRequest(id, Some(previous)));
        Ok(updated)
    }

    fn update_driver_request_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut DriverRequest),
    ) -> Result<DriverRequest, AppError> {
        self.ensure_live()?;
        let row = self
            .tables
            .driver_requests
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver request {id} not found")))?;
        check_status("driver request", id, row.status, expected)?;
        let previous = row.clone();
        mutate(row);
        row.updated_at = Utc::now();
        let updated = row.clone();
        self.undo.push(Undo::DriverRequest(id, Some(previous)));
        Ok(updated)
    }

    fn update_decision_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut JourneyDecision),
    ) -> Result<JourneyDecision, AppError> {
        self.ensure_live()?;
        let row = self
            .tables
            .decisions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("journey decision {id} not found")))?;
        check_status("journey decision", id, row.status, expected)?;
        let previous = row.clone();
        mutate(row);
        row.updated_at = Utc::now();
        let updated = row.clone();
        self.undo.push(Undo::Decision(id, Some(previous)));
        Ok(updated)
    }

    fn update_journey_with(
        &mut self,
        id: Uuid,
        expected: &[JourneyStatus],
        mutate: &mut dyn FnMut(&mut Journey),
    ) -> Result<Journey, AppError> {
        self.ensure_live()?;
        let row = self
            .tables
            .journeys
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("journey {id} not found")))?;
        check_status("journey", id, row.status, expected)?;
        let previous = row.clone();
        mutate(row);
        let updated = row.clone();
        self.undo.push(Undo::Journey(id, Some(previous)));
        Ok(updated)
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

fn restore<T>(table: &mut std::collections::HashMap<Uuid, T>, id: Uuid, previous: Option<T>) {
    match previous {
        Some(row) => {
            table.insert(id, row);
        }
        None => {
            table.remove(&id);
        }
    }
}

fn check_status(
    entity: &str,
    id: Uuid,
    actual: JourneyStatus,
    expected: &[JourneyStatus],
) -> Result<(), AppError> {
    if expected.contains(&actual) {
        return Ok(());
    }
    Err(AppError::Conflict(format!(
        "{entity} {id} is {actual}, expected {}",
        expected
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" or ")
    )))
}


impl RequestStore {
    /// Runs `work` against the tables, one unit of work at a time. Any error
    /// returned by `work`, or running past `timeout`, rolls back every write
    /// made through the handle.
    pub async fn run<T, F>(&self, op: &'static str, timeout: Duration, work: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut dyn Transaction) -> Result<T, AppError>,
    {
        let deadline = Instant::now() + timeout;
        let mut guard = tokio::time::timeout(timeout, self.tables().lock())
            .await
            .map_err(|_| {
                AppError::Transaction(format!("{op}: timed out after {timeout:?} waiting for the store"))
            })?;

        let mut tx = Tx::begin(&mut guard, op, deadline);
        let outcome = work(&mut tx).and_then(|value| tx.ensure_live().map(|()| value));

        match outcome {
            Ok(value) => {
                let writes = tx.commit();
                debug!(op, writes, "transaction committed");
                Ok(value)
            }
            Err(err) => {
                let undone = tx.rollback();
                warn!(op, undone, error = %err, "transaction rolled back");
                Err(err)
            }
        }
    }
}
