pub mod tx;

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::decision::JourneyDecision;
use crate::models::driver_request::DriverRequest;
use crate::models::journey::{Journey, JourneyRoutePoint};
use crate::models::passenger_request::PassengerRequest;
use crate::models::seen::{SeenKind, SeenState};

pub use tx::{Transaction, Tx, UnitOfWork};

/// The rows of the four linked tables plus route history.
#[derive(Debug, Default, Clone)]
pub struct Tables {
    pub(crate) passenger_requests: HashMap<Uuid, PassengerRequest>,
    pub(crate) driver_requests: HashMap<Uuid, DriverRequest>,
    pub(crate) decisions: HashMap<Uuid, JourneyDecision>,
    pub(crate) journeys: HashMap<Uuid, Journey>,
    pub(crate) route_points: Vec<JourneyRoutePoint>,
}

/// Everything sharing one match episode.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LinkedRecordSet {
    pub decision: JourneyDecision,
    pub driver_request: DriverRequest,
    pub passenger_request: PassengerRequest,
    pub journey: Option<Journey>,
    pub route_points: Vec<JourneyRoutePoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "entity", content = "id", rename_all = "camelCase")]
pub enum SeenTarget {
    PassengerRequest(Uuid),
    DriverRequest(Uuid),
    Decision(Uuid),
}

/// Storage the engine runs against. `transact` runs a unit of work
/// all-or-nothing; the reads outside it see committed rows only.
pub trait RecordStore: Send + Sync {
    fn transact<'a>(
        &'a self,
        op: &'static str,
        timeout: Duration,
        work: UnitOfWork<'a>,
    ) -> BoxFuture<'a, Result<(), AppError>>;

    fn passenger_request(&self, id: Uuid) -> BoxFuture<'_, Result<PassengerRequest, AppError>>;

    fn driver_request(&self, id: Uuid) -> BoxFuture<'_, Result<DriverRequest, AppError>>;

    fn decision(&self, id: Uuid) -> BoxFuture<'_, Result<JourneyDecision, AppError>>;

    fn linked_records(&self, decision_id: Uuid) -> BoxFuture<'_, Result<LinkedRecordSet, AppError>>;

    /// Single-row seen-flag write, outside any unit of work.
    fn acknowledge(&self, target: SeenTarget, kind: SeenKind) -> BoxFuture<'_, Result<SeenState, AppError>>;
}

/// In-process relational store. Multi-table writes go through
/// [`RequestStore::run`]; only seen-flag updates write directly. One lock
/// covers every table, so units of work run one at a time and waiting for
/// it is bounded by the caller's timeout.
#[derive(Debug, Default)]
pub struct RequestStore {
    tables: Mutex<Tables>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TableCounts {
    pub passenger_requests: usize,
    pub driver_requests: usize,
    pub decisions: usize,
    pub journeys: usize,
    pub route_points: usize,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tables(&self) -> &Mutex<Tables> {
        &self.tables
    }

    pub async fn counts(&self) -> TableCounts {
        let tables = self.tables.lock().await;
        TableCounts {
            passenger_requests: tables.passenger_requests.len(),
            driver_requests: tables.driver_requests.len(),
            decisions: tables.decisions.len(),
            journeys: tables.journeys.len(),
            route_points: tables.route_points.len(),
        }
    }

    pub async fn passenger_request(&self, id: Uuid) -> Result<PassengerRequest, AppError> {
        self.tables.lock().await.passenger_request(id).cloned()
    }

    pub async fn driver_request(&self, id: Uuid) -> Result<DriverRequest, AppError> {
        self.tables.lock().await.driver_request(id).cloned()
    }

    pub async fn decision(&self, id: Uuid) -> Result<JourneyDecision, AppError> {
        self.tables.lock().await.decision(id).cloned()
    }

    pub async fn decisions_for_passenger(&self, passenger_request_id: Uuid) -> Vec<JourneyDecision> {
        self.tables
            .lock()
            .await
            .decisions_for_passenger(passenger_request_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn passenger_requests_in_batch(&self, batch_id: Uuid) -> Vec<PassengerRequest> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<PassengerRequest> = tables
            .passenger_requests
            .values()
            .filter(|request| request.batch_id == Some(batch_id))
            .cloned()
            .collect();
        rows.sort_by_key(|request| (request.created_at, request.id));
        rows
    }

    pub async fn linked_records(&self, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        let tables = self.tables.lock().await;
        tables.linked_records(decision_id)
    }

    /// Seen flags live on a single row, so they skip the unit of work. The
    /// row's timestamps are left alone.
    pub async fn acknowledge(&self, target: SeenTarget, kind: SeenKind) -> Result<SeenState, AppError> {
        let mut tables = self.tables.lock().await;
        let state = match target {
            SeenTarget::PassengerRequest(id) => {
                let row = tables
                    .passenger_requests
                    .get_mut(&id)
                    .ok_or_else(|| AppError::NotFound(format!("passenger request {id} not found")))?;
                row.seen.acknowledge(kind)
            }
            SeenTarget::DriverRequest(id) => {
                let row = tables
                    .driver_requests
                    .get_mut(&id)
                    .ok_or_else(|| AppError::NotFound(format!("driver request {id} not found")))?;
                row.seen.acknowledge(kind)
            }
            SeenTarget::Decision(id) => {
                let row = tables
                    .decisions
                    .get_mut(&id)
                    .ok_or_else(|| AppError::NotFound(format!("journey decision {id} not found")))?;
                row.seen.acknowledge(kind)
            }
        };
        Ok(state)
    }
}

impl RecordStore for RequestStore {
    fn transact<'a>(
        &'a self,
        op: &'static str,
        timeout: Duration,
        work: UnitOfWork<'a>,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        Box::pin(self.run(op, timeout, work))
    }

    fn passenger_request(&self, id: Uuid) -> BoxFuture<'_, Result<PassengerRequest, AppError>> {
        Box::pin(async move { self.tables.lock().await.passenger_request(id).cloned() })
    }

    fn driver_request(&self, id: Uuid) -> BoxFuture<'_, Result<DriverRequest, AppError>> {
        Box::pin(async move { self.tables.lock().await.driver_request(id).cloned() })
    }

    fn decision(&self, id: Uuid) -> BoxFuture<'_, Result<JourneyDecision, AppError>> {
        Box::pin(async move { self.tables.lock().await.decision(id).cloned() })
    }

    fn linked_records(&self, decision_id: Uuid) -> BoxFuture<'_, Result<LinkedRecordSet, AppError>> {
        Box::pin(async move { self.tables.lock().await.linked_records(decision_id) })
    }

    fn acknowledge(&self, target: SeenTarget, kind: SeenKind) -> BoxFuture<'_, Result<SeenState, AppError>> {
        Box::pin(RequestStore::acknowledge(self, target, kind))
    }
}

impl Tables {
    pub(crate) fn passenger_request(&self, id: Uuid) -> Result<&PassengerRequest, AppError> {
        self.passenger_requests
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("passenger request {id} not found")))
    }

    pub(crate) fn driver_request(&self, id: Uuid) -> Result<&DriverRequest, AppError> {
        self.driver_requests
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("driver request {id} not found")))
    }

    pub(crate) fn decision(&self, id: Uuid) -> Result<&JourneyDecision, AppError> {
        self.decisions
            .get(&id)
            .ok_or_else(|| AppError::NotFound(format!("journey decision {id} not found")))
    }

    pub(crate) fn journey_for_decision(&self, decision_id: Uuid) -> Option<&Journey> {
        self.journeys
            .values()
            .find(|journey| journey.decision_id == decision_id)
    }

    /// Decisions of one passenger request in creation order.
    pub(crate) fn decisions_for_passenger(&self, passenger_request_id: Uuid) -> Vec<&JourneyDecision> {
        let mut rows: Vec<&JourneyDecision> = self
            .decisions
            .values()
            .filter(|decision| decision.passenger_request_id == passenger_request_id)
            .collect();
        rows.sort_by_key(|decision| (decision.created_at, decision.id));
        rows
    }

    pub(crate) fn route_points(&self, decision_id: Uuid) -> Vec<JourneyRoutePoint> {
        let mut points: Vec<JourneyRoutePoint> = self
            .route_points
            .iter()
            .filter(|point| point.decision_id == decision_id)
            .cloned()
            .collect();
        points.sort_by_key(|point| point.recorded_at);
        points
    }

    pub(crate) fn linked_records(&self, decision_id: Uuid) -> Result<LinkedRecordSet, AppError> {
        let decision = self.decision(decision_id)?.clone();
        let driver_request = self.driver_request(decision.driver_request_id)?.clone();
        let passenger_request = self.passenger_request(decision.passenger_request_id)?.clone();
        let journey = self.journey_for_decision(decision_id).cloned();
        let route_points = self.route_points(decision_id);

        Ok(LinkedRecordSet {
            decision,
            driver_request,
            passenger_request,
            journey,
            route_points,
        })
    }
}
