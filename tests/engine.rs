use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, Utc};
use freight_match::engine::lifecycle::{RegisterAvailability, StreetPickup};
use freight_match::engine::{Engine, EngineSettings};
use freight_match::error::AppError;
use freight_match::models::actor::Actor;
use freight_match::models::decision::JourneyDecision;
use freight_match::models::driver_request::{DriverRequest, GeoPoint};
use freight_match::models::event::{EventType, NotificationEvent};
use freight_match::models::passenger_request::{NewPassengerRequest, PassengerRequest, Shipment};
use freight_match::models::seen::{SeenKind, SeenState};
use freight_match::notify::audit::InMemoryAudit;
use freight_match::notify::{BroadcastDispatcher, DispatchError, NotificationDispatcher};
use freight_match::observability::metrics::Metrics;
use freight_match::status::JourneyStatus;
use freight_match::store::{LinkedRecordSet, RecordStore, RequestStore, SeenTarget, UnitOfWork};
use futures::future::BoxFuture;
use uuid::Uuid;

struct Harness {
    engine: Arc<Engine>,
    store: Arc<RequestStore>,
    dispatcher: Arc<BroadcastDispatcher>,
    audit: Arc<InMemoryAudit>,
}

fn harness() -> Harness {
    harness_with(EngineSettings::default())
}

fn harness_with(settings: EngineSettings) -> Harness {
    let store = Arc::new(RequestStore::new());
    let dispatcher = Arc::new(BroadcastDispatcher::new(64));
    let audit = Arc::new(InMemoryAudit::new());
    let engine = Arc::new(Engine::new(
        store.clone(),
        dispatcher.clone(),
        audit.clone(),
        settings,
        Metrics::new(),
    ));
    Harness {
        engine,
        store,
        dispatcher,
        audit,
    }
}

fn truck() -> Uuid {
    Uuid::from_u128(42)
}

fn pickup_point() -> GeoPoint {
    GeoPoint { lat: 9.0, lng: 38.74 }
}

fn near_pickup() -> GeoPoint {
    GeoPoint { lat: 9.004, lng: 38.743 }
}

fn cement() -> Shipment {
    Shipment {
        item: "cement".to_string(),
        quantity: 40,
        pickup_at: None,
        deliver_by: None,
        quoted_cost: Some(1200.0),
    }
}

fn new_request() -> NewPassengerRequest {
    NewPassengerRequest {
        passenger_id: None,
        vehicle_type_id: truck(),
        origin: pickup_point(),
        destination: GeoPoint { lat: 8.55, lng: 39.27 },
        origin_label: "Merkato".to_string(),
        destination_label: "Adama".to_string(),
        shipment: cement(),
        vehicles_needed: 1,
    }
}

fn availability() -> RegisterAvailability {
    RegisterAvailability {
        location: near_pickup(),
        vehicle_type_id: truck(),
    }
}

async fn place(h: &Harness, passenger: Actor) -> PassengerRequest {
    let mut placements = h
        .engine
        .create_passenger_request(passenger, new_request())
        .await
        .unwrap();
    placements.remove(0).passenger_request
}

/// Registers a driver near the pickup and returns the decision id it was
/// matched into.
async fn match_driver(h: &Harness, driver: Actor) -> Uuid {
    let registration = h
        .engine
        .register_availability(driver, availability())
        .await
        .unwrap();
    registration.pairing.expect("driver should be matched").decision.id
}

fn event_types(events: &[NotificationEvent]) -> Vec<EventType> {
    events.iter().map(|event| event.event_type).collect()
}

#[tokio::test]
async fn journey_runs_from_match_to_completion() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());

    let request = place(&h, passenger).await;
    assert_eq!(request.status, JourneyStatus::Waiting);

    let decision_id = match_driver(&h, driver).await;
    let records = h.store.linked_records(decision_id).await.unwrap();
    assert_eq!(records.decision.status, JourneyStatus::Requested);
    assert_eq!(records.passenger_request.status, JourneyStatus::Requested);
    assert_eq!(records.driver_request.status, JourneyStatus::Requested);

    let records = h.engine.bid(driver, decision_id, 1500.0).await.unwrap();
    assert_eq!(records.decision.proposed_cost, Some(1500.0));
    assert_eq!(records.passenger_request.status, JourneyStatus::AcceptedByDriver);

    let records = h.engine.accept_bidder(passenger, decision_id).await.unwrap();
    assert_eq!(records.driver_request.status, JourneyStatus::AcceptedByPassenger);
    assert!(records.journey.is_none());

    let records = h
        .engine
        .start_journey(driver, decision_id, near_pickup())
        .await
        .unwrap();
    let journey = records.journey.expect("journey created on start");
    assert_eq!(journey.status, JourneyStatus::JourneyStarted);
    assert_eq!(journey.fare, Some(1500.0));

    let drop_off = GeoPoint { lat: 8.55, lng: 39.27 };
    let records = h
        .engine
        .complete_journey(driver, decision_id, drop_off)
        .await
        .unwrap();
    for status in [
        records.decision.status,
        records.passenger_request.status,
        records.driver_request.status,
        records.journey.as_ref().unwrap().status,
    ] {
        assert_eq!(status, JourneyStatus::JourneyCompleted);
    }
    assert!(records.journey.unwrap().ended_at.is_some());
    assert_eq!(records.route_points.len(), 2);
    assert_eq!(
        records.passenger_request.seen.get(SeenKind::Completion),
        SeenState::Unseen
    );

    assert_eq!(
        event_types(&h.dispatcher.events_for(passenger.id)),
        vec![
            EventType::Matched,
            EventType::BidReceived,
            EventType::JourneyStarted,
            EventType::JourneyCompleted,
        ]
    );
    assert_eq!(
        event_types(&h.dispatcher.events_for(driver.id)),
        vec![EventType::Matched, EventType::BidAccepted]
    );
}

#[tokio::test]
async fn passenger_arriving_later_finds_the_waiting_driver() {
    let h = harness();
    let driver = Actor::driver(Uuid::new_v4());
    let registration = h
        .engine
        .register_availability(driver, availability())
        .await
        .unwrap();
    assert!(registration.pairing.is_none());
    assert_eq!(registration.driver_request.status, JourneyStatus::Waiting);

    let placements = h
        .engine
        .create_passenger_request(Actor::passenger(Uuid::new_v4()), new_request())
        .await
        .unwrap();
    let pairing = placements[0].pairing.as_ref().expect("placement matched");
    assert_eq!(pairing.driver_request.id, registration.driver_request.id);
    assert_eq!(pairing.passenger_request.status, JourneyStatus::Requested);
}

#[tokio::test]
async fn concurrent_bids_on_one_decision_let_exactly_one_through() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;

    let (first, second) = tokio::join!(
        h.engine.bid(driver, decision_id, 900.0),
        h.engine.bid(driver, decision_id, 950.0),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert!(
        outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(AppError::Conflict(_))))
    );

    let decision = h.store.decision(decision_id).await.unwrap();
    assert_eq!(decision.status, JourneyStatus::AcceptedByDriver);
    assert_eq!(h.dispatcher.events_for(passenger.id).len(), 2);
}

#[tokio::test]
async fn only_bidder_cancelling_reverts_the_shipment_and_notifies() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    let records = h.engine.bid(driver, decision_id, 1000.0).await.unwrap();

    let cancellation = h
        .engine
        .cancel_driver_request(
            driver,
            records.driver_request.id,
            JourneyStatus::AcceptedByDriver,
            Some("truck broke down".to_string()),
        )
        .await
        .unwrap();

    assert_eq!(cancellation.driver_request.status, JourneyStatus::CancelledByDriver);
    assert_eq!(
        cancellation.decision.unwrap().status,
        JourneyStatus::CancelledByDriver
    );
    let shipment = h.store.passenger_request(request.id).await.unwrap();
    assert_eq!(shipment.status, JourneyStatus::Waiting);
    assert_eq!(shipment.seen.get(SeenKind::Cancellation), SeenState::Unseen);
    assert_eq!(
        event_types(&h.dispatcher.events_for(passenger.id)).last(),
        Some(&EventType::CancelledByDriver)
    );
}

#[tokio::test]
async fn walking_away_before_bidding_is_a_silent_rejection() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    let driver_request_id = h.store.decision(decision_id).await.unwrap().driver_request_id;

    let cancellation = h
        .engine
        .cancel_driver_request(driver, driver_request_id, JourneyStatus::Requested, None)
        .await
        .unwrap();

    assert_eq!(cancellation.driver_request.status, JourneyStatus::RejectedByDriver);
    let shipment = h.store.passenger_request(request.id).await.unwrap();
    assert_eq!(shipment.status, JourneyStatus::Waiting);
    assert_eq!(shipment.seen.get(SeenKind::Cancellation), SeenState::Unset);
    assert_eq!(
        event_types(&h.dispatcher.events_for(passenger.id)),
        vec![EventType::Matched]
    );
}

#[tokio::test]
async fn one_of_several_bidders_leaving_keeps_the_shipment_in_bidding() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let first = Actor::driver(Uuid::new_v4());
    let second = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let first_decision = match_driver(&h, first).await;
    let second_decision = match_driver(&h, second).await;
    assert_ne!(first_decision, second_decision);

    h.engine.bid(first, first_decision, 1000.0).await.unwrap();
    let records = h.engine.bid(second, second_decision, 1100.0).await.unwrap();
    assert_eq!(records.passenger_request.status, JourneyStatus::AcceptedByDriver);

    let first_request = h.store.decision(first_decision).await.unwrap().driver_request_id;
    h.engine
        .cancel_driver_request(first, first_request, JourneyStatus::AcceptedByDriver, None)
        .await
        .unwrap();

    let shipment = h.store.passenger_request(request.id).await.unwrap();
    assert_eq!(shipment.status, JourneyStatus::AcceptedByDriver);
    let second_records = h.store.linked_records(second_decision).await.unwrap();
    assert_eq!(second_records.decision.status, JourneyStatus::AcceptedByDriver);
}

#[tokio::test]
async fn accepting_one_bid_closes_the_others_and_leaves_their_requests() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let winner = Actor::driver(Uuid::new_v4());
    let loser = Actor::driver(Uuid::new_v4());
    place(&h, passenger).await;
    let winning = match_driver(&h, winner).await;
    let losing = match_driver(&h, loser).await;
    h.engine.bid(winner, winning, 1000.0).await.unwrap();
    h.engine.bid(loser, losing, 1200.0).await.unwrap();

    h.engine.accept_bidder(passenger, winning).await.unwrap();

    let lost = h.store.linked_records(losing).await.unwrap();
    assert_eq!(lost.decision.status, JourneyStatus::NotSelectedInBid);
    assert_eq!(lost.decision.seen.get(SeenKind::NotSelected), SeenState::Unseen);
    assert_eq!(lost.driver_request.status, JourneyStatus::AcceptedByDriver);
    assert_eq!(
        event_types(&h.dispatcher.events_for(loser.id)).last(),
        Some(&EventType::NotSelectedInBid)
    );

    // The losing driver closes their stale request; the shipment is not theirs anymore.
    let before = h.dispatcher.events_for(passenger.id).len();
    let cancellation = h
        .engine
        .cancel_driver_request(loser, lost.driver_request.id, JourneyStatus::AcceptedByDriver, None)
        .await
        .unwrap();
    assert!(cancellation.decision.is_none());
    assert_eq!(cancellation.driver_request.status, JourneyStatus::CancelledByDriver);
    assert_eq!(h.dispatcher.events_for(passenger.id).len(), before);
    let won = h.store.linked_records(winning).await.unwrap();
    assert_eq!(won.passenger_request.status, JourneyStatus::AcceptedByPassenger);
}

#[tokio::test]
async fn rejected_driver_is_not_offered_the_passenger_again() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    h.engine.bid(driver, decision_id, 5000.0).await.unwrap();

    let records = h.engine.reject_bidder(passenger, decision_id).await.unwrap();
    assert_eq!(records.decision.status, JourneyStatus::RejectedByPassenger);
    assert_eq!(records.driver_request.status, JourneyStatus::RejectedByPassenger);
    assert_eq!(records.passenger_request.status, JourneyStatus::Waiting);
    assert_eq!(
        event_types(&h.dispatcher.events_for(driver.id)).last(),
        Some(&EventType::BidRejected)
    );

    let registration = h
        .engine
        .register_availability(driver, availability())
        .await
        .unwrap();
    assert!(registration.pairing.is_none());
    let shipment = h.store.passenger_request(request.id).await.unwrap();
    assert_eq!(shipment.status, JourneyStatus::Waiting);
}

#[tokio::test]
async fn polling_a_waiting_shipment_searches_for_drivers_again() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let first = Actor::driver(Uuid::new_v4());
    let backup = Actor::driver(Uuid::new_v4());
    h.engine.register_availability(first, availability()).await.unwrap();
    h.engine.register_availability(backup, availability()).await.unwrap();

    let placements = h
        .engine
        .create_passenger_request(passenger, new_request())
        .await
        .unwrap();
    let pairing = placements[0].pairing.clone().expect("first driver matched");
    h.engine.reject_bidder(passenger, pairing.decision.id).await.unwrap();

    let view = h
        .engine
        .poll_passenger_request(passenger, pairing.passenger_request.id, Utc::now())
        .await
        .unwrap();
    assert_eq!(view.passenger_request.status, JourneyStatus::Requested);
    assert_eq!(view.decisions.len(), 2);
    assert!(view.replaced_request_id.is_none());
    let fresh = view
        .decisions
        .iter()
        .find(|decision| decision.status == JourneyStatus::Requested)
        .unwrap();
    let records = h.store.linked_records(fresh.id).await.unwrap();
    assert_ne!(records.driver_request.driver_id, pairing.driver_request.driver_id);
    assert!([first.id, backup.id].contains(&records.driver_request.driver_id));
}

#[tokio::test]
async fn unanswered_only_match_restarts_the_search() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;

    let report = h
        .engine
        .expire_unanswered(Utc::now() + Duration::seconds(301))
        .await
        .unwrap();
    assert_eq!(report.expired, vec![decision_id]);
    assert_eq!(report.replacements.len(), 1);
    assert_eq!(report.failed, 0);

    let records = h.store.linked_records(decision_id).await.unwrap();
    assert_eq!(records.decision.status, JourneyStatus::NoAnswerFromDriver);
    assert_eq!(records.driver_request.status, JourneyStatus::NoAnswerFromDriver);
    assert_eq!(records.passenger_request.status, JourneyStatus::NoAnswerFromDriver);

    let fresh = h.store.passenger_request(report.replacements[0]).await.unwrap();
    assert_ne!(fresh.id, request.id);
    assert_eq!(fresh.status, JourneyStatus::Waiting);
    assert_eq!(fresh.passenger_id, passenger.id);
    assert_eq!(
        event_types(&h.dispatcher.events_for(passenger.id)).last(),
        Some(&EventType::SearchRestarted)
    );
    assert_eq!(
        event_types(&h.dispatcher.events_for(driver.id)).last(),
        Some(&EventType::NoAnswerFromDriver)
    );
}

#[tokio::test]
async fn unanswered_match_beside_a_live_bid_leaves_the_shipment_alone() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let quick = Actor::driver(Uuid::new_v4());
    let silent = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let quick_decision = match_driver(&h, quick).await;
    let silent_decision = match_driver(&h, silent).await;
    h.engine.bid(quick, quick_decision, 800.0).await.unwrap();

    let report = h
        .engine
        .expire_unanswered(Utc::now() + Duration::seconds(301))
        .await
        .unwrap();
    assert_eq!(report.expired, vec![silent_decision]);
    assert!(report.replacements.is_empty());

    let shipment = h.store.passenger_request(request.id).await.unwrap();
    assert_eq!(shipment.status, JourneyStatus::AcceptedByDriver);
    assert_eq!(
        h.store.decision(quick_decision).await.unwrap().status,
        JourneyStatus::AcceptedByDriver
    );
}

#[tokio::test]
async fn fresh_matches_survive_the_sweep() {
    let h = harness();
    place(&h, Actor::passenger(Uuid::new_v4())).await;
    let decision_id = match_driver(&h, Actor::driver(Uuid::new_v4())).await;

    let report = h.engine.expire_unanswered(Utc::now()).await.unwrap();
    assert!(report.expired.is_empty());
    assert_eq!(
        h.store.decision(decision_id).await.unwrap().status,
        JourneyStatus::Requested
    );
}

#[tokio::test]
async fn acknowledging_a_match_does_not_restart_the_no_answer_timer() {
    let h = harness_with(EngineSettings {
        no_answer_timeout: Duration::milliseconds(100),
        ..EngineSettings::default()
    });
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    h.engine
        .acknowledge(driver, SeenTarget::Decision(decision_id), SeenKind::Rejection)
        .await
        .unwrap();

    let report = h.engine.expire_unanswered(Utc::now()).await.unwrap();
    assert_eq!(report.expired, vec![decision_id]);
    assert_eq!(
        h.store.decision(decision_id).await.unwrap().status,
        JourneyStatus::NoAnswerFromDriver
    );
}

#[tokio::test]
async fn polling_expires_a_match_acknowledged_after_the_timeout() {
    let h = harness_with(EngineSettings {
        no_answer_timeout: Duration::milliseconds(100),
        ..EngineSettings::default()
    });
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;

    tokio::time::sleep(std::time::Duration::from_millis(150)).await;
    h.engine
        .acknowledge(driver, SeenTarget::Decision(decision_id), SeenKind::Rejection)
        .await
        .unwrap();

    let view = h
        .engine
        .poll_passenger_request(passenger, request.id, Utc::now())
        .await
        .unwrap();
    assert_eq!(view.replaced_request_id, Some(request.id));
    assert_eq!(
        h.store.decision(decision_id).await.unwrap().status,
        JourneyStatus::NoAnswerFromDriver
    );
}

#[tokio::test]
async fn unrepresentable_no_answer_cutoff_is_an_error() {
    let h = harness_with(EngineSettings {
        no_answer_timeout: Duration::MAX,
        ..EngineSettings::default()
    });
    let passenger = Actor::passenger(Uuid::new_v4());
    let request = place(&h, passenger).await;

    let err = h.engine.expire_unanswered(Utc::now()).await.unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
    let err = h
        .engine
        .poll_passenger_request(passenger, request.id, Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Internal(_)));
}

#[tokio::test]
async fn passenger_cancellation_cascades_to_every_driver() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let first = Actor::driver(Uuid::new_v4());
    let second = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let first_decision = match_driver(&h, first).await;
    let second_decision = match_driver(&h, second).await;

    let cancellation = h
        .engine
        .cancel_passenger_request(
            passenger,
            request.id,
            JourneyStatus::Requested,
            Some("plans changed".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(
        cancellation.passenger_request.status,
        JourneyStatus::CancelledByPassenger
    );
    assert_eq!(cancellation.decisions.len(), 2);

    for (driver, decision_id) in [(first, first_decision), (second, second_decision)] {
        let records = h.store.linked_records(decision_id).await.unwrap();
        assert_eq!(records.decision.status, JourneyStatus::CancelledByPassenger);
        assert_eq!(records.driver_request.status, JourneyStatus::CancelledByPassenger);
        assert_eq!(
            records.driver_request.seen.get(SeenKind::Cancellation),
            SeenState::Unseen
        );
        assert_eq!(
            event_types(&h.dispatcher.events_for(driver.id)).last(),
            Some(&EventType::CancelledByPassenger)
        );
    }

    let records = h.audit.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].passenger_request_id, request.id);
    assert_eq!(records[0].affected_decisions.len(), 2);
    assert_eq!(records[0].reason.as_deref(), Some("plans changed"));
}

#[tokio::test]
async fn stale_expected_status_is_a_conflict_and_writes_nothing() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;

    let err = h
        .engine
        .cancel_passenger_request(passenger, request.id, JourneyStatus::Waiting, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert!(err.is_retryable());

    let records = h.store.linked_records(decision_id).await.unwrap();
    assert_eq!(records.decision.status, JourneyStatus::Requested);
    assert_eq!(records.passenger_request.status, JourneyStatus::Requested);
    assert!(h.audit.records().is_empty());
}

#[tokio::test]
async fn drivers_and_passengers_cannot_act_on_the_other_side() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    let driver_request_id = h.store.decision(decision_id).await.unwrap().driver_request_id;

    let err = h
        .engine
        .cancel_passenger_request(driver, request.id, JourneyStatus::Requested, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Ownership(_)));

    let err = h
        .engine
        .cancel_driver_request(passenger, driver_request_id, JourneyStatus::Requested, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Ownership(_)));

    let stranger = Actor::driver(Uuid::new_v4());
    let err = h.engine.bid(stranger, decision_id, 100.0).await.unwrap_err();
    assert!(matches!(err, AppError::Ownership(_)));
}

#[tokio::test]
async fn admin_cancellation_notifies_both_parties() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let admin = Actor::admin(Uuid::new_v4());
    place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    let driver_request_id = h.store.decision(decision_id).await.unwrap().driver_request_id;

    h.engine
        .cancel_driver_request(admin, driver_request_id, JourneyStatus::Requested, None)
        .await
        .unwrap();

    let records = h.store.linked_records(decision_id).await.unwrap();
    assert_eq!(records.decision.status, JourneyStatus::CancelledByAdmin);
    assert_eq!(records.decision.decided_by, Some(admin.role));
    assert_eq!(
        event_types(&h.dispatcher.events_for(passenger.id)).last(),
        Some(&EventType::CancelledByAdmin)
    );
    assert_eq!(
        event_types(&h.dispatcher.events_for(driver.id)).last(),
        Some(&EventType::CancelledByAdmin)
    );
}

#[tokio::test]
async fn one_open_driver_request_per_driver() {
    let h = harness();
    let driver = Actor::driver(Uuid::new_v4());
    h.engine.register_availability(driver, availability()).await.unwrap();

    let err = h
        .engine
        .register_availability(driver, availability())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(h.store.counts().await.driver_requests, 1);
}

#[tokio::test]
async fn street_pickup_creates_a_started_chain() {
    let h = harness();
    let driver = Actor::driver(Uuid::new_v4());
    let passenger_id = Uuid::new_v4();

    let records = h
        .engine
        .street_pickup(
            driver,
            StreetPickup {
                passenger_id,
                vehicle_type_id: truck(),
                origin: pickup_point(),
                destination: GeoPoint { lat: 8.55, lng: 39.27 },
                origin_label: String::new(),
                destination_label: String::new(),
                shipment: cement(),
                fare: 700.0,
            },
        )
        .await
        .unwrap();

    assert_eq!(records.decision.status, JourneyStatus::JourneyStarted);
    assert_eq!(records.passenger_request.status, JourneyStatus::JourneyStarted);
    assert_eq!(records.driver_request.status, JourneyStatus::JourneyStarted);
    assert_eq!(records.journey.unwrap().fare, Some(700.0));
    assert_eq!(
        event_types(&h.dispatcher.events_for(passenger_id)),
        vec![EventType::JourneyStarted]
    );

    let completed = h
        .engine
        .complete_journey(driver, records.decision.id, pickup_point())
        .await
        .unwrap();
    assert_eq!(completed.decision.status, JourneyStatus::JourneyCompleted);
}

#[tokio::test]
async fn admin_can_close_an_accepted_journey() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    h.engine.bid(driver, decision_id, 1000.0).await.unwrap();
    h.engine.accept_bidder(passenger, decision_id).await.unwrap();

    let err = h.engine.complete_by_admin(driver, decision_id).await.unwrap_err();
    assert!(matches!(err, AppError::Ownership(_)));

    let records = h
        .engine
        .complete_by_admin(Actor::admin(Uuid::new_v4()), decision_id)
        .await
        .unwrap();
    assert_eq!(records.decision.status, JourneyStatus::CompletedByAdmin);
    assert_eq!(records.passenger_request.status, JourneyStatus::CompletedByAdmin);
    assert_eq!(records.driver_request.status, JourneyStatus::CompletedByAdmin);
    assert!(records.journey.is_none());
    assert_eq!(
        event_types(&h.dispatcher.events_for(driver.id)).last(),
        Some(&EventType::CompletedByAdmin)
    );
}

#[tokio::test]
async fn closed_driver_requests_can_be_deleted_and_seen_flags_acknowledged() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    let driver_request_id = h.store.decision(decision_id).await.unwrap().driver_request_id;

    let err = h
        .engine
        .delete_driver_request(driver, driver_request_id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    h.engine
        .cancel_passenger_request(passenger, request.id, JourneyStatus::Requested, None)
        .await
        .unwrap();
    let deleted = h
        .engine
        .delete_driver_request(driver, driver_request_id)
        .await
        .unwrap();
    assert!(deleted.deleted_at.is_some());

    let state = h
        .engine
        .acknowledge(
            driver,
            SeenTarget::DriverRequest(driver_request_id),
            SeenKind::Cancellation,
        )
        .await
        .unwrap();
    assert_eq!(state, SeenState::Seen);

    let err = h
        .engine
        .acknowledge(
            passenger,
            SeenTarget::DriverRequest(driver_request_id),
            SeenKind::Cancellation,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Ownership(_)));
}

struct Unreachable;

impl NotificationDispatcher for Unreachable {
    fn dispatch(&self, _event: &NotificationEvent) -> Result<(), DispatchError> {
        Err(DispatchError("push gateway unavailable".to_string()))
    }
}

#[tokio::test]
async fn failed_delivery_does_not_undo_the_transition() {
    let store = Arc::new(RequestStore::new());
    let metrics = Metrics::new();
    let engine = Engine::new(
        store.clone(),
        Arc::new(Unreachable),
        Arc::new(InMemoryAudit::new()),
        EngineSettings::default(),
        metrics.clone(),
    );
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());

    engine
        .create_passenger_request(passenger, new_request())
        .await
        .unwrap();
    let registration = engine
        .register_availability(driver, availability())
        .await
        .unwrap();

    let decision_id = registration.pairing.unwrap().decision.id;
    assert_eq!(
        store.decision(decision_id).await.unwrap().status,
        JourneyStatus::Requested
    );
    let body = metrics.encode().unwrap();
    assert!(body.contains("notifications_total{outcome=\"failed\"} 2"));
}

async fn two_bids(h: &Harness, passenger: Actor, first: Actor, second: Actor) -> (Uuid, Uuid) {
    place(h, passenger).await;
    let first_decision = match_driver(h, first).await;
    let second_decision = match_driver(h, second).await;
    h.engine.bid(first, first_decision, 1000.0).await.unwrap();
    h.engine.bid(second, second_decision, 1100.0).await.unwrap();
    (first_decision, second_decision)
}

fn one_ok_one_conflict<T>(outcomes: &[Result<T, AppError>]) {
    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Err(AppError::Conflict(_))))
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_accepts_on_sibling_bids_select_exactly_one() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let (first_decision, second_decision) = two_bids(
        &h,
        passenger,
        Actor::driver(Uuid::new_v4()),
        Actor::driver(Uuid::new_v4()),
    )
    .await;

    let tasks = [first_decision, second_decision].map(|decision_id| {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.accept_bidder(passenger, decision_id).await })
    });
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    one_ok_one_conflict(&outcomes);

    let mut statuses = vec![
        h.store.decision(first_decision).await.unwrap().status,
        h.store.decision(second_decision).await.unwrap().status,
    ];
    statuses.sort_by_key(|status| status.code());
    assert_eq!(
        statuses,
        vec![JourneyStatus::AcceptedByPassenger, JourneyStatus::NotSelectedInBid]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn starting_the_same_journey_twice_creates_one_journey() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    h.engine.bid(driver, decision_id, 1000.0).await.unwrap();
    h.engine.accept_bidder(passenger, decision_id).await.unwrap();

    let tasks = [0, 1].map(|_| {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.start_journey(driver, decision_id, near_pickup()).await })
    });
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    one_ok_one_conflict(&outcomes);

    let counts = h.store.counts().await;
    assert_eq!(counts.journeys, 1);
    assert_eq!(counts.route_points, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_while_bidding_lets_only_one_side_win() {
    let h = harness();
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());
    let request = place(&h, passenger).await;
    let decision_id = match_driver(&h, driver).await;
    let driver_request_id = h.store.decision(decision_id).await.unwrap().driver_request_id;

    let bidding = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.bid(driver, decision_id, 1000.0).await.map(|_| ()) })
    };
    let cancelling = {
        let engine = h.engine.clone();
        tokio::spawn(async move {
            engine
                .cancel_driver_request(driver, driver_request_id, JourneyStatus::Requested, None)
                .await
                .map(|_| ())
        })
    };
    let outcomes = [bidding.await.unwrap(), cancelling.await.unwrap()];
    one_ok_one_conflict(&outcomes);

    let records = h.store.linked_records(decision_id).await.unwrap();
    let shipment = h.store.passenger_request(request.id).await.unwrap();
    if outcomes[0].is_ok() {
        assert_eq!(records.decision.status, JourneyStatus::AcceptedByDriver);
        assert_eq!(records.driver_request.status, JourneyStatus::AcceptedByDriver);
        assert_eq!(shipment.status, JourneyStatus::AcceptedByDriver);
    } else {
        assert_eq!(records.decision.status, JourneyStatus::RejectedByDriver);
        assert_eq!(records.driver_request.status, JourneyStatus::RejectedByDriver);
        assert_eq!(shipment.status, JourneyStatus::Waiting);
    }
}

/// Wraps the in-process store and counts the units of work it runs.
struct CountingStore {
    inner: RequestStore,
    units: AtomicUsize,
}

impl RecordStore for CountingStore {
    fn transact<'a>(
        &'a self,
        op: &'static str,
        timeout: std::time::Duration,
        work: UnitOfWork<'a>,
    ) -> BoxFuture<'a, Result<(), AppError>> {
        self.units.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.inner.run(op, timeout, work))
    }

    fn passenger_request(&self, id: Uuid) -> BoxFuture<'_, Result<PassengerRequest, AppError>> {
        RecordStore::passenger_request(&self.inner, id)
    }

    fn driver_request(&self, id: Uuid) -> BoxFuture<'_, Result<DriverRequest, AppError>> {
        RecordStore::driver_request(&self.inner, id)
    }

    fn decision(&self, id: Uuid) -> BoxFuture<'_, Result<JourneyDecision, AppError>> {
        RecordStore::decision(&self.inner, id)
    }

    fn linked_records(&self, decision_id: Uuid) -> BoxFuture<'_, Result<LinkedRecordSet, AppError>> {
        RecordStore::linked_records(&self.inner, decision_id)
    }

    fn acknowledge(&self, target: SeenTarget, kind: SeenKind) -> BoxFuture<'_, Result<SeenState, AppError>> {
        RecordStore::acknowledge(&self.inner, target, kind)
    }
}

#[tokio::test]
async fn engine_runs_against_any_record_store() {
    let store = Arc::new(CountingStore {
        inner: RequestStore::new(),
        units: AtomicUsize::new(0),
    });
    let engine = Engine::new(
        store.clone(),
        Arc::new(BroadcastDispatcher::new(16)),
        Arc::new(InMemoryAudit::new()),
        EngineSettings::default(),
        Metrics::new(),
    );
    let passenger = Actor::passenger(Uuid::new_v4());
    let driver = Actor::driver(Uuid::new_v4());

    engine
        .create_passenger_request(passenger, new_request())
        .await
        .unwrap();
    let registration = engine
        .register_availability(driver, availability())
        .await
        .unwrap();
    let decision_id = registration.pairing.unwrap().decision.id;
    engine.bid(driver, decision_id, 1000.0).await.unwrap();

    assert_eq!(store.units.load(Ordering::SeqCst), 3);
    let records = engine.linked_records(passenger, decision_id).await.unwrap();
    assert_eq!(records.decision.status, JourneyStatus::AcceptedByDriver);
    assert_eq!(store.inner.counts().await.decisions, 1);
}
