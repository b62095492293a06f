use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::classifier::{PassengerReversion, passenger_reversion};
use crate::engine::{Committed, Engine, ensure_in_step};
use crate::error::AppError;
use crate::models::actor::ActorRole;
use crate::models::decision::JourneyDecision;
use crate::models::event::{EventType, LinkedIds, NotificationEvent};
use crate::models::passenger_request::PassengerRequest;
use crate::models::seen::SeenKind;
use crate::status::JourneyStatus;
use crate::store::Transaction;

pub(crate) struct Expiry {
    pub(crate) replacement: Option<PassengerRequest>,
    pub(crate) events: Vec<NotificationEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub expired: Vec<Uuid>,
    pub replacements: Vec<Uuid>,
    pub failed: usize,
}

/// Closes a `requested` decision the driver never answered. When it was the
/// shipment's only open decision, the shipment is closed too and a fresh
/// `waiting` copy starts a new match episode.
pub(crate) fn expire_decision(tx: &mut dyn Transaction, decision: &JourneyDecision) -> Result<Expiry, AppError> {
    let no_answer = JourneyStatus::NoAnswerFromDriver;
    let driver_request = tx.driver_request(decision.driver_request_id)?;
    ensure_in_step(decision, &driver_request)?;
    let passenger_request = tx.passenger_request(decision.passenger_request_id)?;
    let open_decisions = tx.count_open_decisions(passenger_request.id);
    let journey = tx.journey_for_decision(decision.id);

    let decision = tx.update_decision(decision.id, &[JourneyStatus::Requested], |row| {
        row.decide(no_answer, ActorRole::System);
    })?;

    let replacement = match passenger_reversion(open_decisions) {
        PassengerReversion::RevertToWaiting => {
            let closed = tx.update_passenger_request(passenger_request.id, &[passenger_request.status], |row| {
                row.status = no_answer;
            })?;
            let fresh = closed.reopened();
            tx.insert_passenger_request(fresh.clone())?;
            Some(fresh)
        }
        PassengerReversion::Unchanged => None,
    };

    tx.update_driver_request(driver_request.id, &[JourneyStatus::Requested], |row| {
        row.status = no_answer;
        row.seen.raise(SeenKind::Cancellation);
    })?;
    if let Some(journey) = &journey {
        tx.update_journey(journey.id, &[journey.status], |row| {
            row.status = no_answer;
            row.ended_at = Some(Utc::now());
        })?;
    }

    let linked = LinkedIds::of_decision(&decision).with_journey(journey.map(|journey| journey.id));
    let mut events = vec![NotificationEvent::new(
        EventType::NoAnswerFromDriver,
        driver_request.driver_id,
        no_answer,
        linked.clone(),
        ActorRole::System,
    )];
    if let Some(fresh) = &replacement {
        events.push(NotificationEvent::new(
            EventType::SearchRestarted,
            fresh.passenger_id,
            fresh.status,
            LinkedIds {
                passenger_request_id: Some(fresh.id),
                ..linked
            },
            ActorRole::System,
        ));
    }

    info!(
        decision_id = %decision.id,
        replacement = ?replacement.as_ref().map(|fresh| fresh.id),
        "unanswered match expired"
    );
    Ok(Expiry { replacement, events })
}

impl Engine {
    /// One sweep pass. Each stale decision is expired in its own unit of
    /// work, so one failure does not hold back the rest.
    pub async fn expire_unanswered(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let cutoff = self.no_answer_cutoff(now)?;
        let candidates: Vec<Uuid> = self
            .transact("no_answer_scan", self.settings.tx_timeout, move |tx| {
                let ids: Vec<Uuid> = tx
                    .unanswered_decisions(cutoff)
                    .into_iter()
                    .map(|decision| decision.id)
                    .collect();
                Ok(Committed::new(ids))
            })
            .await?;

        let mut report = SweepReport::default();
        for decision_id in candidates {
            let outcome = self
                .transact("no_answer", self.settings.wide_tx_timeout, move |tx| {
                    let decision = tx.decision(decision_id)?;
                    // Answered or cancelled since the scan.
                    if decision.status != JourneyStatus::Requested || decision.created_at > cutoff {
                        return Ok(Committed::new(None));
                    }
                    let expiry = expire_decision(tx, &decision)?;
                    let replacement = expiry.replacement.as_ref().map(|fresh| fresh.id);
                    Ok(Committed::new(Some(replacement)).with_events(expiry.events))
                })
                .await;

            match outcome {
                Ok(Some(replacement)) => {
                    self.metrics.unanswered_expired_total.inc();
                    report.expired.push(decision_id);
                    report.replacements.extend(replacement);
                }
                Ok(None) => debug!(decision_id = %decision_id, "decision moved on before expiry"),
                Err(err) => {
                    report.failed += 1;
                    warn!(decision_id = %decision_id, error = %err, "failed to expire decision");
                }
            }
        }

        Ok(report)
    }
}

pub async fn run_no_answer_sweep(engine: Arc<Engine>, every: Duration) {
    info!(interval_secs = every.as_secs(), "no-answer sweep started");
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;
        match engine.expire_unanswered(Utc::now()).await {
            Ok(report) if report.expired.is_empty() && report.failed == 0 => {
                debug!("no unanswered matches");
            }
            Ok(report) => info!(
                expired = report.expired.len(),
                replacements = report.replacements.len(),
                failed = report.failed,
                "no-answer sweep finished"
            ),
            Err(err) => error!(error = %err, "no-answer sweep failed"),
        }
    }
}
