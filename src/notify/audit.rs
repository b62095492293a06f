use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::actor::ActorRole;
use crate::notify::DispatchError;
use crate::status::JourneyStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationRecord {
    pub passenger_request_id: Uuid,
    pub cancelled_by: Uuid,
    pub actor_role: ActorRole,
    pub status: JourneyStatus,
    pub reason: Option<String>,
    pub affected_decisions: Vec<Uuid>,
    pub recorded_at: DateTime<Utc>,
}

/// Cancellation history sink, written after commit.
pub trait CancellationAudit: Send + Sync {
    fn record(&self, record: CancellationRecord) -> Result<(), DispatchError>;
}

#[derive(Debug, Default)]
pub struct InMemoryAudit {
    records: Mutex<Vec<CancellationRecord>>,
}

impl InMemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<CancellationRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl CancellationAudit for InMemoryAudit {
    fn record(&self, record: CancellationRecord) -> Result<(), DispatchError> {
        self.records
            .lock()
            .map_err(|err| DispatchError(format!("audit log poisoned: {err}")))?
            .push(record);
        Ok(())
    }
}
