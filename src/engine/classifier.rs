use crate::error::AppError;
use crate::models::actor::ActorRole;
use crate::models::event::EventType;
use crate::models::seen::SeenKind;
use crate::status::JourneyStatus;

/// How a driver-side termination lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub status: JourneyStatus,
    /// `None` means the passenger is not told.
    pub passenger_event: Option<EventType>,
    pub passenger_flag: Option<SeenKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassengerReversion {
    RevertToWaiting,
    Unchanged,
}

/// Before the driver bid nothing was promised, so walking away is a
/// rejection. Afterwards it is a broken commitment.
pub fn classify_driver_cancellation(current: JourneyStatus) -> JourneyStatus {
    if current < JourneyStatus::AcceptedByDriver {
        JourneyStatus::RejectedByDriver
    } else {
        JourneyStatus::CancelledByDriver
    }
}

pub fn terminate_driver_side(role: ActorRole, current: JourneyStatus) -> Result<Termination, AppError> {
    let termination = match role {
        ActorRole::Driver => match classify_driver_cancellation(current) {
            JourneyStatus::RejectedByDriver => Termination {
                status: JourneyStatus::RejectedByDriver,
                passenger_event: None,
                passenger_flag: None,
            },
            status => Termination {
                status,
                passenger_event: Some(EventType::CancelledByDriver),
                passenger_flag: Some(SeenKind::Cancellation),
            },
        },
        ActorRole::Admin => Termination {
            status: JourneyStatus::CancelledByAdmin,
            passenger_event: Some(EventType::CancelledByAdmin),
            passenger_flag: Some(SeenKind::Cancellation),
        },
        ActorRole::System => Termination {
            status: JourneyStatus::CancelledBySystem,
            passenger_event: Some(EventType::CancelledBySystem),
            passenger_flag: Some(SeenKind::Cancellation),
        },
        ActorRole::Passenger => {
            return Err(AppError::Ownership(
                "passengers cannot cancel a driver request".to_string(),
            ));
        }
    };
    Ok(termination)
}

/// Terminal status and driver-facing event for a passenger-side cancellation.
pub fn terminate_passenger_side(role: ActorRole) -> Result<(JourneyStatus, EventType), AppError> {
    match role {
        ActorRole::Passenger => Ok((JourneyStatus::CancelledByPassenger, EventType::CancelledByPassenger)),
        ActorRole::Admin => Ok((JourneyStatus::CancelledByAdmin, EventType::CancelledByAdmin)),
        ActorRole::System => Ok((JourneyStatus::CancelledBySystem, EventType::CancelledBySystem)),
        ActorRole::Driver => Err(AppError::Ownership(
            "drivers cannot cancel a passenger request".to_string(),
        )),
    }
}

/// `open_decisions` must be counted in the same transaction as the writes
/// and include the decision being terminated.
pub fn passenger_reversion(open_decisions: usize) -> PassengerReversion {
    if open_decisions == 1 {
        PassengerReversion::RevertToWaiting
    } else {
        PassengerReversion::Unchanged
    }
}
