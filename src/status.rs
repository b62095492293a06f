use std::fmt;

use serde::{Deserialize, Serialize};

/// Status vocabulary shared by driver requests, passenger requests, journey
/// decisions and journeys. Not every code applies to every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JourneyStatus {
    Waiting,
    Requested,
    AcceptedByDriver,
    AcceptedByPassenger,
    JourneyStarted,
    JourneyCompleted,
    CancelledByPassenger,
    RejectedByPassenger,
    CancelledByDriver,
    CancelledByAdmin,
    CompletedByAdmin,
    CancelledBySystem,
    NoAnswerFromDriver,
    NotSelectedInBid,
    RejectedByDriver,
}

/// Forward moves of the journey lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AnnounceAvailability,
    Match,
    Bid,
    AcceptBidder,
    Start,
    Complete,
}

impl JourneyStatus {
    pub const ALL: [JourneyStatus; 15] = [
        JourneyStatus::Waiting,
        JourneyStatus::Requested,
        JourneyStatus::AcceptedByDriver,
        JourneyStatus::AcceptedByPassenger,
        JourneyStatus::JourneyStarted,
        JourneyStatus::JourneyCompleted,
        JourneyStatus::CancelledByPassenger,
        JourneyStatus::RejectedByPassenger,
        JourneyStatus::CancelledByDriver,
        JourneyStatus::CancelledByAdmin,
        JourneyStatus::CompletedByAdmin,
        JourneyStatus::CancelledBySystem,
        JourneyStatus::NoAnswerFromDriver,
        JourneyStatus::NotSelectedInBid,
        JourneyStatus::RejectedByDriver,
    ];

    /// Statuses a passenger request can be discovered in by a searching driver.
    pub const MATCHABLE: [JourneyStatus; 3] = [
        JourneyStatus::Waiting,
        JourneyStatus::Requested,
        JourneyStatus::AcceptedByDriver,
    ];

    pub fn code(self) -> i16 {
        match self {
            JourneyStatus::Waiting => 1,
            JourneyStatus::Requested => 2,
            JourneyStatus::AcceptedByDriver => 3,
            JourneyStatus::AcceptedByPassenger => 4,
            JourneyStatus::JourneyStarted => 5,
            JourneyStatus::JourneyCompleted => 6,
            JourneyStatus::CancelledByPassenger => 7,
            JourneyStatus::RejectedByPassenger => 8,
            JourneyStatus::CancelledByDriver => 9,
            JourneyStatus::CancelledByAdmin => 10,
            JourneyStatus::CompletedByAdmin => 11,
            JourneyStatus::CancelledBySystem => 12,
            JourneyStatus::NoAnswerFromDriver => 13,
            JourneyStatus::NotSelectedInBid => 14,
            JourneyStatus::RejectedByDriver => 15,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.code() == code)
    }

    /// Open statuses are the happy path up to and including a started journey.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            JourneyStatus::Waiting
                | JourneyStatus::Requested
                | JourneyStatus::AcceptedByDriver
                | JourneyStatus::AcceptedByPassenger
                | JourneyStatus::JourneyStarted
        )
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }

    /// Between a match and the passenger committing to one driver.
    pub fn is_bid_stage(self) -> bool {
        matches!(
            self,
            JourneyStatus::Requested | JourneyStatus::AcceptedByDriver
        )
    }

    /// A driver committed to the job once they bid.
    pub fn is_committed(self) -> bool {
        self.is_open() && self >= JourneyStatus::AcceptedByDriver
    }
}

impl fmt::Display for JourneyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// The only authority on legal forward transitions.
pub fn next_status(trigger: Trigger, current: Option<JourneyStatus>) -> Option<JourneyStatus> {
    use JourneyStatus::*;

    match (trigger, current) {
        (Trigger::AnnounceAvailability, None) => Some(Waiting),
        (Trigger::Match, Some(Waiting)) => Some(Requested),
        (Trigger::Bid, Some(Requested)) => Some(AcceptedByDriver),
        (Trigger::AcceptBidder, Some(AcceptedByDriver)) => Some(AcceptedByPassenger),
        (Trigger::Start, Some(AcceptedByPassenger)) => Some(JourneyStarted),
        (Trigger::Complete, Some(JourneyStarted)) => Some(JourneyCompleted),
        _ => None,
    }
}

/// The status a record must currently hold for `trigger` to apply.
pub fn required_status(trigger: Trigger) -> Option<JourneyStatus> {
    JourneyStatus::ALL
        .into_iter()
        .find(|status| next_status(trigger, Some(*status)).is_some())
}

#[cfg(test)]
mod tests {
    use super::{JourneyStatus, Trigger, next_status, required_status};

    #[test]
    fn codes_round_trip_through_the_table() {
        for status in JourneyStatus::ALL {
            assert_eq!(JourneyStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JourneyStatus::from_code(0), None);
        assert_eq!(JourneyStatus::from_code(16), None);
    }

    #[test]
    fn only_happy_path_before_completion_is_open() {
        let open: Vec<i16> = JourneyStatus::ALL
            .into_iter()
            .filter(|status| status.is_open())
            .map(JourneyStatus::code)
            .collect();
        assert_eq!(open, vec![1, 2, 3, 4, 5]);
        assert!(JourneyStatus::JourneyCompleted.is_terminal());
        assert!(JourneyStatus::NotSelectedInBid.is_terminal());
    }

    #[test]
    fn forward_transitions_follow_the_lifecycle() {
        assert_eq!(
            next_status(Trigger::AnnounceAvailability, None),
            Some(JourneyStatus::Waiting)
        );
        assert_eq!(
            next_status(Trigger::Bid, Some(JourneyStatus::Requested)),
            Some(JourneyStatus::AcceptedByDriver)
        );
        assert_eq!(
            next_status(Trigger::Complete, Some(JourneyStatus::JourneyStarted)),
            Some(JourneyStatus::JourneyCompleted)
        );
        assert_eq!(next_status(Trigger::Bid, Some(JourneyStatus::Waiting)), None);
        assert_eq!(
            next_status(Trigger::Start, Some(JourneyStatus::AcceptedByDriver)),
            None
        );
    }

    #[test]
    fn required_status_is_derived_from_the_table() {
        assert_eq!(required_status(Trigger::Match), Some(JourneyStatus::Waiting));
        assert_eq!(
            required_status(Trigger::AcceptBidder),
            Some(JourneyStatus::AcceptedByDriver)
        );
        assert_eq!(required_status(Trigger::AnnounceAvailability), None);
    }

    #[test]
    fn commitment_starts_at_driver_acceptance() {
        assert!(!JourneyStatus::Requested.is_committed());
        assert!(JourneyStatus::AcceptedByDriver.is_committed());
        assert!(JourneyStatus::JourneyStarted.is_committed());
        assert!(!JourneyStatus::CancelledByDriver.is_committed());
    }
}
