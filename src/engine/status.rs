use crate::model::BookingStatus;

use super::EngineError;

impl BookingStatus {
    /// Terminal states accept no further transitions and never conflict.
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Rejected | BookingStatus::Canceled)
    }

    pub fn is_approved(self) -> bool {
        matches!(self, BookingStatus::Approved)
    }
}

/// The explicit transition table. Pending may move to any decision;
/// Approved may still be canceled; nothing ever returns to Pending and
/// nothing leaves a terminal state. A transition to the current status is
/// an idempotent no-op and allowed.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    if from == to {
        return true;
    }
    match (from, to) {
        (Pending, Approved) | (Pending, Rejected) | (Pending, Canceled) => true,
        (Approved, Canceled) => true,
        _ => false,
    }
}

/// Validate a requested transition, failing with a defined error rather
/// than silently writing through a terminal state.
pub fn check_transition(from: BookingStatus, to: BookingStatus) -> Result<(), EngineError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}
