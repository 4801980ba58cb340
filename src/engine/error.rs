use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    UsernameTaken(String),
    /// The candidate window overlaps at least one Approved booking.
    /// Never overridable — an Approved booking always wins.
    ApprovedConflict(Vec<Ulid>),
    /// The candidate window overlaps only not-yet-decided bookings.
    /// Recoverable: resubmit with the override flag.
    OverrideRequired(Vec<Ulid>),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    /// Malformed schedule input (bad `HH:MM`, inverted range).
    InvalidTime(String),
    InvalidInput(&'static str),
    PermissionDenied(&'static str),
    /// Facility still holds requests that are neither Rejected nor Canceled.
    FacilityInUse(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UsernameTaken(name) => write!(f, "username already exists: {name}"),
            EngineError::ApprovedConflict(ids) => {
                write!(f, "conflicts with approved booking(s): ")?;
                fmt_ids(f, ids)
            }
            EngineError::OverrideRequired(ids) => {
                write!(f, "conflicts with pending booking(s), override required: ")?;
                fmt_ids(f, ids)
            }
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::InvalidTime(msg) => f.write_str(msg),
            EngineError::InvalidInput(what) => write!(f, "invalid input: {what}"),
            EngineError::PermissionDenied(op) => write!(f, "permission denied: {op}"),
            EngineError::FacilityInUse(id) => {
                write!(f, "cannot delete facility {id}: active requests remain")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

fn fmt_ids(f: &mut std::fmt::Formatter<'_>, ids: &[Ulid]) -> std::fmt::Result {
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{id}")?;
    }
    Ok(())
}

impl std::error::Error for EngineError {}
