use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{FacilityState, Ms, TimeRange};

/// Margin reserved around every candidate booking, in minutes. Applied to
/// the candidate's window only — existing bookings keep their raw windows,
/// so pre-existing tight pairs are never retroactively flagged.
pub const CONFLICT_BUFFER_MIN: i32 = 30;

/// The resolver's verdict: surviving conflicts split by whether the other
/// booking is already a commitment (Approved) or still contention
/// (Pending and any other non-terminal status).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictSet {
    pub approved: Vec<Ulid>,
    pub pending: Vec<Ulid>,
}

impl ConflictSet {
    pub fn is_empty(&self) -> bool {
        self.approved.is_empty() && self.pending.is_empty()
    }
}

/// Resolve conflicts for a candidate window against one facility's
/// requests. Pure function of its inputs — usable both under the engine's
/// write lock and as a pre-flight check on a snapshot.
///
/// Exclusion order: different date, terminal status (Rejected/Canceled),
/// the candidate's own prior record when editing. Survivors are tested
/// with the buffered overlap predicate.
pub fn find_conflicts(
    fs: &FacilityState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> ConflictSet {
    let mut set = ConflictSet::default();
    for existing in fs.on_date(date) {
        if existing.status.is_terminal() {
            continue;
        }
        if Some(existing.id) == exclude {
            continue;
        }
        if !range.conflicts_with(&existing.range, CONFLICT_BUFFER_MIN) {
            continue;
        }
        if existing.status.is_approved() {
            set.approved.push(existing.id);
        } else {
            set.pending.push(existing.id);
        }
    }
    set
}

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}
