use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds — used for creation timestamps only.
pub type Ms = i64;

/// Boundary validation failures for schedule input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeError {
    /// Not a valid `HH:MM` wall-clock string.
    InvalidTimeFormat(String),
    /// Range where the start does not precede the end.
    InvalidRange { start: TimeOfDay, end: TimeOfDay },
}

impl fmt::Display for TimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeError::InvalidTimeFormat(s) => {
                write!(f, "invalid time format: {s:?} (expected HH:MM)")
            }
            TimeError::InvalidRange { start, end } => {
                write!(f, "invalid time range: {start} must be before {end}")
            }
        }
    }
}

impl std::error::Error for TimeError {}

/// Wall-clock time of day, stored as minutes since midnight.
///
/// Parsed strictly from `HH:MM` — malformed schedules are rejected here,
/// before any interval arithmetic sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hours: u16, minutes: u16) -> Result<Self, TimeError> {
        if hours >= 24 || minutes >= 60 {
            return Err(TimeError::InvalidTimeFormat(format!("{hours:02}:{minutes:02}")));
        }
        Ok(Self(hours * 60 + minutes))
    }

    fn from_minutes(minutes: u16) -> Self {
        debug_assert!(minutes < 24 * 60);
        Self(minutes)
    }

    /// Minute offset, widened so buffer arithmetic can go negative.
    pub fn minutes(self) -> i32 {
        i32::from(self.0)
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeError;

    fn from_str(s: &str) -> Result<Self, TimeError> {
        let malformed = || TimeError::InvalidTimeFormat(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(malformed)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(malformed());
        }
        if !h.bytes().all(|b| b.is_ascii_digit()) || !m.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let hours: u16 = h.parse().map_err(|_| malformed())?;
        let minutes: u16 = m.parse().map_err(|_| malformed())?;
        Self::from_hm(hours, minutes).map_err(|_| malformed())
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

/// A booking's wall-clock window on its date. Half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl TimeRange {
    pub fn new(start: TimeOfDay, end: TimeOfDay) -> Result<Self, TimeError> {
        if start >= end {
            return Err(TimeError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn duration_min(&self) -> i32 {
        self.end.minutes() - self.start.minutes()
    }

    /// Buffered conflict test: `self` is the candidate, `existing` an
    /// already recorded booking. The buffer widens the candidate's window
    /// only — existing bookings are never re-tested against each other.
    pub fn conflicts_with(&self, existing: &TimeRange, buffer_min: i32) -> bool {
        let cand_start = self.start.minutes() - buffer_min;
        let cand_end = self.end.minutes() + buffer_min;
        !(cand_end <= existing.start.minutes() || cand_start >= existing.end.minutes())
    }
}

/// Lifecycle of a booking request. Pending is initial; Rejected and
/// Canceled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Approved => "Approved",
            BookingStatus::Rejected => "Rejected",
            BookingStatus::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// One scheduled (or requested) use of a facility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub owner_id: Ulid,
    pub requester_name: String,
    pub title: String,
    pub date: NaiveDate,
    /// Free-text slot label shown alongside the times ("Morning", ...).
    pub slot: String,
    #[serde(flatten)]
    pub range: TimeRange,
    /// Requested equipment, descriptive only — no inventory tracking.
    pub equipment: Vec<String>,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// Caller-supplied fields for a new or edited request. Id, status and
/// created_at are assigned by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDraft {
    pub facility_id: Ulid,
    pub requester_name: String,
    pub title: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub slot: String,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    #[serde(default)]
    pub equipment: Vec<String>,
}

impl RequestDraft {
    pub fn range(&self) -> Result<TimeRange, TimeError> {
        TimeRange::new(self.start, self.end)
    }
}

/// Account record as persisted. Never serialized to the wire — see
/// [`UserInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub full_name: String,
    pub username: String,
    pub password: String,
    pub email: String,
    pub role: Role,
    pub created_at: Ms,
}

/// Wire-safe view of an account (password omitted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserInfo {
    pub id: Ulid,
    pub full_name: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub created_at: Ms,
}

impl From<&UserRecord> for UserInfo {
    fn from(u: &UserRecord) -> Self {
        Self {
            id: u.id,
            full_name: u.full_name.clone(),
            username: u.username.clone(),
            email: u.email.clone(),
            role: u.role,
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacilityInfo {
    pub id: Ulid,
    pub name: String,
    pub equipment: Vec<String>,
    pub color: Option<String>,
    pub created_at: Ms,
}

/// A facility plus every request filed against it, sorted by
/// `(date, start)` so a single day is a contiguous slice.
#[derive(Debug, Clone)]
pub struct FacilityState {
    pub id: Ulid,
    pub name: String,
    /// Amenities available at the facility, free text.
    pub equipment: Vec<String>,
    /// Calendar display color.
    pub color: Option<String>,
    pub created_at: Ms,
    pub requests: Vec<BookingRequest>,
}

impl FacilityState {
    pub fn new(
        id: Ulid,
        name: String,
        equipment: Vec<String>,
        color: Option<String>,
        created_at: Ms,
    ) -> Self {
        Self {
            id,
            name,
            equipment,
            color,
            created_at,
            requests: Vec::new(),
        }
    }

    /// Insert preserving the `(date, start)` sort order.
    pub fn insert_request(&mut self, request: BookingRequest) {
        let key = (request.date, request.range.start);
        let pos = self
            .requests
            .partition_point(|r| (r.date, r.range.start) <= key);
        self.requests.insert(pos, request);
    }

    pub fn remove_request(&mut self, id: Ulid) -> Option<BookingRequest> {
        let pos = self.requests.iter().position(|r| r.id == id)?;
        Some(self.requests.remove(pos))
    }

    pub fn get_request(&self, id: Ulid) -> Option<&BookingRequest> {
        self.requests.iter().find(|r| r.id == id)
    }

    pub fn get_request_mut(&mut self, id: Ulid) -> Option<&mut BookingRequest> {
        self.requests.iter_mut().find(|r| r.id == id)
    }

    /// All requests on `date` as a contiguous slice of the sorted vec.
    pub fn on_date(&self, date: NaiveDate) -> &[BookingRequest] {
        let lo = self.requests.partition_point(|r| r.date < date);
        let hi = self.requests.partition_point(|r| r.date <= date);
        &self.requests[lo..hi]
    }

    pub fn info(&self) -> FacilityInfo {
        FacilityInfo {
            id: self.id,
            name: self.name.clone(),
            equipment: self.equipment.clone(),
            color: self.color.clone(),
            created_at: self.created_at,
        }
    }
}

/// The WAL record format — flat, no nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    FacilityCreated {
        id: Ulid,
        name: String,
        equipment: Vec<String>,
        color: Option<String>,
        created_at: Ms,
    },
    FacilityUpdated {
        id: Ulid,
        name: String,
        equipment: Vec<String>,
        color: Option<String>,
    },
    FacilityDeleted {
        id: Ulid,
    },
    UserCreated {
        id: Ulid,
        full_name: String,
        username: String,
        password: String,
        email: String,
        role: Role,
        created_at: Ms,
    },
    UserUpdated {
        id: Ulid,
        full_name: String,
        username: String,
        password: String,
        email: String,
        role: Role,
    },
    UserDeleted {
        id: Ulid,
    },
    RequestSubmitted {
        id: Ulid,
        facility_id: Ulid,
        owner_id: Ulid,
        requester_name: String,
        title: String,
        date: NaiveDate,
        slot: String,
        start: TimeOfDay,
        end: TimeOfDay,
        equipment: Vec<String>,
        created_at: Ms,
    },
    RequestEdited {
        id: Ulid,
        facility_id: Ulid,
        requester_name: String,
        title: String,
        date: NaiveDate,
        slot: String,
        start: TimeOfDay,
        end: TimeOfDay,
        equipment: Vec<String>,
    },
    RequestStatusChanged {
        id: Ulid,
        facility_id: Ulid,
        status: BookingStatus,
    },
    RequestDeleted {
        id: Ulid,
        facility_id: Ulid,
    },
}

// ── serde for TimeOfDay / TimeRange ──────────────────────────────
// Human-readable formats (the JSON wire) carry "HH:MM"; binary formats
// (the bincode WAL) carry the raw minute offset.

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            serializer.serialize_u16(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let minutes = u16::deserialize(deserializer)?;
            if minutes >= 24 * 60 {
                return Err(serde::de::Error::custom("time of day out of range"));
            }
            Ok(TimeOfDay::from_minutes(minutes))
        }
    }
}

impl Serialize for TimeRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("TimeRange", 2)?;
        s.serialize_field("start", &self.start)?;
        s.serialize_field("end", &self.end)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for TimeRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            start: TimeOfDay,
            end: TimeOfDay,
        }
        let raw = Raw::deserialize(deserializer)?;
        TimeRange::new(raw.start, raw.end).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(t(start), t(end)).unwrap()
    }

    #[test]
    fn parse_valid_times() {
        assert_eq!(t("00:00").minutes(), 0);
        assert_eq!(t("09:30").minutes(), 570);
        assert_eq!(t("9:30").minutes(), 570);
        assert_eq!(t("23:59").minutes(), 23 * 60 + 59);
    }

    #[test]
    fn parse_rejects_malformed() {
        for bad in ["", "9", "930", "24:00", "12:60", "ab:cd", "12:3", "12:345", "-1:00", "12 :30"] {
            let r: Result<TimeOfDay, _> = bad.parse();
            assert!(
                matches!(r, Err(TimeError::InvalidTimeFormat(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn display_roundtrip() {
        for s in ["00:00", "09:05", "14:45", "23:59"] {
            assert_eq!(t(s).to_string(), s);
        }
        // Single-digit hours normalize to two digits
        assert_eq!(t("9:05").to_string(), "09:05");
    }

    #[test]
    fn range_requires_start_before_end() {
        assert!(TimeRange::new(t("10:00"), t("09:00")).is_err());
        assert!(TimeRange::new(t("10:00"), t("10:00")).is_err());
        assert!(TimeRange::new(t("10:00"), t("10:01")).is_ok());
    }

    #[test]
    fn buffered_conflict_basic_overlap() {
        let a = range("09:00", "10:00");
        let b = range("09:30", "10:30");
        assert!(a.conflicts_with(&b, 30));
        assert!(b.conflicts_with(&a, 30));
    }

    #[test]
    fn buffered_conflict_within_margin() {
        // Existing 09:00–10:00; a candidate starting 10:15 is inside the
        // 30-minute margin (occupied until 10:30 from the candidate's view).
        let existing = range("09:00", "10:00");
        let candidate = range("10:15", "11:00");
        assert!(candidate.conflicts_with(&existing, 30));
    }

    #[test]
    fn buffered_conflict_exact_margin_is_clear() {
        // Candidate start minus 30 lands exactly on the existing end → clear.
        let existing = range("13:00", "14:00");
        let candidate = range("14:30", "15:30");
        assert!(!candidate.conflicts_with(&existing, 30));

        // Candidate end plus 30 lands exactly on the existing start → clear.
        let later = range("16:00", "17:00");
        let before = range("14:30", "15:30");
        assert!(!before.conflicts_with(&later, 30));
    }

    #[test]
    fn buffer_only_widens_candidate() {
        let a = range("09:00", "10:00");
        let b = range("10:10", "11:00");
        assert!(!a.conflicts_with(&b, 0));
        assert!(a.conflicts_with(&b, 30));
    }

    #[test]
    fn insert_keeps_date_start_order() {
        let mut fs = FacilityState::new(Ulid::new(), "Room A".into(), vec![], None, 0);
        let d1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        for (date, start, end) in [
            (d2, "09:00", "10:00"),
            (d1, "13:00", "14:00"),
            (d1, "08:00", "09:00"),
        ] {
            fs.insert_request(request_on(fs.id, date, start, end));
        }

        let keys: Vec<_> = fs.requests.iter().map(|r| (r.date, r.range.start)).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn on_date_returns_only_that_day() {
        let mut fs = FacilityState::new(Ulid::new(), "Room A".into(), vec![], None, 0);
        let d1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
        let d3 = NaiveDate::from_ymd_opt(2024, 5, 3).unwrap();

        fs.insert_request(request_on(fs.id, d1, "09:00", "10:00"));
        fs.insert_request(request_on(fs.id, d2, "09:00", "10:00"));
        fs.insert_request(request_on(fs.id, d2, "11:00", "12:00"));

        assert_eq!(fs.on_date(d1).len(), 1);
        assert_eq!(fs.on_date(d2).len(), 2);
        assert!(fs.on_date(d3).is_empty());
    }

    #[test]
    fn remove_request_by_id() {
        let mut fs = FacilityState::new(Ulid::new(), "Room A".into(), vec![], None, 0);
        let d = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let req = request_on(fs.id, d, "09:00", "10:00");
        let id = req.id;
        fs.insert_request(req);

        assert!(fs.remove_request(id).is_some());
        assert!(fs.remove_request(id).is_none());
        assert!(fs.requests.is_empty());
    }

    #[test]
    fn event_wal_roundtrip() {
        let event = Event::RequestSubmitted {
            id: Ulid::new(),
            facility_id: Ulid::new(),
            owner_id: Ulid::new(),
            requester_name: "Dana".into(),
            title: "Team sync".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            slot: "Morning".into(),
            start: t("09:00"),
            end: t("10:00"),
            equipment: vec!["Projector".into()],
            created_at: 1_714_000_000_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn time_of_day_json_is_string() {
        let v = serde_json::to_value(t("09:30")).unwrap();
        assert_eq!(v, serde_json::json!("09:30"));
        let back: TimeOfDay = serde_json::from_value(v).unwrap();
        assert_eq!(back, t("09:30"));
    }

    #[test]
    fn range_json_rejects_inverted() {
        let r: Result<TimeRange, _> =
            serde_json::from_value(serde_json::json!({"start": "10:00", "end": "09:00"}));
        assert!(r.is_err());
    }

    fn request_on(facility_id: Ulid, date: NaiveDate, start: &str, end: &str) -> BookingRequest {
        BookingRequest {
            id: Ulid::new(),
            facility_id,
            owner_id: Ulid::new(),
            requester_name: "Tester".into(),
            title: "Booking".into(),
            date,
            slot: String::new(),
            range: TimeRange::new(start.parse().unwrap(), end.parse().unwrap()).unwrap(),
            equipment: vec![],
            status: BookingStatus::Pending,
            created_at: 0,
        }
    }
}
