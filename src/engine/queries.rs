//! Read-only operations. Queries take read locks per facility and clone
//! out what they return; nothing here touches the WAL.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::*;
use crate::session::{CredentialSource, Session};

use super::conflict::{find_conflicts, ConflictSet};
use super::{Engine, EngineError};

/// Optional narrowing for request listings. Fields compose with AND.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestFilter {
    #[serde(default)]
    pub facility_id: Option<Ulid>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub status: Option<BookingStatus>,
}

impl RequestFilter {
    fn matches(&self, req: &BookingRequest) -> bool {
        self.facility_id.is_none_or(|id| req.facility_id == id)
            && self.date.is_none_or(|d| req.date == d)
            && self.status.is_none_or(|s| req.status == s)
    }
}

impl Engine {
    pub async fn list_facilities(&self) -> Vec<FacilityInfo> {
        // Clone the Arcs out first; shard guards must not be held across
        // the lock awaits below.
        let states: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(states.len());
        for fs in states {
            out.push(fs.read().await.info());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    pub async fn facility_info(&self, id: Ulid) -> Result<FacilityInfo, EngineError> {
        let fs = self.get_facility(&id).ok_or(EngineError::NotFound(id))?;
        let guard = fs.read().await;
        Ok(guard.info())
    }

    /// Requests visible to the session: admins see everything, everyone
    /// else sees only their own. Newest first.
    pub async fn list_requests(
        &self,
        session: &Session,
        filter: &RequestFilter,
    ) -> Vec<BookingRequest> {
        let states: Vec<_> = self
            .facilities
            .iter()
            .filter(|e| filter.facility_id.is_none_or(|want| *e.key() == want))
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for fs in states {
            let guard = fs.read().await;
            out.extend(
                guard
                    .requests
                    .iter()
                    .filter(|r| filter.matches(r))
                    .filter(|r| session.role.is_admin() || r.owner_id == session.user_id)
                    .cloned(),
            );
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        out
    }

    pub async fn get_request(
        &self,
        session: &Session,
        id: Ulid,
    ) -> Result<BookingRequest, EngineError> {
        let facility_id = self
            .facility_for_request(&id)
            .ok_or(EngineError::NotFound(id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        let req = guard.get_request(id).ok_or(EngineError::NotFound(id))?;
        if !session.role.is_admin() && req.owner_id != session.user_id {
            return Err(EngineError::PermissionDenied("view request"));
        }
        Ok(req.clone())
    }

    /// Occupancy view of one facility's day: every request that still
    /// holds (or contends for) time, owner-agnostic. What a calendar
    /// renders when anyone checks availability.
    pub async fn day_schedule(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<BookingRequest>, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        Ok(guard
            .on_date(date)
            .iter()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect())
    }

    /// Pre-flight conflict probe against a snapshot of the facility. The
    /// authoritative check still reruns under the write lock on submit.
    pub async fn check_availability(
        &self,
        facility_id: Ulid,
        date: NaiveDate,
        range: &TimeRange,
        exclude: Option<Ulid>,
    ) -> Result<ConflictSet, EngineError> {
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.read().await;
        Ok(find_conflicts(&guard, date, range, exclude))
    }

    pub fn list_users(&self, session: &Session) -> Result<Vec<UserInfo>, EngineError> {
        if !session.role.is_admin() {
            return Err(EngineError::PermissionDenied("list users"));
        }
        let mut out: Vec<UserInfo> = self.users.iter().map(|u| UserInfo::from(u.value())).collect();
        out.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(out)
    }
}

#[async_trait]
impl CredentialSource for Engine {
    async fn verify(&self, username: &str, password: &str) -> Option<(Ulid, String, Role)> {
        let id = *self.usernames.get(username)?.value();
        let user = self.users.get(&id)?;
        (user.password == password).then(|| (user.id, user.username.clone(), user.role))
    }
}
