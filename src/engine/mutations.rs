//! State-changing operations. Every mutation follows the same shape:
//! permission check, input validation, WAL append, in-memory apply under
//! the facility lock, change notification. The conflict gate for bookings
//! runs while the facility's write lock is held, so no competing
//! submission can slip in between the check and the write.

use serde::Deserialize;
use tracing::info;
use ulid::Ulid;

use crate::limits;
use crate::model::*;
use crate::session::Session;

use super::conflict::{find_conflicts, now_ms, ConflictSet};
use super::status::check_transition;
use super::{edited_request, Engine, EngineError};

#[derive(Debug, Clone, Deserialize)]
pub struct FacilityDraft {
    pub name: String,
    #[serde(default)]
    pub equipment: Vec<String>,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserDraft {
    pub full_name: String,
    pub username: String,
    pub password: String,
    pub email: String,
    pub role: Role,
}

fn require_admin(session: &Session, op: &'static str) -> Result<(), EngineError> {
    if session.role.is_admin() {
        Ok(())
    } else {
        Err(EngineError::PermissionDenied(op))
    }
}

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_equipment(items: &[String]) -> Result<(), EngineError> {
    if items.len() > limits::MAX_EQUIPMENT_ITEMS {
        return Err(EngineError::LimitExceeded("equipment list"));
    }
    for item in items {
        check_len(item, limits::MAX_EQUIPMENT_NAME_LEN, "equipment name")?;
    }
    Ok(())
}

fn check_facility_draft(draft: &FacilityDraft) -> Result<(), EngineError> {
    if draft.name.is_empty() {
        return Err(EngineError::InvalidInput("facility name must not be empty"));
    }
    check_len(&draft.name, limits::MAX_NAME_LEN, "facility name")?;
    check_equipment(&draft.equipment)?;
    if let Some(color) = &draft.color {
        check_len(color, limits::MAX_COLOR_LEN, "color")?;
    }
    Ok(())
}

fn check_user_draft(draft: &UserDraft) -> Result<(), EngineError> {
    if draft.username.is_empty() {
        return Err(EngineError::InvalidInput("username must not be empty"));
    }
    check_len(&draft.full_name, limits::MAX_NAME_LEN, "full name")?;
    check_len(&draft.username, limits::MAX_USERNAME_LEN, "username")?;
    check_len(&draft.email, limits::MAX_EMAIL_LEN, "email")?;
    Ok(())
}

fn check_request_draft(draft: &RequestDraft) -> Result<TimeRange, EngineError> {
    check_len(&draft.requester_name, limits::MAX_NAME_LEN, "requester name")?;
    check_len(&draft.title, limits::MAX_TITLE_LEN, "title")?;
    check_len(&draft.slot, limits::MAX_SLOT_LEN, "slot")?;
    check_equipment(&draft.equipment)?;
    draft
        .range()
        .map_err(|e| EngineError::InvalidTime(e.to_string()))
}

/// Two-tier admission: an Approved overlap is a hard stop, a Pending-only
/// overlap is refusable but overridable.
fn gate(set: ConflictSet, override_pending: bool) -> Result<(), EngineError> {
    if !set.approved.is_empty() {
        return Err(EngineError::ApprovedConflict(set.approved));
    }
    if !set.pending.is_empty() && !override_pending {
        return Err(EngineError::OverrideRequired(set.pending));
    }
    Ok(())
}

impl Engine {
    // ── booking requests ─────────────────────────────────

    pub async fn submit_request(
        &self,
        session: &Session,
        draft: RequestDraft,
        override_pending: bool,
    ) -> Result<BookingRequest, EngineError> {
        let range = check_request_draft(&draft)?;

        let fs = self
            .get_facility(&draft.facility_id)
            .ok_or(EngineError::NotFound(draft.facility_id))?;
        let mut guard = fs.write().await;

        if guard.requests.len() >= limits::MAX_REQUESTS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("requests per facility"));
        }
        gate(find_conflicts(&guard, draft.date, &range, None), override_pending)?;

        let id = Ulid::new();
        let created_at = now_ms();
        let event = Event::RequestSubmitted {
            id,
            facility_id: draft.facility_id,
            owner_id: session.user_id,
            requester_name: draft.requester_name,
            title: draft.title,
            date: draft.date,
            slot: draft.slot,
            start: range.start,
            end: range.end,
            equipment: draft.equipment,
            created_at,
        };
        self.persist_and_apply(guard.id, &mut guard, &event).await?;

        info!(request = %id, facility = %guard.id, user = %session.username, "request submitted");
        guard
            .get_request(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Replace a request's caller-supplied fields, possibly moving it to
    /// another facility. Ownership, status and creation time survive.
    pub async fn edit_request(
        &self,
        session: &Session,
        id: Ulid,
        draft: RequestDraft,
        override_pending: bool,
    ) -> Result<BookingRequest, EngineError> {
        require_admin(session, "edit request")?;
        let range = check_request_draft(&draft)?;

        let old_fid = self
            .facility_for_request(&id)
            .ok_or(EngineError::NotFound(id))?;

        let event = Event::RequestEdited {
            id,
            facility_id: draft.facility_id,
            requester_name: draft.requester_name,
            title: draft.title,
            date: draft.date,
            slot: draft.slot,
            start: range.start,
            end: range.end,
            equipment: draft.equipment,
        };

        if old_fid == draft.facility_id {
            let fs = self
                .get_facility(&old_fid)
                .ok_or(EngineError::NotFound(old_fid))?;
            let mut guard = fs.write().await;
            let current = guard.get_request(id).ok_or(EngineError::NotFound(id))?;

            // The gate only guards the schedule. A metadata-only edit
            // (title, equipment, ...) keeps whatever window the record
            // already holds, so it proceeds unconditionally. Terminal
            // records no longer occupy the calendar at all.
            let window_changed = current.date != draft.date || current.range != range;
            if !current.status.is_terminal() && window_changed {
                gate(
                    find_conflicts(&guard, draft.date, &range, Some(id)),
                    override_pending,
                )?;
            }
            self.persist_and_apply(old_fid, &mut guard, &event).await?;
            return guard
                .get_request(id)
                .cloned()
                .ok_or(EngineError::NotFound(id));
        }

        // Cross-facility move. Lock both sides in id order so two
        // concurrent moves between the same pair cannot deadlock.
        let old_fs = self
            .get_facility(&old_fid)
            .ok_or(EngineError::NotFound(old_fid))?;
        let new_fs = self
            .get_facility(&draft.facility_id)
            .ok_or(EngineError::NotFound(draft.facility_id))?;

        let (mut old_guard, mut new_guard) = if old_fid < draft.facility_id {
            let a = old_fs.write().await;
            let b = new_fs.write().await;
            (a, b)
        } else {
            let b = new_fs.write().await;
            let a = old_fs.write().await;
            (a, b)
        };

        // The destination could have been deleted between the map lookup
        // above and taking its lock; its Arc keeps the orphaned state
        // alive, so re-check membership under the lock.
        if !self.facilities.contains_key(&draft.facility_id) {
            return Err(EngineError::NotFound(draft.facility_id));
        }

        let current = old_guard.get_request(id).ok_or(EngineError::NotFound(id))?;
        let status = current.status;

        if new_guard.requests.len() >= limits::MAX_REQUESTS_PER_FACILITY {
            return Err(EngineError::LimitExceeded("requests per facility"));
        }
        if !status.is_terminal() {
            gate(
                find_conflicts(&new_guard, draft.date, &range, None),
                override_pending,
            )?;
        }

        self.wal_append(&event).await?;
        let prior = old_guard
            .remove_request(id)
            .ok_or(EngineError::NotFound(id))?;
        new_guard.insert_request(edited_request(prior, &event));
        self.request_index.insert(id, draft.facility_id);
        self.notify.publish(old_fid, &event);
        self.notify.publish(draft.facility_id, &event);

        info!(request = %id, from = %old_fid, to = %draft.facility_id, "request moved");
        new_guard
            .get_request(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Admin decision on a request. A transition to the current status is
    /// accepted without writing anything.
    pub async fn set_status(
        &self,
        session: &Session,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<BookingRequest, EngineError> {
        require_admin(session, "set request status")?;
        let (facility_id, mut guard) = self.resolve_request_write(&id).await?;

        let current = guard.get_request(id).ok_or(EngineError::NotFound(id))?;
        check_transition(current.status, status)?;
        if current.status == status {
            return Ok(current.clone());
        }

        let event = Event::RequestStatusChanged { id, facility_id, status };
        self.persist_and_apply(facility_id, &mut guard, &event).await?;

        info!(request = %id, %status, admin = %session.username, "status changed");
        guard
            .get_request(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    /// Cancel a request. Owners may cancel their own; admins may cancel
    /// any. Canceling an already-canceled request is a no-op.
    pub async fn cancel_request(
        &self,
        session: &Session,
        id: Ulid,
    ) -> Result<BookingRequest, EngineError> {
        let (facility_id, mut guard) = self.resolve_request_write(&id).await?;

        let current = guard.get_request(id).ok_or(EngineError::NotFound(id))?;
        if current.owner_id != session.user_id && !session.role.is_admin() {
            return Err(EngineError::PermissionDenied("cancel request"));
        }
        check_transition(current.status, BookingStatus::Canceled)?;
        if current.status == BookingStatus::Canceled {
            return Ok(current.clone());
        }

        let event = Event::RequestStatusChanged {
            id,
            facility_id,
            status: BookingStatus::Canceled,
        };
        self.persist_and_apply(facility_id, &mut guard, &event).await?;

        info!(request = %id, user = %session.username, "request canceled");
        guard
            .get_request(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn delete_request(&self, session: &Session, id: Ulid) -> Result<(), EngineError> {
        require_admin(session, "delete request")?;
        let (facility_id, mut guard) = self.resolve_request_write(&id).await?;
        if guard.get_request(id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::RequestDeleted { id, facility_id };
        self.persist_and_apply(facility_id, &mut guard, &event).await?;
        info!(request = %id, facility = %facility_id, "request deleted");
        Ok(())
    }

    // ── facilities ───────────────────────────────────────

    pub async fn create_facility(
        &self,
        session: &Session,
        draft: FacilityDraft,
    ) -> Result<FacilityInfo, EngineError> {
        require_admin(session, "create facility")?;
        check_facility_draft(&draft)?;
        if self.facilities.len() >= limits::MAX_FACILITIES {
            return Err(EngineError::LimitExceeded("facilities"));
        }

        let id = Ulid::new();
        let created_at = now_ms();
        let event = Event::FacilityCreated {
            id,
            name: draft.name.clone(),
            equipment: draft.equipment.clone(),
            color: draft.color.clone(),
            created_at,
        };
        self.wal_append(&event).await?;

        let fs = FacilityState::new(id, draft.name, draft.equipment, draft.color, created_at);
        let info = fs.info();
        self.facilities
            .insert(id, std::sync::Arc::new(tokio::sync::RwLock::new(fs)));
        self.notify.publish(id, &event);

        info!(facility = %id, name = %info.name, "facility created");
        Ok(info)
    }

    pub async fn update_facility(
        &self,
        session: &Session,
        id: Ulid,
        draft: FacilityDraft,
    ) -> Result<FacilityInfo, EngineError> {
        require_admin(session, "update facility")?;
        check_facility_draft(&draft)?;

        let fs = self.get_facility(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = fs.write().await;

        let event = Event::FacilityUpdated {
            id,
            name: draft.name.clone(),
            equipment: draft.equipment.clone(),
            color: draft.color.clone(),
        };
        self.wal_append(&event).await?;

        guard.name = draft.name;
        guard.equipment = draft.equipment;
        guard.color = draft.color;
        self.notify.publish(id, &event);
        Ok(guard.info())
    }

    /// Delete a facility. Refused while any request on it is still
    /// Pending or Approved — decide those first.
    pub async fn delete_facility(&self, session: &Session, id: Ulid) -> Result<(), EngineError> {
        require_admin(session, "delete facility")?;

        let fs = self.get_facility(&id).ok_or(EngineError::NotFound(id))?;
        let guard = fs.write().await;
        if guard.requests.iter().any(|r| !r.status.is_terminal()) {
            return Err(EngineError::FacilityInUse(id));
        }

        let event = Event::FacilityDeleted { id };
        self.wal_append(&event).await?;

        for req in &guard.requests {
            self.request_index.remove(&req.id);
        }
        // Unpublish before releasing the lock: anyone who cloned the Arc
        // and is waiting on it must find the map entry already gone.
        self.facilities.remove(&id);
        drop(guard);
        self.notify.publish(id, &event);
        self.notify.close(&id);

        info!(facility = %id, "facility deleted");
        Ok(())
    }

    // ── user accounts ────────────────────────────────────

    /// First-run bootstrap: when no accounts exist, create the admin with
    /// the configured password. Returns the new id, or None if accounts
    /// already exist.
    pub async fn ensure_admin(&self, password: &str) -> Result<Option<Ulid>, EngineError> {
        if !self.users.is_empty() {
            return Ok(None);
        }

        let id = Ulid::new();
        let event = Event::UserCreated {
            id,
            full_name: "Administrator".into(),
            username: "admin".into(),
            password: password.into(),
            email: String::new(),
            role: Role::Admin,
            created_at: now_ms(),
        };
        self.wal_append(&event).await?;
        self.replay_event(&event);

        info!(user = %id, "bootstrap admin account created");
        Ok(Some(id))
    }

    pub async fn create_user(
        &self,
        session: &Session,
        draft: UserDraft,
    ) -> Result<UserInfo, EngineError> {
        require_admin(session, "create user")?;
        check_user_draft(&draft)?;
        if self.users.len() >= limits::MAX_USERS {
            return Err(EngineError::LimitExceeded("users"));
        }

        let id = Ulid::new();
        // Reserve the username before the async WAL write so a concurrent
        // create of the same name loses cleanly.
        {
            let entry = self.usernames.entry(draft.username.clone());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(EngineError::UsernameTaken(draft.username));
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        let event = Event::UserCreated {
            id,
            full_name: draft.full_name.clone(),
            username: draft.username.clone(),
            password: draft.password,
            email: draft.email.clone(),
            role: draft.role,
            created_at: now_ms(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.usernames.remove(&draft.username);
            return Err(e);
        }
        self.replay_event(&event);

        info!(user = %id, username = %draft.username, "user created");
        self.users
            .get(&id)
            .map(|u| UserInfo::from(u.value()))
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn update_user(
        &self,
        session: &Session,
        id: Ulid,
        draft: UserDraft,
    ) -> Result<UserInfo, EngineError> {
        require_admin(session, "update user")?;
        check_user_draft(&draft)?;

        let old_username = self
            .users
            .get(&id)
            .map(|u| u.username.clone())
            .ok_or(EngineError::NotFound(id))?;

        if draft.username != old_username {
            let entry = self.usernames.entry(draft.username.clone());
            match entry {
                dashmap::mapref::entry::Entry::Occupied(_) => {
                    return Err(EngineError::UsernameTaken(draft.username));
                }
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    v.insert(id);
                }
            }
        }

        let event = Event::UserUpdated {
            id,
            full_name: draft.full_name,
            username: draft.username.clone(),
            password: draft.password,
            email: draft.email,
            role: draft.role,
        };
        if let Err(e) = self.wal_append(&event).await {
            if draft.username != old_username {
                self.usernames.remove(&draft.username);
            }
            return Err(e);
        }
        self.replay_event(&event);

        self.users
            .get(&id)
            .map(|u| UserInfo::from(u.value()))
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn delete_user(&self, session: &Session, id: Ulid) -> Result<(), EngineError> {
        require_admin(session, "delete user")?;
        if session.user_id == id {
            return Err(EngineError::PermissionDenied("delete own account"));
        }
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::UserDeleted { id };
        self.wal_append(&event).await?;
        self.replay_event(&event);

        info!(user = %id, "user deleted");
        Ok(())
    }
}
