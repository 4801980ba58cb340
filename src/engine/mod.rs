mod conflict;
mod error;
mod mutations;
mod queries;
mod status;

pub use conflict::{find_conflicts, ConflictSet, CONFLICT_BUFFER_MIN};
pub use error::EngineError;
pub use mutations::{FacilityDraft, UserDraft};
pub use queries::RequestFilter;
pub use status::{can_transition, check_transition};

pub(crate) use conflict::now_ms;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends are batched: block for the
/// first one, drain whatever else is immediately queued, then fsync once
/// for the whole batch and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Settle the in-flight batch before the
                            // non-append command touches the file.
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel drained
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (these callers are told this batch failed).
    let flush_err = wal.flush_sync().err();
    let result = match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(start.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// The booking engine: facility catalog, user accounts and every booking
/// request, rebuilt from the WAL on startup. Each facility's requests live
/// behind one `RwLock`, so the conflict gate and the write it protects run
/// under the same lock — the read-check-write sequence cannot race.
pub struct Engine {
    pub facilities: DashMap<Ulid, SharedFacilityState>,
    pub(super) users: DashMap<Ulid, UserRecord>,
    /// username → user id, kept in lockstep with `users`.
    pub(super) usernames: DashMap<String, Ulid>,
    /// Reverse lookup: request id → facility id.
    pub(super) request_index: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a request-scoped event to a facility state the caller has locked.
/// `RequestEdited` is only handled here when the facility did not change;
/// cross-facility moves are applied by the caller with both locks held.
fn apply_request_event(fs: &mut FacilityState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::RequestSubmitted {
            id,
            facility_id,
            owner_id,
            requester_name,
            title,
            date,
            slot,
            start,
            end,
            equipment,
            created_at,
        } => {
            fs.insert_request(BookingRequest {
                id: *id,
                facility_id: *facility_id,
                owner_id: *owner_id,
                requester_name: requester_name.clone(),
                title: title.clone(),
                date: *date,
                slot: slot.clone(),
                range: TimeRange { start: *start, end: *end },
                equipment: equipment.clone(),
                status: BookingStatus::Pending,
                created_at: *created_at,
            });
            index.insert(*id, *facility_id);
        }
        Event::RequestEdited { id, .. } => {
            if let Some(old) = fs.remove_request(*id) {
                fs.insert_request(edited_request(old, event));
            }
        }
        Event::RequestStatusChanged { id, status, .. } => {
            if let Some(req) = fs.get_request_mut(*id) {
                req.status = *status;
            }
        }
        Event::RequestDeleted { id, .. } => {
            fs.remove_request(*id);
            index.remove(id);
        }
        _ => unreachable!("not a request event"),
    }
}

/// Rebuild a request from its prior record plus an edit event. Ownership,
/// status and creation time survive the edit.
fn edited_request(old: BookingRequest, event: &Event) -> BookingRequest {
    let Event::RequestEdited {
        id,
        facility_id,
        requester_name,
        title,
        date,
        slot,
        start,
        end,
        equipment,
    } = event
    else {
        unreachable!("edited_request on non-edit event");
    };
    BookingRequest {
        id: *id,
        facility_id: *facility_id,
        owner_id: old.owner_id,
        requester_name: requester_name.clone(),
        title: title.clone(),
        date: *date,
        slot: slot.clone(),
        range: TimeRange { start: *start, end: *end },
        equipment: equipment.clone(),
        status: old.status,
        created_at: old.created_at,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            facilities: DashMap::new(),
            users: DashMap::new(),
            usernames: DashMap::new(),
            request_index: DashMap::new(),
            wal_tx,
            notify,
        };

        // Replay. We are the sole owner of every Arc here, so try_write
        // always succeeds — and blocking_write would panic if new() runs
        // inside an async context.
        for event in &events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::FacilityCreated { id, name, equipment, color, created_at } => {
                let fs = FacilityState::new(*id, name.clone(), equipment.clone(), color.clone(), *created_at);
                self.facilities.insert(*id, Arc::new(RwLock::new(fs)));
            }
            Event::FacilityUpdated { id, name, equipment, color } => {
                if let Some(entry) = self.facilities.get(id) {
                    let fs = entry.value().clone();
                    let mut guard = fs.try_write().expect("replay: uncontended write");
                    guard.name = name.clone();
                    guard.equipment = equipment.clone();
                    guard.color = color.clone();
                }
            }
            Event::FacilityDeleted { id } => {
                if let Some((_, fs)) = self.facilities.remove(id) {
                    let guard = fs.try_read().expect("replay: uncontended read");
                    for req in &guard.requests {
                        self.request_index.remove(&req.id);
                    }
                }
            }
            Event::UserCreated { id, full_name, username, password, email, role, created_at } => {
                self.users.insert(*id, UserRecord {
                    id: *id,
                    full_name: full_name.clone(),
                    username: username.clone(),
                    password: password.clone(),
                    email: email.clone(),
                    role: *role,
                    created_at: *created_at,
                });
                self.usernames.insert(username.clone(), *id);
            }
            Event::UserUpdated { id, full_name, username, password, email, role } => {
                if let Some(mut user) = self.users.get_mut(id) {
                    self.usernames.remove(&user.username);
                    self.usernames.insert(username.clone(), *id);
                    user.full_name = full_name.clone();
                    user.username = username.clone();
                    user.password = password.clone();
                    user.email = email.clone();
                    user.role = *role;
                }
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.usernames.remove(&user.username);
                }
            }
            Event::RequestEdited { id, facility_id, .. } => {
                let Some(old_fid) = self.request_index.get(id).map(|e| *e.value()) else {
                    return;
                };
                if old_fid == *facility_id {
                    if let Some(entry) = self.facilities.get(facility_id) {
                        let fs = entry.value().clone();
                        let mut guard = fs.try_write().expect("replay: uncontended write");
                        apply_request_event(&mut guard, event, &self.request_index);
                    }
                } else if let (Some(old_entry), Some(new_entry)) =
                    (self.facilities.get(&old_fid), self.facilities.get(facility_id))
                {
                    let old_fs = old_entry.value().clone();
                    let new_fs = new_entry.value().clone();
                    let mut old_guard = old_fs.try_write().expect("replay: uncontended write");
                    let mut new_guard = new_fs.try_write().expect("replay: uncontended write");
                    if let Some(prior) = old_guard.remove_request(*id) {
                        new_guard.insert_request(edited_request(prior, event));
                        self.request_index.insert(*id, *facility_id);
                    }
                }
            }
            Event::RequestSubmitted { facility_id, .. }
            | Event::RequestStatusChanged { facility_id, .. }
            | Event::RequestDeleted { facility_id, .. } => {
                if let Some(entry) = self.facilities.get(facility_id) {
                    let fs = entry.value().clone();
                    let mut guard = fs.try_write().expect("replay: uncontended write");
                    apply_request_event(&mut guard, event, &self.request_index);
                }
            }
        }
    }

    /// Write an event through the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_facility(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    pub fn facility_for_request(&self, request_id: &Ulid) -> Option<Ulid> {
        self.request_index.get(request_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify for a request event on one facility.
    pub(super) async fn persist_and_apply(
        &self,
        facility_id: Ulid,
        fs: &mut FacilityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_request_event(fs, event, &self.request_index);
        self.notify.publish(facility_id, event);
        Ok(())
    }

    /// Lookup request → facility, take the facility's write lock.
    pub(super) async fn resolve_request_write(
        &self,
        request_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<FacilityState>), EngineError> {
        let facility_id = self
            .facility_for_request(request_id)
            .ok_or(EngineError::NotFound(*request_id))?;
        let fs = self
            .get_facility(&facility_id)
            .ok_or(EngineError::NotFound(facility_id))?;
        let guard = fs.write_owned().await;
        Ok((facility_id, guard))
    }

    /// Compact the WAL down to the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for user in self.users.iter() {
            events.push(Event::UserCreated {
                id: user.id,
                full_name: user.full_name.clone(),
                username: user.username.clone(),
                password: user.password.clone(),
                email: user.email.clone(),
                role: user.role,
                created_at: user.created_at,
            });
        }

        // Collect facility ids first so no dashmap shard lock is held
        // across the awaits below.
        let facility_ids: Vec<Ulid> = self.facilities.iter().map(|e| *e.key()).collect();
        for id in facility_ids {
            let Some(fs) = self.get_facility(&id) else { continue };
            let guard = fs.read().await;
            events.push(Event::FacilityCreated {
                id: guard.id,
                name: guard.name.clone(),
                equipment: guard.equipment.clone(),
                color: guard.color.clone(),
                created_at: guard.created_at,
            });
            for req in &guard.requests {
                events.push(Event::RequestSubmitted {
                    id: req.id,
                    facility_id: req.facility_id,
                    owner_id: req.owner_id,
                    requester_name: req.requester_name.clone(),
                    title: req.title.clone(),
                    date: req.date,
                    slot: req.slot.clone(),
                    start: req.range.start,
                    end: req.range.end,
                    equipment: req.equipment.clone(),
                    created_at: req.created_at,
                });
                // Submission replays as Pending; restore the decision.
                if req.status != BookingStatus::Pending {
                    events.push(Event::RequestStatusChanged {
                        id: req.id,
                        facility_id: req.facility_id,
                        status: req.status,
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
