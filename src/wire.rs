//! JSON-lines wire protocol. One command per line in, one reply per line
//! out; change-feed events from `subscribe` are interleaved as extra
//! lines. Everything except `login` requires a session.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;
use ulid::Ulid;

use crate::engine::{Engine, EngineError, FacilityDraft, RequestFilter, UserDraft};
use crate::limits::MAX_WIRE_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::session::{Session, SessionManager};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Login {
        username: String,
        password: String,
    },
    Logout,
    Whoami,
    CreateFacility {
        #[serde(flatten)]
        draft: FacilityDraft,
    },
    UpdateFacility {
        id: Ulid,
        #[serde(flatten)]
        draft: FacilityDraft,
    },
    DeleteFacility {
        id: Ulid,
    },
    ListFacilities,
    CreateUser {
        #[serde(flatten)]
        draft: UserDraft,
    },
    UpdateUser {
        id: Ulid,
        #[serde(flatten)]
        draft: UserDraft,
    },
    DeleteUser {
        id: Ulid,
    },
    ListUsers,
    SubmitRequest {
        #[serde(flatten)]
        draft: RequestDraft,
        #[serde(default)]
        override_pending: bool,
    },
    EditRequest {
        id: Ulid,
        #[serde(flatten)]
        draft: RequestDraft,
        #[serde(default)]
        override_pending: bool,
    },
    SetStatus {
        id: Ulid,
        status: BookingStatus,
    },
    CancelRequest {
        id: Ulid,
    },
    DeleteRequest {
        id: Ulid,
    },
    ListRequests {
        #[serde(flatten)]
        filter: RequestFilter,
    },
    GetRequest {
        id: Ulid,
    },
    DaySchedule {
        facility_id: Ulid,
        date: NaiveDate,
    },
    CheckAvailability {
        facility_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
        #[serde(default)]
        exclude: Option<Ulid>,
    },
    Subscribe {
        facility_id: Ulid,
    },
    Unsubscribe {
        facility_id: Ulid,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    Ok,
    Error {
        code: &'static str,
        message: String,
        /// Present for conflict errors: the ids in the way.
        #[serde(skip_serializing_if = "Option::is_none")]
        conflicts: Option<Vec<Ulid>>,
    },
    Session {
        token: Ulid,
        user_id: Ulid,
        username: String,
        role: Role,
    },
    Facility {
        facility: FacilityInfo,
    },
    Facilities {
        facilities: Vec<FacilityInfo>,
    },
    User {
        user: UserInfo,
    },
    Users {
        users: Vec<UserInfo>,
    },
    Request {
        request: BookingRequest,
    },
    Requests {
        requests: Vec<BookingRequest>,
    },
    Conflicts {
        approved: Vec<Ulid>,
        pending: Vec<Ulid>,
    },
    /// Pushed asynchronously for subscribed facilities.
    Event {
        facility_id: Ulid,
        event: Event,
    },
}

fn engine_error_reply(e: EngineError) -> Reply {
    let (code, conflicts) = match &e {
        EngineError::NotFound(_) => ("not_found", None),
        EngineError::AlreadyExists(_) => ("already_exists", None),
        EngineError::UsernameTaken(_) => ("username_taken", None),
        EngineError::ApprovedConflict(ids) => ("approved_conflict", Some(ids.clone())),
        EngineError::OverrideRequired(ids) => ("override_required", Some(ids.clone())),
        EngineError::InvalidTransition { .. } => ("invalid_transition", None),
        EngineError::InvalidTime(_) => ("invalid_time", None),
        EngineError::InvalidInput(_) => ("invalid_input", None),
        EngineError::PermissionDenied(_) => ("permission_denied", None),
        EngineError::FacilityInUse(_) => ("facility_in_use", None),
        EngineError::LimitExceeded(_) => ("limit_exceeded", None),
        EngineError::WalError(_) => ("internal", None),
    };
    Reply::Error {
        code,
        message: e.to_string(),
        conflicts,
    }
}

fn protocol_error(message: impl Into<String>) -> Reply {
    Reply::Error {
        code: "bad_request",
        message: message.into(),
        conflicts: None,
    }
}

/// Per-connection state beyond the socket itself.
struct Connection {
    session: Option<Session>,
    /// Subscription forwarder tasks, keyed by facility.
    watchers: HashMap<Ulid, tokio::task::JoinHandle<()>>,
    event_tx: mpsc::Sender<(Ulid, Event)>,
}

impl Connection {
    fn subscribe(&mut self, engine: &Engine, facility_id: Ulid) {
        let mut rx = engine.notify.subscribe(facility_id);
        let tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send((facility_id, event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(facility = %facility_id, skipped = n, "slow subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.watchers.insert(facility_id, handle) {
            old.abort();
        }
    }

    fn unsubscribe(&mut self, facility_id: &Ulid) -> bool {
        match self.watchers.remove(facility_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

async fn dispatch(
    engine: &Engine,
    sessions: &SessionManager,
    conn: &mut Connection,
    cmd: Command,
) -> Reply {
    // Login is the only command without a session.
    let cmd = match cmd {
        Command::Login { username, password } => {
            return match sessions.login(engine, &username, &password).await {
                Ok(session) => {
                    let reply = Reply::Session {
                        token: session.token,
                        user_id: session.user_id,
                        username: session.username.clone(),
                        role: session.role,
                    };
                    conn.session = Some(session);
                    reply
                }
                Err(e) => Reply::Error {
                    code: "auth_failed",
                    message: e.to_string(),
                    conflicts: None,
                },
            };
        }
        other => other,
    };

    let Some(session) = conn.session.clone() else {
        return Reply::Error {
            code: "unauthenticated",
            message: "login first".into(),
            conflicts: None,
        };
    };

    match cmd {
        Command::Login { .. } => unreachable!("handled above"),
        Command::Logout => {
            sessions.logout(session.token);
            conn.session = None;
            Reply::Ok
        }
        Command::Whoami => Reply::Session {
            token: session.token,
            user_id: session.user_id,
            username: session.username,
            role: session.role,
        },
        Command::CreateFacility { draft } => match engine.create_facility(&session, draft).await {
            Ok(facility) => Reply::Facility { facility },
            Err(e) => engine_error_reply(e),
        },
        Command::UpdateFacility { id, draft } => {
            match engine.update_facility(&session, id, draft).await {
                Ok(facility) => Reply::Facility { facility },
                Err(e) => engine_error_reply(e),
            }
        }
        Command::DeleteFacility { id } => match engine.delete_facility(&session, id).await {
            Ok(()) => Reply::Ok,
            Err(e) => engine_error_reply(e),
        },
        Command::ListFacilities => Reply::Facilities {
            facilities: engine.list_facilities().await,
        },
        Command::CreateUser { draft } => match engine.create_user(&session, draft).await {
            Ok(user) => Reply::User { user },
            Err(e) => engine_error_reply(e),
        },
        Command::UpdateUser { id, draft } => match engine.update_user(&session, id, draft).await {
            Ok(user) => Reply::User { user },
            Err(e) => engine_error_reply(e),
        },
        Command::DeleteUser { id } => match engine.delete_user(&session, id).await {
            Ok(()) => Reply::Ok,
            Err(e) => engine_error_reply(e),
        },
        Command::ListUsers => match engine.list_users(&session) {
            Ok(users) => Reply::Users { users },
            Err(e) => engine_error_reply(e),
        },
        Command::SubmitRequest { draft, override_pending } => {
            match engine.submit_request(&session, draft, override_pending).await {
                Ok(request) => Reply::Request { request },
                Err(e) => engine_error_reply(e),
            }
        }
        Command::EditRequest { id, draft, override_pending } => {
            match engine.edit_request(&session, id, draft, override_pending).await {
                Ok(request) => Reply::Request { request },
                Err(e) => engine_error_reply(e),
            }
        }
        Command::SetStatus { id, status } => match engine.set_status(&session, id, status).await {
            Ok(request) => Reply::Request { request },
            Err(e) => engine_error_reply(e),
        },
        Command::CancelRequest { id } => match engine.cancel_request(&session, id).await {
            Ok(request) => Reply::Request { request },
            Err(e) => engine_error_reply(e),
        },
        Command::DeleteRequest { id } => match engine.delete_request(&session, id).await {
            Ok(()) => Reply::Ok,
            Err(e) => engine_error_reply(e),
        },
        Command::ListRequests { filter } => Reply::Requests {
            requests: engine.list_requests(&session, &filter).await,
        },
        Command::GetRequest { id } => match engine.get_request(&session, id).await {
            Ok(request) => Reply::Request { request },
            Err(e) => engine_error_reply(e),
        },
        Command::DaySchedule { facility_id, date } => {
            match engine.day_schedule(facility_id, date).await {
                Ok(requests) => Reply::Requests { requests },
                Err(e) => engine_error_reply(e),
            }
        }
        Command::CheckAvailability { facility_id, date, start, end, exclude } => {
            let range = match TimeRange::new(start, end) {
                Ok(r) => r,
                Err(e) => return engine_error_reply(EngineError::InvalidTime(e.to_string())),
            };
            match engine.check_availability(facility_id, date, &range, exclude).await {
                Ok(set) => Reply::Conflicts {
                    approved: set.approved,
                    pending: set.pending,
                },
                Err(e) => engine_error_reply(e),
            }
        }
        Command::Subscribe { facility_id } => {
            if engine.get_facility(&facility_id).is_none() {
                return engine_error_reply(EngineError::NotFound(facility_id));
            }
            conn.subscribe(engine, facility_id);
            Reply::Ok
        }
        Command::Unsubscribe { facility_id } => {
            if conn.unsubscribe(&facility_id) {
                Reply::Ok
            } else {
                protocol_error(format!("not subscribed to {facility_id}"))
            }
        }
    }
}

/// Drive one client connection until it closes or errors.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    sessions: Arc<SessionManager>,
) -> io::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_WIRE_LINE_LEN));
    let (event_tx, mut event_rx) = mpsc::channel(256);
    let mut conn = Connection {
        session: None,
        watchers: HashMap::new(),
        event_tx,
    };

    let result: io::Result<()> = loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(e)) => break Err(io::Error::new(io::ErrorKind::InvalidData, e)),
                };
                if line.trim().is_empty() {
                    continue;
                }

                let reply = match serde_json::from_str::<Command>(&line) {
                    Ok(cmd) => {
                        let label = observability::command_label(&cmd);
                        let start = std::time::Instant::now();
                        let reply = dispatch(&engine, &sessions, &mut conn, cmd).await;
                        let status = match &reply {
                            Reply::Error { .. } => "error",
                            _ => "ok",
                        };
                        metrics::counter!(
                            observability::COMMANDS_TOTAL,
                            "command" => label, "status" => status
                        )
                        .increment(1);
                        metrics::histogram!(
                            observability::COMMAND_DURATION_SECONDS,
                            "command" => label
                        )
                        .record(start.elapsed().as_secs_f64());
                        reply
                    }
                    Err(e) => protocol_error(format!("malformed command: {e}")),
                };
                if let Err(e) = send_reply(&mut framed, &reply).await {
                    break Err(e);
                }
            }
            Some((facility_id, event)) = event_rx.recv() => {
                let reply = Reply::Event { facility_id, event };
                if let Err(e) = send_reply(&mut framed, &reply).await {
                    break Err(e);
                }
            }
        }
    };

    for (_, handle) in conn.watchers.drain() {
        handle.abort();
    }
    if let Some(session) = conn.session.take() {
        sessions.logout(session.token);
    }
    result
}

async fn send_reply(
    framed: &mut Framed<TcpStream, LinesCodec>,
    reply: &Reply,
) -> io::Result<()> {
    let json = serde_json::to_string(reply)?;
    framed
        .send(json)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
}
