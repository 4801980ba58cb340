use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use hallkeep::engine::Engine;
use hallkeep::notify::NotifyHub;
use hallkeep::session::SessionManager;
use hallkeep::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("hallkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join("hallkeep.wal");

    let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new())).unwrap());
    engine.ensure_admin("letmein").await.unwrap();
    let sessions = Arc::new(SessionManager::new());

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = engine.clone();
            let sessions = sessions.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, sessions).await;
            });
        }
    });

    addr
}

struct Client {
    framed: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("reply timeout")
            .expect("connection closed")
            .expect("codec error");
        serde_json::from_str(&line).expect("reply is not JSON")
    }

    async fn send(&mut self, cmd: Value) -> Value {
        self.framed.send(cmd.to_string()).await.unwrap();
        self.recv().await
    }

    async fn login(&mut self, username: &str, password: &str) -> Value {
        let reply = self
            .send(json!({"cmd": "login", "username": username, "password": password}))
            .await;
        assert_eq!(reply["reply"], "session", "login failed: {reply}");
        reply
    }
}

async fn admin_client(addr: SocketAddr) -> Client {
    let mut c = Client::connect(addr).await;
    c.login("admin", "letmein").await;
    c
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn commands_require_login() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let reply = c.send(json!({"cmd": "list_facilities"})).await;
    assert_eq!(reply["reply"], "error");
    assert_eq!(reply["code"], "unauthenticated");

    let reply = c
        .send(json!({"cmd": "login", "username": "admin", "password": "wrong"}))
        .await;
    assert_eq!(reply["code"], "auth_failed");
}

#[tokio::test]
async fn malformed_lines_get_bad_request() {
    let addr = start_test_server().await;
    let mut c = Client::connect(addr).await;

    let reply = c.send(json!({"cmd": "no_such_command"})).await;
    assert_eq!(reply["code"], "bad_request");

    c.framed.send("this is not json".to_string()).await.unwrap();
    let reply = c.recv().await;
    assert_eq!(reply["code"], "bad_request");
}

#[tokio::test]
async fn booking_flow_with_conflict_gate() {
    let addr = start_test_server().await;
    let mut admin = admin_client(addr).await;

    let facility = admin
        .send(json!({"cmd": "create_facility", "name": "Main Hall", "equipment": ["Stage"]}))
        .await;
    assert_eq!(facility["reply"], "facility", "{facility}");
    let fid = facility["facility"]["id"].as_str().unwrap().to_string();

    let created = admin
        .send(json!({
            "cmd": "create_user",
            "full_name": "Dana Velez",
            "username": "dana",
            "password": "pw",
            "email": "dana@example.org",
            "role": "USER",
        }))
        .await;
    assert_eq!(created["reply"], "user", "{created}");

    let mut dana = Client::connect(addr).await;
    dana.login("dana", "pw").await;

    let first = dana
        .send(json!({
            "cmd": "submit_request",
            "facility_id": fid,
            "requester_name": "Dana Velez",
            "title": "Rehearsal",
            "date": "2024-06-01",
            "start": "09:00",
            "end": "10:00",
        }))
        .await;
    assert_eq!(first["reply"], "request", "{first}");
    assert_eq!(first["request"]["status"], "Pending");
    let first_id = first["request"]["id"].as_str().unwrap().to_string();

    // Inside the 30-minute margin of a pending booking: soft block
    let soft = dana
        .send(json!({
            "cmd": "submit_request",
            "facility_id": fid,
            "requester_name": "Dana Velez",
            "title": "Warmup",
            "date": "2024-06-01",
            "start": "10:20",
            "end": "11:00",
        }))
        .await;
    assert_eq!(soft["code"], "override_required");
    assert_eq!(soft["conflicts"][0], first_id.as_str());

    // Same submission with the override flag goes through
    let forced = dana
        .send(json!({
            "cmd": "submit_request",
            "facility_id": fid,
            "requester_name": "Dana Velez",
            "title": "Warmup",
            "date": "2024-06-01",
            "start": "10:20",
            "end": "11:00",
            "override_pending": true,
        }))
        .await;
    assert_eq!(forced["reply"], "request", "{forced}");

    // Admin approves the first request
    let approved = admin
        .send(json!({"cmd": "set_status", "id": first_id, "status": "Approved"}))
        .await;
    assert_eq!(approved["request"]["status"], "Approved");

    // Now the margin is a hard block, override or not
    let hard = dana
        .send(json!({
            "cmd": "submit_request",
            "facility_id": fid,
            "requester_name": "Dana Velez",
            "title": "Encore",
            "date": "2024-06-01",
            "start": "10:15",
            "end": "10:45",
            "override_pending": true,
        }))
        .await;
    assert_eq!(hard["code"], "approved_conflict");

    // Dana only sees her own requests; admin sees them too
    let mine = dana.send(json!({"cmd": "list_requests"})).await;
    assert_eq!(mine["requests"].as_array().unwrap().len(), 2);

    // Dana may cancel her own booking, and terminal slots free the window
    let canceled = dana
        .send(json!({"cmd": "cancel_request", "id": first_id}))
        .await;
    assert_eq!(canceled["request"]["status"], "Canceled");
}

#[tokio::test]
async fn availability_probe_reports_both_tiers() {
    let addr = start_test_server().await;
    let mut admin = admin_client(addr).await;

    let facility = admin
        .send(json!({"cmd": "create_facility", "name": "Studio"}))
        .await;
    let fid = facility["facility"]["id"].as_str().unwrap().to_string();

    let approved = admin
        .send(json!({
            "cmd": "submit_request",
            "facility_id": fid,
            "requester_name": "Admin",
            "title": "Setup",
            "date": "2024-06-01",
            "start": "09:00",
            "end": "10:00",
        }))
        .await;
    let approved_id = approved["request"]["id"].as_str().unwrap().to_string();
    admin
        .send(json!({"cmd": "set_status", "id": approved_id, "status": "Approved"}))
        .await;

    let probe = admin
        .send(json!({
            "cmd": "check_availability",
            "facility_id": fid,
            "date": "2024-06-01",
            "start": "10:15",
            "end": "11:00",
        }))
        .await;
    assert_eq!(probe["reply"], "conflicts");
    assert_eq!(probe["approved"][0], approved_id.as_str());
    assert_eq!(probe["pending"].as_array().unwrap().len(), 0);

    // Exactly at the buffered edge: clear
    let probe = admin
        .send(json!({
            "cmd": "check_availability",
            "facility_id": fid,
            "date": "2024-06-01",
            "start": "10:30",
            "end": "11:00",
        }))
        .await;
    assert_eq!(probe["approved"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn subscription_pushes_change_events() {
    let addr = start_test_server().await;
    let mut admin = admin_client(addr).await;

    let facility = admin
        .send(json!({"cmd": "create_facility", "name": "Annex"}))
        .await;
    let fid = facility["facility"]["id"].as_str().unwrap().to_string();

    let mut watcher = admin_client(addr).await;
    let sub = watcher.send(json!({"cmd": "subscribe", "facility_id": fid})).await;
    assert_eq!(sub["reply"], "ok");

    let submitted = admin
        .send(json!({
            "cmd": "submit_request",
            "facility_id": fid,
            "requester_name": "Admin",
            "title": "Inspection",
            "date": "2024-06-02",
            "start": "08:00",
            "end": "09:00",
        }))
        .await;
    let rid = submitted["request"]["id"].as_str().unwrap().to_string();

    let pushed = watcher.recv().await;
    assert_eq!(pushed["reply"], "event", "{pushed}");
    assert_eq!(pushed["facility_id"], fid.as_str());
    assert_eq!(pushed["event"]["RequestSubmitted"]["id"], rid.as_str());

    // After unsubscribe nothing further arrives
    let unsub = watcher
        .send(json!({"cmd": "unsubscribe", "facility_id": fid}))
        .await;
    assert_eq!(unsub["reply"], "ok");

    admin
        .send(json!({"cmd": "set_status", "id": rid, "status": "Rejected"}))
        .await;
    let quiet = tokio::time::timeout(Duration::from_millis(300), watcher.framed.next()).await;
    assert!(quiet.is_err(), "unsubscribed client still received a line");
}

#[tokio::test]
async fn bad_time_strings_rejected_at_the_boundary() {
    let addr = start_test_server().await;
    let mut admin = admin_client(addr).await;

    let facility = admin
        .send(json!({"cmd": "create_facility", "name": "Lab"}))
        .await;
    let fid = facility["facility"]["id"].as_str().unwrap().to_string();

    for (start, end) in [("25:00", "26:00"), ("9am", "10am"), ("10:00", "09:00")] {
        let reply = admin
            .send(json!({
                "cmd": "submit_request",
                "facility_id": fid,
                "requester_name": "Admin",
                "title": "Bad",
                "date": "2024-06-01",
                "start": start,
                "end": end,
            }))
            .await;
        assert_eq!(reply["reply"], "error", "accepted {start}-{end}: {reply}");
    }
}
