use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use slotbook::config::SchedulerConfig;
use slotbook::engine::Engine;
use slotbook::scheduler::Scheduler;
use slotbook::wire;

const H: i64 = 3_600_000;
const M: i64 = 60_000;
// 2024-01-01T00:00:00Z, a Monday.
const MONDAY: i64 = 1_704_067_200_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::open(dir.join("slotbook.wal")).unwrap());
    let scheduler = Arc::new(Scheduler::new(engine, SchedulerConfig::default()));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, scheduler).await;
            });
        }
    });

    addr
}

struct Client {
    lines: Framed<TcpStream, LinesCodec>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            lines: Framed::new(socket, LinesCodec::new()),
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.lines.send(line.to_string()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.lines.next())
            .await
            .expect("response timed out")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, request: Value) -> Value {
        self.send_raw(&request.to_string()).await
    }
}

fn monday_rule() -> Value {
    json!({
        "day_of_week": 1,
        "start_time": "09:00",
        "end_time": "10:00",
        "slot_length_minutes": 30,
        "title": "office hours"
    })
}

fn book(subject: &str, start: i64, end: i64, contact: &str) -> Value {
    json!({
        "op": "create_booking",
        "subject": subject,
        "booking": { "contact": contact, "start_at": start, "end_at": end }
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn full_booking_flow() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let v = client
        .call(json!({"op": "set_availability", "subject": "alice", "rules": [monday_rule()]}))
        .await;
    assert_eq!(v["ok"], true);
    let rule_id = v["data"][0]["id"].as_str().unwrap().to_string();

    let v = client
        .call(json!({"op": "list_availability", "subject": "alice"}))
        .await;
    assert_eq!(v["data"][0]["title"], "office hours");

    let free = json!({"op": "get_free_slots", "subject": "alice", "from": MONDAY, "to": MONDAY + 24 * H});
    let v = client.call(free.clone()).await;
    assert_eq!(
        v["data"],
        json!([
            {"start_at": MONDAY + 9 * H, "end_at": MONDAY + 9 * H + 30 * M},
            {"start_at": MONDAY + 9 * H + 30 * M, "end_at": MONDAY + 10 * H},
        ])
    );

    let v = client
        .call(book("alice", MONDAY + 9 * H, MONDAY + 9 * H + 30 * M, "bob@example.com"))
        .await;
    assert_eq!(v["ok"], true);
    let booking_id = v["data"]["id"].as_str().unwrap().to_string();

    let v = client.call(free.clone()).await;
    assert_eq!(v["data"].as_array().unwrap().len(), 1);
    assert_eq!(v["data"][0]["start_at"], MONDAY + 9 * H + 30 * M);

    let v = client
        .call(book("alice", MONDAY + 9 * H, MONDAY + 9 * H + 30 * M, "carol@example.com"))
        .await;
    assert_eq!(v["error"]["code"], "slot_taken");
    assert_eq!(v["error"]["class"], "conflict");

    let v = client
        .call(json!({"op": "list_bookings", "subject": "alice"}))
        .await;
    assert_eq!(v["data"].as_array().unwrap().len(), 1);

    let v = client
        .call(json!({"op": "cancel_booking", "booking_id": booking_id}))
        .await;
    assert_eq!(v["data"]["status"], "cancelled");

    let v = client
        .call(json!({"op": "cancel_booking", "booking_id": booking_id}))
        .await;
    assert_eq!(v["error"]["code"], "already_cancelled");

    let v = client
        .call(json!({
            "op": "update_availability",
            "subject": "alice",
            "rule_id": rule_id,
            "patch": {"available": false}
        }))
        .await;
    assert_eq!(v["data"]["available"], false);
    let v = client.call(free).await;
    assert_eq!(v["data"], json!([]));
}

#[tokio::test]
async fn errors_map_to_codes_and_classes() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let v = client
        .call(json!({"op": "get_free_slots", "subject": "alice", "from": MONDAY + H, "to": MONDAY}))
        .await;
    assert_eq!(v["error"]["code"], "bad_range");
    assert_eq!(v["error"]["class"], "bad_request");

    let v = client
        .call(book("alice", MONDAY + 9 * H, MONDAY + 9 * H + 30 * M, "bob@example.com"))
        .await;
    assert_eq!(v["error"]["code"], "slot_not_available");

    let v = client
        .call(json!({"op": "cancel_booking", "booking_id": Ulid::new().to_string()}))
        .await;
    assert_eq!(v["error"]["code"], "not_found");
    assert_eq!(v["error"]["class"], "not_found");

    let v = client
        .call(json!({
            "op": "set_availability",
            "subject": "alice",
            "rules": [{"day_of_week": 1, "start_time": "10:00", "end_time": "09:00", "slot_length_minutes": 30}]
        }))
        .await;
    assert_eq!(v["error"]["code"], "invalid_rule");

    let v = client.send_raw("not json at all").await;
    assert_eq!(v["error"]["code"], "invalid_request");

    // The connection survives bad input.
    let v = client
        .call(json!({"op": "list_bookings", "subject": "alice"}))
        .await;
    assert_eq!(v["ok"], true);
}

#[tokio::test]
async fn concurrent_clients_race_for_one_slot() {
    let addr = start_test_server().await;
    let mut admin = Client::connect(addr).await;
    admin
        .call(json!({"op": "set_availability", "subject": "alice", "rules": [monday_rule()]}))
        .await;

    let n = 10;
    let mut handles = Vec::new();
    for i in 0..n {
        handles.push(tokio::spawn(async move {
            let mut client = Client::connect(addr).await;
            client
                .call(book(
                    "alice",
                    MONDAY + 9 * H,
                    MONDAY + 9 * H + 30 * M,
                    &format!("guest{i}@example.com"),
                ))
                .await
        }));
    }

    let mut confirmed = 0;
    let mut taken = 0;
    for h in handles {
        let v = h.await.unwrap();
        if v["ok"] == true {
            confirmed += 1;
        } else {
            assert_eq!(v["error"]["code"], "slot_taken");
            taken += 1;
        }
    }
    assert_eq!(confirmed, 1);
    assert_eq!(taken, n - 1);
}

#[tokio::test]
async fn oversized_line_is_rejected_without_closing() {
    let addr = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let huge = format!(
        r#"{{"op":"list_availability","subject":"{}"}}"#,
        "x".repeat(slotbook::limits::MAX_LINE_LEN)
    );
    let v = client.send_raw(&huge).await;
    assert_eq!(v["error"]["code"], "limit_exceeded");

    let v = client
        .call(json!({"op": "list_availability", "subject": "alice"}))
        .await;
    assert_eq!(v["ok"], true);
}
