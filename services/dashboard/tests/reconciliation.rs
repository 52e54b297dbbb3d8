//! End-to-end reconciliation scenarios, driven through the real engine,
//! store and hub with a manually-advanced clock.

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use dashboard::clock::ManualClock;
use dashboard::{Engine, Hub, Store, Subscriber};
use rd_protocol::ReflectorEvent;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

struct Harness {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    store: Arc<Mutex<Store>>,
    sub: Subscriber,
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::new(start_time()));
    let store = Arc::new(Mutex::new(Store::open_in_memory().expect("open store")));
    let hub = Hub::new();
    let engine = Engine::new(store.clone(), hub.clone(), clock.clone());
    let sub = hub.attach();
    Harness {
        engine,
        clock,
        store,
        sub,
    }
}

fn event(doc: Value) -> ReflectorEvent {
    rd_protocol::decode(&doc.to_string()).expect("decode")
}

fn hearing(my: &str, module: &str, protocol: &str) -> ReflectorEvent {
    event(json!({
        "type": "hearing", "my": my, "ur": "CQCQCQ",
        "rpt1": "URF262 G", "rpt2": format!("URFD {module}"),
        "module": module, "protocol": protocol,
    }))
}

fn closing(my: &str, module: &str) -> ReflectorEvent {
    event(json!({"type": "closing", "my": my, "module": module, "protocol": "DMR"}))
}

fn state(talkers: &[(&str, &str, &str)]) -> ReflectorEvent {
    let talkers: Vec<Value> = talkers
        .iter()
        .map(|(callsign, module, protocol)| {
            json!({"callsign": callsign, "module": module, "protocol": protocol})
        })
        .collect();
    event(json!({
        "type": "state", "activeTalkers": talkers,
        "Clients": [], "Users": [], "Peers": [],
    }))
}

async fn next_broadcast(sub: &mut Subscriber) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(1), sub.rx.recv())
        .await
        .expect("no broadcast within 1s")
        .expect("hub closed the queue");
    serde_json::from_str(&text).expect("broadcast is JSON")
}

async fn assert_no_broadcast(sub: &mut Subscriber) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), sub.rx.recv()).await;
    assert!(outcome.is_err(), "unexpected broadcast: {outcome:?}");
}

// --- Scenario 1: nominal open/close --------------------------------------

#[tokio::test]
async fn nominal_open_close_yields_one_record_and_paired_broadcasts() {
    let mut h = harness();

    h.engine.handle_event(hearing("W8FU", "A", "DMR")).await;
    let opened = next_broadcast(&mut h.sub).await;
    assert_eq!(opened["type"], "hearing");
    assert_eq!(opened["status"], "active");
    assert_eq!(opened["id"], 1);
    assert_eq!(opened["my"], "W8FU");
    assert_eq!(opened["protocol"], "DMR");
    assert_eq!(opened["created_at"], "2024-05-01T12:00:00Z");

    h.clock.advance(TimeDelta::seconds(5));
    h.engine.handle_event(closing("W8FU", "A")).await;
    let ended = next_broadcast(&mut h.sub).await;
    assert_eq!(ended["status"], "ended");
    assert_eq!(ended["id"], 1);
    let duration = ended["duration"].as_f64().expect("duration");
    assert!((4.9..=5.1).contains(&duration), "duration was {duration}");

    let records = h.store.lock().await.recent_sessions(10).expect("query");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, 1);
    assert!((4.9..=5.1).contains(&records[0].duration));
    assert!(h.engine.active_sessions().await.is_empty());
}

// --- Scenario 2: dropped closing, state-derived close ---------------------

#[tokio::test]
async fn dropped_closing_is_recovered_by_the_state_snapshot() {
    let mut h = harness();

    h.engine.handle_event(hearing("KF8S", "B", "YSF")).await;
    let _ = next_broadcast(&mut h.sub).await;

    h.clock.advance(TimeDelta::seconds(8));
    h.engine.handle_event(state(&[])).await;

    let ended = next_broadcast(&mut h.sub).await;
    assert_eq!(ended["status"], "ended");
    assert_eq!(ended["my"], "KF8S");
    let duration = ended["duration"].as_f64().expect("duration");
    assert!((7.9..=8.1).contains(&duration), "duration was {duration}");

    // The snapshot itself still reaches subscribers afterwards.
    let snapshot = next_broadcast(&mut h.sub).await;
    assert_eq!(snapshot["type"], "state");

    assert!(h.engine.active_sessions().await.is_empty());
}

#[tokio::test]
async fn state_grace_retains_a_recently_seen_session() {
    let mut h = harness();

    h.engine.handle_event(hearing("KF8S", "B", "YSF")).await;
    let _ = next_broadcast(&mut h.sub).await;

    // Inside the 3 s grace: snapshot jitter must not close the session.
    h.clock.advance(TimeDelta::seconds(2));
    h.engine.handle_event(state(&[])).await;
    let snapshot = next_broadcast(&mut h.sub).await;
    assert_eq!(snapshot["type"], "state");
    assert_eq!(h.engine.active_sessions().await.len(), 1);
}

// --- Scenario 3: safety-net close ----------------------------------------

#[tokio::test]
async fn safety_net_closes_a_session_with_no_evidence_exactly_once() {
    let mut h = harness();

    h.engine.handle_event(hearing("KZ8Z", "C", "M17")).await;
    let _ = next_broadcast(&mut h.sub).await;

    h.clock.advance(TimeDelta::seconds(35));
    h.engine.sweep().await;

    let ended = next_broadcast(&mut h.sub).await;
    assert_eq!(ended["status"], "ended");
    assert_eq!(ended["my"], "KZ8Z");
    let duration = ended["duration"].as_f64().expect("duration");
    assert!((29.9..=35.1).contains(&duration), "duration was {duration}");
    assert!(h.engine.active_sessions().await.is_empty());

    // A second pass finds nothing: one ended broadcast total.
    h.engine.sweep().await;
    assert_no_broadcast(&mut h.sub).await;
}

// --- Scenario 4: module correction ---------------------------------------

#[tokio::test]
async fn state_snapshot_corrects_a_stale_module_in_place() {
    let mut h = harness();

    h.engine.handle_event(hearing("K8PR", "A", "P25")).await;
    let _ = next_broadcast(&mut h.sub).await;

    h.clock.advance(TimeDelta::seconds(1));
    h.engine.handle_event(state(&[("K8PR", "B", "P25")])).await;

    // Heartbeat carries the corrected module.
    let heartbeat = next_broadcast(&mut h.sub).await;
    assert_eq!(heartbeat["status"], "active");
    assert_eq!(heartbeat["id"], 1);
    assert_eq!(heartbeat["module"], "B");
    let _snapshot = next_broadcast(&mut h.sub).await;

    // Exactly one session, rekeyed; exactly one record, corrected.
    let sessions = h.engine.active_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].module, "B");
    let records = h.store.lock().await.recent_sessions(10).expect("query");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].module, "B");
}

// --- Scenario 5: recovery from state --------------------------------------

#[tokio::test]
async fn state_snapshot_recovers_a_session_missed_at_start() {
    let mut h = harness();

    h.engine.handle_event(state(&[("N8DBF", "A", "DMR")])).await;
    let snapshot = next_broadcast(&mut h.sub).await;
    assert_eq!(snapshot["type"], "state");

    let sessions = h.engine.active_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].callsign, "N8DBF");

    let records = h.store.lock().await.recent_sessions(10).expect("query");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].rpt1, "SIMULATOR");
    assert_eq!(records[0].ur, "CQCQCQ");
    assert_eq!(records[0].rpt2, "URFD A");
    assert_eq!(records[0].module, "A");
}

// --- Idempotence and no-op paths -----------------------------------------

#[tokio::test]
async fn repeated_hearings_refresh_the_session_without_new_records() {
    let mut h = harness();

    for _ in 0..3 {
        h.engine.handle_event(hearing("W8FU", "A", "DMR")).await;
        h.clock.advance(TimeDelta::seconds(1));
    }
    for _ in 0..3 {
        let active = next_broadcast(&mut h.sub).await;
        assert_eq!(active["status"], "active");
        assert_eq!(active["id"], 1);
    }

    assert_eq!(h.engine.active_sessions().await.len(), 1);
    let records = h.store.lock().await.recent_sessions(10).expect("query");
    assert_eq!(records.len(), 1);
}

#[tokio::test]
async fn closing_without_a_session_is_a_silent_no_op() {
    let mut h = harness();
    h.engine.handle_event(closing("W8FU", "A")).await;
    assert_no_broadcast(&mut h.sub).await;
    assert!(h.store.lock().await.recent_sessions(10).expect("query").is_empty());
}

#[tokio::test]
async fn closing_with_a_stale_module_still_finds_the_session() {
    let mut h = harness();

    h.engine.handle_event(hearing("W8FU", "A", "DMR")).await;
    let _ = next_broadcast(&mut h.sub).await;

    h.clock.advance(TimeDelta::seconds(4));
    h.engine.handle_event(closing("W8FU", "C")).await;
    let ended = next_broadcast(&mut h.sub).await;
    assert_eq!(ended["status"], "ended");
    assert_eq!(ended["id"], 1);
    assert!(h.engine.active_sessions().await.is_empty());
}

#[tokio::test]
async fn hearings_with_empty_callsigns_are_dropped() {
    let mut h = harness();
    h.engine
        .handle_event(event(json!({"type": "hearing", "my": "   ", "module": "A"})))
        .await;
    assert_no_broadcast(&mut h.sub).await;
    assert!(h.engine.active_sessions().await.is_empty());
}

#[tokio::test]
async fn state_heartbeats_keep_a_session_alive_across_sweeps() {
    let mut h = harness();

    h.engine.handle_event(hearing("WT8X", "A", "DMR")).await;
    let _ = next_broadcast(&mut h.sub).await;

    // Snapshots every 10 s keep refreshing last_seen, so the safety net
    // never fires while the talker stays listed.
    for _ in 0..4 {
        h.clock.advance(TimeDelta::seconds(10));
        h.engine.handle_event(state(&[("WT8X", "A", "DMR")])).await;
        let heartbeat = next_broadcast(&mut h.sub).await;
        assert_eq!(heartbeat["status"], "active");
        assert_eq!(heartbeat["id"], 1);
        let _snapshot = next_broadcast(&mut h.sub).await;
        h.engine.sweep().await;
    }
    assert_eq!(h.engine.active_sessions().await.len(), 1);
}

#[tokio::test]
async fn unknown_event_types_pass_through_to_subscribers_untouched() {
    let mut h = harness();
    h.engine
        .handle_event(event(json!({
            "type": "client_connect", "callsign": "N7TAE", "module": "A", "extra": 42
        })))
        .await;
    let passed = next_broadcast(&mut h.sub).await;
    assert_eq!(passed["type"], "client_connect");
    assert_eq!(passed["extra"], 42);
}

// --- Full pipeline: socket → decoder → engine → subscriber ----------------

#[tokio::test]
async fn ingest_pipeline_delivers_events_from_the_socket_to_subscribers() {
    let mut h = harness();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();

    let socket = dashboard::ingest::connect(&addr).await.expect("connect");
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ingest = tokio::spawn(dashboard::ingest::run_ingest(
        addr,
        socket,
        h.engine.clone(),
        shutdown_rx,
    ));

    let (mut upstream, _) = listener.accept().await.expect("accept");
    upstream
        .write_all(
            b"{\"type\":\"hearing\",\"my\":\"W8FU\",\"module\":\"A\",\"protocol\":\"DMR\"}\n\
              not json at all\n\
              {\"type\":\"closing\",\"my\":\"W8FU\",\"module\":\"A\",\"protocol\":\"DMR\"}\n",
        )
        .await
        .expect("write");

    let opened = next_broadcast(&mut h.sub).await;
    assert_eq!(opened["status"], "active");
    // The malformed line was dropped without stalling the loop.
    let ended = next_broadcast(&mut h.sub).await;
    assert_eq!(ended["status"], "ended");

    shutdown_tx.send(true).expect("signal shutdown");
    ingest.await.expect("ingest task");
}
