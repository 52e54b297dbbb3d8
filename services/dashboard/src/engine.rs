//! Session Reconciliation Engine.
//!
//! Consumes decoded upstream events and reconciles them into session
//! lifecycles. Three closure paths produce the identical end-of-session
//! broadcast and durable mutation:
//!
//! - an explicit `closing` event (no grace);
//! - a `state` snapshot that no longer lists the callsign (3 s grace,
//!   absorbs snapshot jitter and lets an in-flight `closing` win);
//! - the safety-net sweep when no evidence arrives at all (30 s ceiling).
//!
//! Handlers compute transitions under the table lock and perform store
//! writes and hub submissions after releasing it. A closure removes the
//! session from the table before any I/O, which makes every close
//! exactly-once without coordination between the paths.

use chrono::{DateTime, TimeDelta, Utc};
use rd_protocol::{
    ActiveTalker, Closing, Hearing, ReflectorEvent, SessionEvent, SessionStatus, StateSnapshot,
    RECOVERY_RPT1, RECOVERY_UR,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info};

use crate::clock::Clock;
use crate::hub::Hub;
use crate::sessions::{Session, SessionTable};
use crate::store::{NewSession, Store};

/// Seconds a callsign may be absent from state snapshots before the
/// state-derived close fires.
pub const STATE_GRACE_SECS: i64 = 3;

/// Absolute ceiling on time since last evidence; the safety net closes
/// anything older regardless of what the snapshots are doing.
pub const SESSION_TTL_SECS: i64 = 30;

/// Safety-net sampling interval.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

pub struct Engine {
    table: Mutex<SessionTable>,
    store: Arc<Mutex<Store>>,
    hub: Hub,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(store: Arc<Mutex<Store>>, hub: Hub, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(SessionTable::default()),
            store,
            hub,
            clock,
        })
    }

    /// Snapshot of the sessions currently considered active.
    pub async fn active_sessions(&self) -> Vec<Session> {
        self.table.lock().await.sessions().cloned().collect()
    }

    pub async fn handle_event(&self, event: ReflectorEvent) {
        match event {
            ReflectorEvent::Hearing(h) => self.on_hearing(h).await,
            ReflectorEvent::Closing(c) => self.on_closing(c).await,
            ReflectorEvent::State { snapshot, raw } => self.on_state(&snapshot, &raw).await,
            // Unmodeled event types go straight to the subscribers.
            ReflectorEvent::Other(raw) => self.hub.broadcast(raw.to_string()),
        }
    }

    async fn on_hearing(&self, h: Hearing) {
        if h.my.is_empty() {
            return;
        }
        let now = self.clock.now_utc();

        let existing = {
            let mut table = self.table.lock().await;
            table.get_mut(&h.my, &h.module).map(|s| {
                s.touch(now);
                (s.id, s.protocol.clone(), s.started_at)
            })
        };

        let (id, protocol, started_at) = match existing {
            Some(found) => found,
            None => {
                let record = NewSession {
                    my: &h.my,
                    ur: &h.ur,
                    rpt1: &h.rpt1,
                    rpt2: &h.rpt2,
                    module: &h.module,
                    protocol: &h.protocol,
                    created_at: now,
                };
                let id = match self.store.lock().await.create_session(&record) {
                    Ok(id) => id,
                    Err(e) => {
                        // Keep the live stream going; the record stays
                        // divergent until the next successful write.
                        error!(error = %e, callsign = %h.my, "failed to persist new session");
                        0
                    }
                };
                self.table.lock().await.insert(Session {
                    id,
                    callsign: h.my.clone(),
                    module: h.module.clone(),
                    protocol: h.protocol.clone(),
                    ur: h.ur.clone(),
                    rpt2: h.rpt2.clone(),
                    started_at: now,
                    last_seen: now,
                });
                info!(id, callsign = %h.my, module = %h.module, protocol = %h.protocol, "session opened");
                (id, h.protocol.clone(), now)
            }
        };

        let rpt1 = (!h.rpt1.is_empty()).then(|| h.rpt1.clone());
        self.hub.broadcast_json(&SessionEvent {
            kind: "hearing".to_owned(),
            status: SessionStatus::Active,
            id,
            my: h.my,
            ur: h.ur,
            rpt1,
            rpt2: h.rpt2,
            module: h.module,
            protocol,
            duration: None,
            created_at: started_at,
        });
    }

    async fn on_closing(&self, c: Closing) {
        if c.my.is_empty() {
            return;
        }
        let now = self.clock.now_utc();

        let matched = {
            let mut table = self.table.lock().await;
            // Exact key first, then any module: the closing may carry a
            // stale module assignment.
            let module = match table.get(&c.my, &c.module) {
                Some(s) => Some(s.module.clone()),
                None => table.find_by_callsign(&c.my).map(|s| s.module.clone()),
            };
            module.map(|module| {
                let mut removed = table.remove_all_by_callsign(&c.my);
                let idx = removed
                    .iter()
                    .position(|s| s.module == module)
                    .unwrap_or(0);
                removed.swap_remove(idx)
            })
        };

        // No session: nothing to close.
        let Some(session) = matched else { return };
        info!(id = session.id, callsign = %session.callsign, "session closed via closing event");
        self.finish_session(session, now).await;
    }

    async fn on_state(&self, snapshot: &StateSnapshot, raw: &Value) {
        let now = self.clock.now_utc();
        let talkers: HashMap<&str, &ActiveTalker> = snapshot
            .active_talkers
            .iter()
            .filter(|t| !t.callsign.is_empty())
            .map(|t| (t.callsign.as_str(), t))
            .collect();

        let mut corrections: Vec<(i64, String)> = Vec::new();
        let mut heartbeats: Vec<SessionEvent> = Vec::new();
        let mut closed: Vec<Session> = Vec::new();
        let mut missing: Vec<ActiveTalker> = Vec::new();

        {
            let mut table = self.table.lock().await;

            // Phase A: reconcile every live session against the snapshot.
            for key in table.keys() {
                let Some((id, callsign, module, last_seen)) = table
                    .get_key(&key)
                    .map(|s| (s.id, s.callsign.clone(), s.module.clone(), s.last_seen))
                else {
                    continue;
                };
                match talkers.get(callsign.as_str()) {
                    Some(talker) => {
                        let mut current = key;
                        if module != talker.module {
                            // The snapshot is authoritative for module
                            // assignment; fix the record in place.
                            info!(
                                callsign = %callsign,
                                old = %module,
                                new = %talker.module,
                                "correcting session module"
                            );
                            corrections.push((id, talker.module.clone()));
                            table.rekey(&current, &talker.module);
                            current = (current.0, talker.module.clone());
                        }
                        if let Some(session) = table.get_key_mut(&current) {
                            session.touch(now);
                            heartbeats.push(heartbeat_event(session));
                        }
                    }
                    None => {
                        if now - last_seen > TimeDelta::seconds(STATE_GRACE_SECS) {
                            if let Some(session) = table.remove_key(&key) {
                                closed.push(session);
                            }
                        }
                    }
                }
            }

            // Phase B: talkers the dashboard never saw start.
            for talker in talkers.values() {
                if !table.contains_callsign(&talker.callsign) {
                    missing.push((*talker).clone());
                }
            }
        }

        for (id, module) in corrections {
            if let Err(e) = self.store.lock().await.set_module(id, &module) {
                error!(error = %e, id, "failed to correct module on record");
            }
        }
        for heartbeat in heartbeats {
            self.hub.broadcast_json(&heartbeat);
        }
        for session in closed {
            info!(id = session.id, callsign = %session.callsign, "session ended via state sync");
            self.finish_session(session, now).await;
        }
        for talker in missing {
            self.recover_session(&talker, now).await;
        }

        // Retain for subscriber greetings, then rebroadcast as-is.
        self.hub.broadcast_state(raw.to_string());
    }

    /// A talker present in the snapshot with no session: the start was
    /// missed (dropped hearing, or a dashboard restart). Synthesize one.
    async fn recover_session(&self, talker: &ActiveTalker, now: DateTime<Utc>) {
        let rpt2 = format!("URFD {}", talker.module);
        let record = NewSession {
            my: &talker.callsign,
            ur: RECOVERY_UR,
            rpt1: RECOVERY_RPT1,
            rpt2: &rpt2,
            module: &talker.module,
            protocol: &talker.protocol,
            created_at: now,
        };
        let id = match self.store.lock().await.create_session(&record) {
            Ok(id) => id,
            Err(e) => {
                error!(error = %e, callsign = %talker.callsign, "failed to persist recovered session");
                0
            }
        };
        self.table.lock().await.insert(Session {
            id,
            callsign: talker.callsign.clone(),
            module: talker.module.clone(),
            protocol: talker.protocol.clone(),
            ur: RECOVERY_UR.to_owned(),
            rpt2,
            started_at: now,
            last_seen: now,
        });
        info!(id, callsign = %talker.callsign, module = %talker.module, "recovered session from state");
    }

    /// One safety-net pass: close every session with no evidence inside the
    /// TTL window.
    pub async fn sweep(&self) {
        let now = self.clock.now_utc();
        let expired = {
            self.table
                .lock()
                .await
                .drain_expired(now, TimeDelta::seconds(SESSION_TTL_SECS))
        };
        for session in expired {
            info!(id = session.id, callsign = %session.callsign, "session timed out (safety net)");
            self.finish_session(session, now).await;
        }
    }

    /// Shared closure tail: one duration write, one ended broadcast. The
    /// session is already out of the table when this runs.
    async fn finish_session(&self, session: Session, now: DateTime<Utc>) {
        let duration = (now - session.started_at).as_seconds_f64().max(0.0);
        if let Err(e) = self.store.lock().await.set_duration(session.id, duration) {
            error!(error = %e, id = session.id, "failed to update session duration");
        }
        self.hub.broadcast_json(&ended_event(&session, duration));
    }
}

fn heartbeat_event(session: &Session) -> SessionEvent {
    SessionEvent {
        kind: "hearing".to_owned(),
        status: SessionStatus::Active,
        id: session.id,
        my: session.callsign.clone(),
        ur: session.ur.clone(),
        rpt1: None,
        rpt2: session.rpt2.clone(),
        module: session.module.clone(),
        protocol: session.protocol.clone(),
        duration: None,
        created_at: session.started_at,
    }
}

fn ended_event(session: &Session, duration: f64) -> SessionEvent {
    SessionEvent {
        kind: "hearing".to_owned(),
        status: SessionStatus::Ended,
        id: session.id,
        my: session.callsign.clone(),
        ur: session.ur.clone(),
        rpt1: None,
        rpt2: session.rpt2.clone(),
        module: session.module.clone(),
        protocol: session.protocol.clone(),
        duration: Some(duration),
        created_at: session.started_at,
    }
}

/// Periodic safety-net sweeper; runs until shutdown is signalled.
pub async fn run_safety_net(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => engine.sweep().await,
        }
    }
}
