//! In-memory session table.
//!
//! Primary index is the `(callsign, module)` pair. The table itself is not
//! synchronized; the engine owns it behind a single mutex and no reader ever
//! observes a partially-applied mutation.

use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;

/// Primary index key: `(callsign, module)`.
pub type SessionKey = (String, String);

/// One continuous transmission by one callsign on one module.
///
/// The durable record with the same `id` is created before the session
/// enters the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: i64,
    pub callsign: String,
    pub module: String,
    pub protocol: String,
    pub ur: String,
    pub rpt2: String,
    pub started_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        (self.callsign.clone(), self.module.clone())
    }

    /// Record corroborating evidence; `last_seen` never moves backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionTable {
    by_key: HashMap<SessionKey, Session>,
}

impl SessionTable {
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn insert(&mut self, session: Session) {
        self.by_key.insert(session.key(), session);
    }

    pub fn get(&self, callsign: &str, module: &str) -> Option<&Session> {
        self.by_key
            .get(&(callsign.to_owned(), module.to_owned()))
    }

    pub fn get_mut(&mut self, callsign: &str, module: &str) -> Option<&mut Session> {
        self.by_key
            .get_mut(&(callsign.to_owned(), module.to_owned()))
    }

    pub fn get_key(&self, key: &SessionKey) -> Option<&Session> {
        self.by_key.get(key)
    }

    pub fn get_key_mut(&mut self, key: &SessionKey) -> Option<&mut Session> {
        self.by_key.get_mut(key)
    }

    pub fn remove_key(&mut self, key: &SessionKey) -> Option<Session> {
        self.by_key.remove(key)
    }

    /// Snapshot of the current keys, for iteration that mutates the table.
    pub fn keys(&self) -> Vec<SessionKey> {
        self.by_key.keys().cloned().collect()
    }

    /// Linear fallback lookup, used when a `closing` arrives with a stale
    /// module assignment.
    pub fn find_by_callsign(&self, callsign: &str) -> Option<&Session> {
        self.by_key.values().find(|s| s.callsign == callsign)
    }

    pub fn contains_callsign(&self, callsign: &str) -> bool {
        self.by_key.values().any(|s| s.callsign == callsign)
    }

    /// Move a session to a corrected module, updating both the record and
    /// its primary key in one step.
    pub fn rekey(&mut self, key: &SessionKey, new_module: &str) -> bool {
        let Some(mut session) = self.by_key.remove(key) else {
            return false;
        };
        session.module = new_module.to_owned();
        self.insert(session);
        true
    }

    /// Remove every session for `callsign`, across all modules.
    pub fn remove_all_by_callsign(&mut self, callsign: &str) -> Vec<Session> {
        let keys: Vec<SessionKey> = self
            .by_key
            .keys()
            .filter(|(call, _)| call == callsign)
            .cloned()
            .collect();
        keys.iter()
            .filter_map(|k| self.by_key.remove(k))
            .collect()
    }

    /// Remove and return every session whose last evidence is older than
    /// `ttl`.
    pub fn drain_expired(&mut self, now: DateTime<Utc>, ttl: TimeDelta) -> Vec<Session> {
        let keys: Vec<SessionKey> = self
            .by_key
            .iter()
            .filter(|(_, s)| now - s.last_seen > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter()
            .filter_map(|k| self.by_key.remove(k))
            .collect()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.by_key.values()
    }
}
