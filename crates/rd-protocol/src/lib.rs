// rd-protocol: URF reflector telemetry wire types and decoding.
//
// Upstream documents are JSON, one per transport message, dispatched on the
// top-level `type` field. The producer uses mixed field casing (`Clients`
// capitalized but `type` lowercase); the types here mirror the observed
// schema exactly rather than normalizing it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Destination callsign written to records synthesized from a state
/// snapshot (no real routing header was ever received for them).
pub const RECOVERY_UR: &str = "CQCQCQ";

/// `rpt1` marker identifying a record as state-derived rather than built
/// from a genuine hearing frame.
pub const RECOVERY_RPT1: &str = "SIMULATOR";

// ---------------------------------------------------------------------------
// Upstream event variants
// ---------------------------------------------------------------------------

/// An active transmission frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Hearing {
    /// Transmitting callsign.
    #[serde(default)]
    pub my: String,
    /// Destination callsign (usually `CQCQCQ`).
    #[serde(default)]
    pub ur: String,
    #[serde(default)]
    pub rpt1: String,
    #[serde(default)]
    pub rpt2: String,
    /// Single-character reflector sub-channel.
    #[serde(default)]
    pub module: String,
    /// Transport protocol tag, e.g. "DMR", "YSF", "M17".
    #[serde(default)]
    pub protocol: String,
}

/// End of transmission. Advisory: the producer may drop these.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Closing {
    #[serde(default)]
    pub my: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub protocol: String,
}

/// One currently-transmitting user in a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveTalker {
    #[serde(default)]
    pub callsign: String,
    #[serde(default)]
    pub module: String,
    #[serde(default)]
    pub protocol: String,
}

/// Periodic full snapshot from the reflector; the only ground truth.
///
/// The peripheral lists are carried opaquely — the dashboard rebroadcasts
/// them to subscribers but never inspects their contents.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateSnapshot {
    #[serde(default, rename = "activeTalkers")]
    pub active_talkers: Vec<ActiveTalker>,
    #[serde(default, rename = "Clients")]
    pub clients: Value,
    #[serde(default, rename = "Users")]
    pub users: Value,
    #[serde(default, rename = "Peers")]
    pub peers: Value,
    #[serde(default, rename = "Modules")]
    pub modules: Value,
}

/// A decoded upstream document.
///
/// `State` keeps the raw document alongside the parsed snapshot so it can be
/// rebroadcast (and retained for subscriber greetings) without losing fields
/// the dashboard does not model.
#[derive(Debug, Clone, PartialEq)]
pub enum ReflectorEvent {
    Hearing(Hearing),
    Closing(Closing),
    State { snapshot: StateSnapshot, raw: Value },
    /// Any other `type` (e.g. `client_connect`); passed through untouched.
    Other(Value),
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document has no `type` field")]
    MissingType,
}

/// Decode one upstream JSON document.
///
/// Whitespace-trims `my`, `module` and talker `callsign`/`module` so every
/// downstream comparison sees canonical forms. Unknown fields are ignored;
/// unknown `type` values become [`ReflectorEvent::Other`].
pub fn decode(input: &str) -> Result<ReflectorEvent, DecodeError> {
    let raw: Value = serde_json::from_str(input)?;
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    match kind {
        "hearing" => {
            let mut ev: Hearing = serde_json::from_value(raw)?;
            trim_in_place(&mut ev.my);
            trim_in_place(&mut ev.module);
            Ok(ReflectorEvent::Hearing(ev))
        }
        "closing" => {
            let mut ev: Closing = serde_json::from_value(raw)?;
            trim_in_place(&mut ev.my);
            trim_in_place(&mut ev.module);
            Ok(ReflectorEvent::Closing(ev))
        }
        "state" => {
            let mut snapshot: StateSnapshot = serde_json::from_value(raw.clone())?;
            for talker in &mut snapshot.active_talkers {
                trim_in_place(&mut talker.callsign);
                trim_in_place(&mut talker.module);
            }
            Ok(ReflectorEvent::State { snapshot, raw })
        }
        _ => Ok(ReflectorEvent::Other(raw)),
    }
}

fn trim_in_place(s: &mut String) {
    let trimmed = s.trim();
    if trimmed.len() != s.len() {
        *s = trimmed.to_owned();
    }
}

// ---------------------------------------------------------------------------
// Downstream broadcast envelope
// ---------------------------------------------------------------------------

/// Session lifecycle phase carried on every [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// The enriched `hearing` envelope delivered to subscribers.
///
/// Real hearing frames, synthetic heartbeats and end-of-session messages all
/// use this shape; they differ only in `status` and `duration`. Optional
/// fields are omitted when absent, matching the upstream producer's own
/// envelope conventions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: SessionStatus,
    /// Durable record id assigned at session creation.
    pub id: i64,
    pub my: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ur: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpt1: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rpt2: String,
    pub module: String,
    pub protocol: String,
    /// Transmission length in seconds; present only on ended events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Session start instant, RFC3339 UTC.
    pub created_at: DateTime<Utc>,
}
