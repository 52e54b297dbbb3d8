//! Synthetic reflector traffic.
//!
//! Each module runs a small idle → talking → post-TX-gap state machine over
//! a roster of callsigns, which is roughly how a quiet reflector behaves: a
//! transmission, a pause for replies, the occasional fresh conversation. A
//! configurable fraction of `closing` events is dropped on purpose so a
//! consuming dashboard has to exercise its state-derived and safety-net
//! closure paths.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use rd_protocol::{RECOVERY_RPT1, RECOVERY_UR};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

pub const ROSTER: &[&str] = &[
    "KF8S", "KI5RNN", "W8CPT", "W8EAP", "KE8VSI", "KZ8Z", "KE8RUH", "N8DBF", "KF8DRC", "W8FU",
    "W8VD", "K8PR", "KC8KJO", "KE8TFM", "WT8X", "AD8OD",
];

const PROTOCOLS: &[&str] = &["DMR", "YSF", "M17", "P25", "D-Star"];

const MODULES: &[(&str, &str)] = &[
    ("A", "International / Primary"),
    ("B", "Local Chat / Secondary"),
    ("C", "Technical Discussions"),
    ("D", "Data & Testing"),
    ("E", "Emergency / Weather"),
];

/// Seconds between full state snapshots.
const STATE_INTERVAL: u64 = 10;

#[derive(Debug)]
enum Phase {
    Idle,
    Talking {
        callsign: String,
        protocol: String,
        until: DateTime<Utc>,
    },
    Gap {
        until: DateTime<Utc>,
    },
}

#[derive(Debug)]
struct ModuleSim {
    name: String,
    phase: Phase,
}

enum Step {
    Unkey { callsign: String, protocol: String },
    EndGap,
    MaybeTalk { chance: f32 },
    Wait,
}

#[derive(Debug, Clone)]
struct Node {
    protocol: String,
    module: String,
    connected_at: DateTime<Utc>,
}

pub struct Reflector {
    modules: Vec<ModuleSim>,
    /// Roster callsign → home module.
    users: HashMap<String, String>,
    nodes: HashMap<String, Node>,
    drop_rate: f32,
    ticks: u64,
}

impl Reflector {
    pub fn new(drop_rate: f32, now: DateTime<Utc>) -> Self {
        let mut rng = rand::thread_rng();
        let modules = ["A", "B", "C"]
            .iter()
            .map(|name| ModuleSim {
                name: (*name).to_owned(),
                phase: Phase::Idle,
            })
            .collect();

        let users = ROSTER
            .iter()
            .map(|call| {
                let module = ["A", "B", "C"][rng.gen_range(0..3)];
                ((*call).to_owned(), module.to_owned())
            })
            .collect();

        let mut nodes = HashMap::new();
        for i in 1..=5 {
            let call = ROSTER[i % ROSTER.len()];
            nodes.insert(
                call.to_owned(),
                Node {
                    protocol: "DMR".to_owned(),
                    module: ["A", "B", "C"][rng.gen_range(0..3)].to_owned(),
                    connected_at: now - TimeDelta::minutes(rng.gen_range(0..100)),
                },
            );
        }

        Self {
            modules,
            users,
            nodes,
            drop_rate,
            ticks: 0,
        }
    }

    /// Advance one second of simulated activity; returns the documents to
    /// publish, in order.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Value> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        self.ticks += 1;

        for i in 0..self.modules.len() {
            let step = match &self.modules[i].phase {
                Phase::Talking {
                    callsign,
                    protocol,
                    until,
                } if now >= *until => Step::Unkey {
                    callsign: callsign.clone(),
                    protocol: protocol.clone(),
                },
                Phase::Talking { .. } => Step::Wait,
                Phase::Gap { until } if now >= *until => Step::EndGap,
                // Replies come quickly inside a conversation.
                Phase::Gap { .. } => Step::MaybeTalk { chance: 0.2 },
                Phase::Idle => Step::MaybeTalk { chance: 0.05 },
            };
            match step {
                Step::Unkey { callsign, protocol } => {
                    let name = self.modules[i].name.clone();
                    if rng.gen::<f32>() < self.drop_rate {
                        debug!(module = %name, callsign = %callsign, "dropping closing on purpose");
                    } else {
                        out.push(closing_doc(&name, &callsign, &protocol));
                    }
                    info!(module = %name, callsign = %callsign, "talker unkeyed");
                    self.modules[i].phase = Phase::Gap {
                        until: now + TimeDelta::seconds(rng.gen_range(2..7)),
                    };
                }
                Step::EndGap => self.modules[i].phase = Phase::Idle,
                Step::MaybeTalk { chance } => {
                    if rng.gen::<f32>() < chance {
                        if let Some(doc) = self.start_talker(i, now) {
                            out.push(doc);
                        }
                    }
                }
                Step::Wait => {}
            }
        }

        self.churn_nodes(now);

        if self.ticks % STATE_INTERVAL == 0 {
            out.push(self.state_doc(now));
        }
        out
    }

    fn start_talker(&mut self, module_idx: usize, now: DateTime<Utc>) -> Option<Value> {
        let mut rng = rand::thread_rng();
        let name = self.modules[module_idx].name.clone();

        let busy: Vec<String> = self
            .modules
            .iter()
            .filter_map(|m| match &m.phase {
                Phase::Talking { callsign, .. } => Some(callsign.clone()),
                _ => None,
            })
            .collect();
        let candidates: Vec<&String> = self
            .users
            .iter()
            .filter(|(call, module)| module.as_str() == name && !busy.contains(*call))
            .map(|(call, _)| call)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let callsign = candidates[rng.gen_range(0..candidates.len())].clone();
        let protocol = PROTOCOLS[rng.gen_range(0..PROTOCOLS.len())].to_owned();

        info!(module = %name, callsign = %callsign, protocol = %protocol, "talker keyed up");
        let doc = hearing_doc(&name, &callsign, &protocol);
        self.modules[module_idx].phase = Phase::Talking {
            callsign,
            protocol,
            until: now + TimeDelta::seconds(rng.gen_range(5..35)),
        };
        Some(doc)
    }

    fn churn_nodes(&mut self, now: DateTime<Utc>) {
        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() >= 0.005 {
            return;
        }
        if self.nodes.len() > 3 && rng.gen::<f32>() < 0.5 {
            if let Some(call) = self.nodes.keys().next().cloned() {
                self.nodes.remove(&call);
                info!(callsign = %call, "node disconnected");
            }
        } else {
            let call = ROSTER[rng.gen_range(0..ROSTER.len())].to_owned();
            info!(callsign = %call, "node connected");
            self.nodes.insert(
                call,
                Node {
                    protocol: "D-Extra".to_owned(),
                    module: ["A", "B", "C"][rng.gen_range(0..3)].to_owned(),
                    connected_at: now,
                },
            );
        }
    }

    fn state_doc(&self, now: DateTime<Utc>) -> Value {
        let active_talkers: Vec<Value> = self
            .modules
            .iter()
            .filter_map(|m| match &m.phase {
                Phase::Talking {
                    callsign, protocol, ..
                } => Some(json!({
                    "callsign": callsign,
                    "module": m.name,
                    "protocol": protocol,
                })),
                _ => None,
            })
            .collect();
        let clients: Vec<Value> = self
            .nodes
            .iter()
            .map(|(call, node)| {
                json!({
                    "Callsign": call,
                    "Protocol": node.protocol,
                    "OnModule": node.module,
                    "ConnectTime": node.connected_at.to_rfc3339(),
                })
            })
            .collect();
        let users: Vec<Value> = self
            .users
            .iter()
            .map(|(call, module)| {
                json!({
                    "Callsign": call,
                    "OnModule": module,
                    "ViaPeer": "XLX262",
                    "LastHeard": now.to_rfc3339(),
                })
            })
            .collect();
        let modules: Vec<Value> = MODULES
            .iter()
            .map(|(name, description)| json!({"Name": name, "Description": description}))
            .collect();

        json!({
            "type": "state",
            "activeTalkers": active_talkers,
            "Clients": clients,
            "Users": users,
            "Peers": [{
                "Callsign": "XLX262",
                "Protocol": "D-Extra",
                "ConnectTime": (now - TimeDelta::hours(24)).to_rfc3339(),
            }],
            "Modules": modules,
        })
    }
}

fn hearing_doc(module: &str, callsign: &str, protocol: &str) -> Value {
    json!({
        "type": "hearing",
        "my": callsign,
        "ur": RECOVERY_UR,
        "rpt1": RECOVERY_RPT1,
        "rpt2": format!("URFD {module}"),
        "module": module,
        "protocol": protocol,
    })
}

fn closing_doc(module: &str, callsign: &str, protocol: &str) -> Value {
    json!({
        "type": "closing",
        "my": callsign,
        "module": module,
        "protocol": protocol,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(drop_rate: f32, seconds: i64) -> Vec<Value> {
        let start = Utc::now();
        let mut reflector = Reflector::new(drop_rate, start);
        let mut out = Vec::new();
        for s in 0..seconds {
            out.extend(reflector.tick(start + TimeDelta::seconds(s)));
        }
        out
    }

    fn of_type<'a>(docs: &'a [Value], kind: &str) -> Vec<&'a Value> {
        docs.iter().filter(|d| d["type"] == kind).collect()
    }

    #[test]
    fn generates_paired_hearing_and_closing_events_without_drops() {
        let docs = run(0.0, 2000);
        let hearings = of_type(&docs, "hearing");
        let closings = of_type(&docs, "closing");
        assert!(!hearings.is_empty(), "no traffic generated");
        assert!(!closings.is_empty(), "no closings generated");
        for closing in &closings {
            assert!(
                hearings.iter().any(|h| h["my"] == closing["my"]),
                "closing without a prior hearing: {closing}"
            );
        }
    }

    #[test]
    fn full_drop_rate_suppresses_every_closing() {
        let docs = run(1.0, 2000);
        assert!(!of_type(&docs, "hearing").is_empty());
        assert!(of_type(&docs, "closing").is_empty());
    }

    #[test]
    fn state_snapshots_use_the_producer_field_casing() {
        let docs = run(0.0, 30);
        let states = of_type(&docs, "state");
        assert!(!states.is_empty(), "no state snapshot in 30 s");
        let state = states[0];
        assert!(state.get("activeTalkers").is_some());
        assert!(state.get("Clients").is_some());
        assert!(state.get("Users").is_some());
        assert!(state.get("Peers").is_some());
        assert!(state.get("Modules").is_some());
        assert!(state.get("clients").is_none());
    }

    #[test]
    fn hearings_carry_the_full_routing_header() {
        let docs = run(0.0, 2000);
        let hearing = of_type(&docs, "hearing")
            .into_iter()
            .next()
            .expect("at least one hearing");
        assert_eq!(hearing["ur"], RECOVERY_UR);
        assert_eq!(hearing["rpt1"], RECOVERY_RPT1);
        let module = hearing["module"].as_str().expect("module");
        assert_eq!(
            hearing["rpt2"].as_str().expect("rpt2"),
            format!("URFD {module}")
        );
    }
}
