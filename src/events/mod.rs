//! Event envelopes and the coordinator/participant event vocabularies
//!
//! Every non-keepalive message on a channel is a JSON object
//! `{"event": <type>, "t": {"@datetime": <unix seconds>}, "data": <payload>}`.
//! The envelope is decoded once by the channel adapter; state machines then
//! interpret it through the closed vocabularies below.

use crate::error::{MonitorError, MonitorResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

/// Literal keepalive payloads sent by the event servers
pub const KEEPALIVE_MESSAGES: [&str; 2] = ["INIT", "PING"];

/// Event types of both channel vocabularies
const KNOWN_EVENTS: [&str; 19] = [
    "init",
    "ready_commit",
    "fail",
    "commit",
    "rollback",
    "finish",
    "done",
    "wait_ping",
    "ping",
    "touch",
    "init_child",
    "init_child_2",
    "ping_child",
    "prepare_commit_child",
    "fail_child",
    "commit_child",
    "done_child",
    "rollback_child",
    "ready_commit_child",
];

/// Bounded label for an event type; anything outside the vocabulary is `unrecognized`
pub fn event_label(kind: &str) -> &'static str {
    KNOWN_EVENTS
        .iter()
        .find(|known| **known == kind)
        .copied()
        .unwrap_or("unrecognized")
}

/// Identifier minted by the coordinator for each action of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    event: String,
    t: WireTimestamp,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct WireTimestamp {
    #[serde(rename = "@datetime")]
    datetime: f64,
}

/// One decoded message, immutable once constructed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    /// Event type tag
    pub kind: String,
    /// Time reported by the emitter, not arrival time
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    /// Human label of the emitting entity
    pub source_name: String,
}

impl EventEnvelope {
    pub fn new(
        kind: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Value,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            timestamp,
            payload,
            source_name: source_name.into(),
        }
    }

    /// Decode a raw channel message
    pub fn decode(raw: &str, source_name: &str) -> MonitorResult<Self> {
        let wire: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| MonitorError::malformed(source_name, e.to_string()))?;

        let timestamp = timestamp_from_secs(wire.t.datetime)
            .ok_or_else(|| MonitorError::malformed(source_name, "timestamp out of range"))?;

        Ok(Self {
            kind: wire.event,
            timestamp,
            payload: wire.data,
            source_name: source_name.to_string(),
        })
    }
}

/// Convert fractional unix seconds to a UTC timestamp with microsecond precision
pub fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    let micros = (secs * 1_000_000.0).round();
    if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return None;
    }
    let micros = micros as i64;
    DateTime::from_timestamp(
        micros.div_euclid(1_000_000),
        (micros.rem_euclid(1_000_000) * 1_000) as u32,
    )
}

/// Round a millisecond duration received as any JSON number
pub fn millis_from_f64(ms: f64) -> Option<u64> {
    if !ms.is_finite() || ms < 0.0 || ms > u64::MAX as f64 {
        return None;
    }
    Some(ms.round() as u64)
}

/// Emitters send durations as integers or floats alike
fn deserialize_millis<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let ms = f64::deserialize(deserializer)?;
    millis_from_f64(ms)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {}ms", ms)))
}

/// Outcome statuses a participant reports, first-hand or relayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    ReadyCommit,
    Fail,
    Commit,
    Done,
    Finish,
    Rollback,
}

impl OutcomeKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ready_commit" => Some(OutcomeKind::ReadyCommit),
            "fail" => Some(OutcomeKind::Fail),
            "commit" => Some(OutcomeKind::Commit),
            "done" => Some(OutcomeKind::Done),
            "finish" => Some(OutcomeKind::Finish),
            "rollback" => Some(OutcomeKind::Rollback),
            _ => None,
        }
    }
}

/// Participant registration entry of the coordinator's `init`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionSpec {
    #[serde(rename = "_id")]
    pub id: ParticipantId,
    pub service: ServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceSpec {
    pub url: String,
    /// Coordinator-side deadline for this participant, in milliseconds
    #[serde(deserialize_with = "deserialize_millis")]
    pub timeout: u64,
}

/// Payload of the coordinator's `init`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CoordinatorInit {
    /// Global transaction deadline, in milliseconds
    #[serde(deserialize_with = "deserialize_millis")]
    pub timeout: u64,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,
}

/// Events on the coordinator's channel
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Init(CoordinatorInit),
    Status(CoordinatorOutcome),
    InitChild,
    InitChild2 {
        chid: ParticipantId,
        ping_timeout: Option<u64>,
    },
    /// `ping_child` / `prepare_commit_child`
    ChildActivity(ParticipantId),
    /// `*_child` status relays with the suffix stripped
    ChildStatus {
        chid: ParticipantId,
        status: OutcomeKind,
    },
    Unrecognized(String),
}

/// Global statuses carried by payload-less coordinator events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorOutcome {
    ReadyCommit,
    Fail,
    Commit,
    Rollback,
    Finish,
}

impl CoordinatorEvent {
    /// Interpret an envelope received on the coordinator's channel
    pub fn parse(envelope: &EventEnvelope) -> MonitorResult<Self> {
        let data = &envelope.payload;
        let source = envelope.source_name.as_str();

        let event = match envelope.kind.as_str() {
            "init" => CoordinatorEvent::Init(
                serde_json::from_value(data.clone())
                    .map_err(|e| MonitorError::malformed(source, format!("init: {}", e)))?,
            ),
            "ready_commit" => CoordinatorEvent::Status(CoordinatorOutcome::ReadyCommit),
            "fail" => CoordinatorEvent::Status(CoordinatorOutcome::Fail),
            "commit" => CoordinatorEvent::Status(CoordinatorOutcome::Commit),
            "rollback" => CoordinatorEvent::Status(CoordinatorOutcome::Rollback),
            "finish" => CoordinatorEvent::Status(CoordinatorOutcome::Finish),
            "init_child" => CoordinatorEvent::InitChild,
            "init_child_2" => CoordinatorEvent::InitChild2 {
                chid: chid_field(data, source)?,
                ping_timeout: data
                    .get("ping-timeout")
                    .and_then(Value::as_f64)
                    .and_then(millis_from_f64),
            },
            "ping_child" | "prepare_commit_child" => {
                CoordinatorEvent::ChildActivity(chid_whole(data, source)?)
            }
            "fail_child" => child_status(data, source, OutcomeKind::Fail)?,
            "commit_child" => child_status(data, source, OutcomeKind::Commit)?,
            "done_child" => child_status(data, source, OutcomeKind::Done)?,
            "rollback_child" => child_status(data, source, OutcomeKind::Rollback)?,
            "ready_commit_child" => CoordinatorEvent::ChildStatus {
                chid: chid_field(data, source)?,
                status: OutcomeKind::ReadyCommit,
            },
            other => CoordinatorEvent::Unrecognized(other.to_string()),
        };

        Ok(event)
    }
}

fn child_status(data: &Value, source: &str, status: OutcomeKind) -> MonitorResult<CoordinatorEvent> {
    Ok(CoordinatorEvent::ChildStatus {
        chid: chid_whole(data, source)?,
        status,
    })
}

/// Relayed events whose whole payload is the participant id
fn chid_whole(data: &Value, source: &str) -> MonitorResult<ParticipantId> {
    data.as_str()
        .map(ParticipantId::new)
        .ok_or_else(|| MonitorError::malformed(source, "expected participant id payload"))
}

/// Relayed events carrying the participant id under `chid`
fn chid_field(data: &Value, source: &str) -> MonitorResult<ParticipantId> {
    data.get("chid")
        .and_then(Value::as_str)
        .map(ParticipantId::new)
        .ok_or_else(|| MonitorError::malformed(source, "missing `chid`"))
}

/// Payload of a participant's own `init`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ParticipantInit {
    #[serde(deserialize_with = "deserialize_millis")]
    pub ping_timeout: u64,
    #[serde(deserialize_with = "deserialize_millis")]
    pub result_timeout: u64,
}

/// Events on a participant's own channel
#[derive(Debug, Clone, PartialEq)]
pub enum ParticipantEvent {
    Init(ParticipantInit),
    WaitPing,
    Ping,
    Touch,
    Status(OutcomeKind),
    Unrecognized(String),
}

impl ParticipantEvent {
    /// Interpret an envelope received on a participant's channel
    pub fn parse(envelope: &EventEnvelope) -> MonitorResult<Self> {
        let event = match envelope.kind.as_str() {
            "init" => ParticipantEvent::Init(
                serde_json::from_value(envelope.payload.clone()).map_err(|e| {
                    MonitorError::malformed(&envelope.source_name, format!("init: {}", e))
                })?,
            ),
            "wait_ping" => ParticipantEvent::WaitPing,
            "ping" => ParticipantEvent::Ping,
            "touch" => ParticipantEvent::Touch,
            other => match OutcomeKind::from_name(other) {
                Some(outcome) => ParticipantEvent::Status(outcome),
                None => ParticipantEvent::Unrecognized(other.to_string()),
            },
        };

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, payload: Value) -> EventEnvelope {
        EventEnvelope::new(kind, Utc::now(), payload, "Controller")
    }

    #[test]
    fn test_decode_envelope() {
        let raw = r#"{"event": "touch", "t": {"@datetime": 1500000000.25}, "data": null}"#;
        let env = EventEnvelope::decode(raw, "Service #1").unwrap();
        assert_eq!(env.kind, "touch");
        assert_eq!(env.source_name, "Service #1");
        assert_eq!(env.timestamp.timestamp(), 1_500_000_000);
        assert_eq!(env.timestamp.timestamp_subsec_millis(), 250);
        assert_eq!(env.payload, Value::Null);
    }

    #[test]
    fn test_decode_without_data() {
        let raw = r#"{"event": "finish", "t": {"@datetime": 1.0}}"#;
        let env = EventEnvelope::decode(raw, "Controller").unwrap();
        assert_eq!(env.payload, Value::Null);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            EventEnvelope::decode("{not json", "Controller"),
            Err(MonitorError::MalformedPayload { .. })
        ));
        assert!(EventEnvelope::decode(r#"{"event": "init", "data": {}}"#, "Controller").is_err());
        assert!(EventEnvelope::decode(r#""PING""#, "Controller").is_err());
    }

    #[test]
    fn test_event_label_is_bounded() {
        assert_eq!(event_label("ready_commit_child"), "ready_commit_child");
        assert_eq!(event_label("touch"), "touch");
        assert_eq!(event_label("teleport-1234"), "unrecognized");
        assert_eq!(event_label(""), "unrecognized");
    }

    #[test]
    fn test_timestamp_conversion() {
        assert_eq!(timestamp_from_secs(0.0).unwrap().timestamp(), 0);
        let negative = timestamp_from_secs(-1.5).unwrap();
        assert_eq!(negative.timestamp(), -2);
        assert_eq!(negative.timestamp_subsec_millis(), 500);
        assert!(timestamp_from_secs(f64::NAN).is_none());
        assert!(timestamp_from_secs(f64::INFINITY).is_none());
    }

    #[test]
    fn test_parse_coordinator_init() {
        let env = envelope(
            "init",
            json!({
                "timeout": 5000,
                "actions": [{"_id": "x1", "service": {"url": "http://localhost:5011/api", "timeout": 800}}]
            }),
        );
        match CoordinatorEvent::parse(&env).unwrap() {
            CoordinatorEvent::Init(init) => {
                assert_eq!(init.timeout, 5000);
                assert_eq!(init.actions.len(), 1);
                assert_eq!(init.actions[0].id, ParticipantId::from("x1"));
                assert_eq!(init.actions[0].service.timeout, 800);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_relayed_chid_shapes() {
        let whole = envelope("done_child", json!("a"));
        assert_eq!(
            CoordinatorEvent::parse(&whole).unwrap(),
            CoordinatorEvent::ChildStatus {
                chid: "a".into(),
                status: OutcomeKind::Done
            }
        );

        let field = envelope("ready_commit_child", json!({"chid": "a", "result": 1}));
        assert_eq!(
            CoordinatorEvent::parse(&field).unwrap(),
            CoordinatorEvent::ChildStatus {
                chid: "a".into(),
                status: OutcomeKind::ReadyCommit
            }
        );

        let ping = envelope("prepare_commit_child", json!("b"));
        assert_eq!(
            CoordinatorEvent::parse(&ping).unwrap(),
            CoordinatorEvent::ChildActivity("b".into())
        );

        let init2 = envelope("init_child_2", json!({"chid": "c", "ping-timeout": 300}));
        assert_eq!(
            CoordinatorEvent::parse(&init2).unwrap(),
            CoordinatorEvent::InitChild2 {
                chid: "c".into(),
                ping_timeout: Some(300)
            }
        );
    }

    #[test]
    fn test_parse_relayed_wrong_shape_is_malformed() {
        let env = envelope("fail_child", json!({"chid": "a"}));
        assert!(CoordinatorEvent::parse(&env).is_err());
        let env = envelope("ready_commit_child", json!("a"));
        assert!(CoordinatorEvent::parse(&env).is_err());
    }

    #[test]
    fn test_parse_unrecognized() {
        let env = envelope("prepare_commit", Value::Null);
        assert_eq!(
            CoordinatorEvent::parse(&env).unwrap(),
            CoordinatorEvent::Unrecognized("prepare_commit".to_string())
        );
        assert_eq!(
            ParticipantEvent::parse(&env).unwrap(),
            ParticipantEvent::Unrecognized("prepare_commit".to_string())
        );
    }

    #[test]
    fn test_parse_participant_events() {
        let init = envelope("init", json!({"ping_timeout": 200, "result_timeout": 3000}));
        assert_eq!(
            ParticipantEvent::parse(&init).unwrap(),
            ParticipantEvent::Init(ParticipantInit {
                ping_timeout: 200,
                result_timeout: 3000
            })
        );
        assert_eq!(
            ParticipantEvent::parse(&envelope("wait_ping", Value::Null)).unwrap(),
            ParticipantEvent::WaitPing
        );
        assert_eq!(
            ParticipantEvent::parse(&envelope("done", Value::Null)).unwrap(),
            ParticipantEvent::Status(OutcomeKind::Done)
        );
        assert!(ParticipantEvent::parse(&envelope("init", json!({"ping_timeout": 1}))).is_err());
    }

    #[test]
    fn test_float_durations_accepted() {
        let env = envelope(
            "init",
            json!({
                "timeout": 5000.0,
                "actions": [{"_id": "x1", "service": {"url": "http://localhost:5011/api", "timeout": 799.6}}]
            }),
        );
        match CoordinatorEvent::parse(&env).unwrap() {
            CoordinatorEvent::Init(init) => {
                assert_eq!(init.timeout, 5000);
                assert_eq!(init.actions[0].service.timeout, 800);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let init = envelope("init", json!({"ping_timeout": 5000.0, "result_timeout": 2999.7}));
        assert_eq!(
            ParticipantEvent::parse(&init).unwrap(),
            ParticipantEvent::Init(ParticipantInit {
                ping_timeout: 5000,
                result_timeout: 3000
            })
        );

        let init2 = envelope("init_child_2", json!({"chid": "c", "ping-timeout": 300.0}));
        assert_eq!(
            CoordinatorEvent::parse(&init2).unwrap(),
            CoordinatorEvent::InitChild2 {
                chid: "c".into(),
                ping_timeout: Some(300)
            }
        );
    }

    #[test]
    fn test_negative_duration_rejected() {
        let init = envelope("init", json!({"ping_timeout": -1.0, "result_timeout": 3000}));
        assert!(ParticipantEvent::parse(&init).is_err());
        assert_eq!(millis_from_f64(f64::NAN), None);
        assert_eq!(millis_from_f64(0.4), Some(0));
    }
}
