//! Wire envelope.
//!
//! Every frame is a JSON text object `{"type": "...", ...}`. The envelope is
//! read with a tolerant scanner instead of a full parse:
//! - only top-level keys are matched, so a `"type"` nested inside a payload
//!   never shadows the envelope type;
//! - missing or malformed fields read as empty/zero, nothing here panics;
//! - object values are taken by brace-depth counting from the opening `{` to
//!   its matching `}`, skipping braces inside string literals. Scanning for the
//!   next quote or comma instead breaks on nested payload objects.
//!
//! The entity-update payload itself is decoded with `serde_json` once it has
//! been cut out of the envelope.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    entity::{BodyState, EntityId},
    math::{Quat, Vec3},
};

/// Envelope `type` values.
pub mod kind {
    pub const HELLO: &str = "hello";
    pub const WELCOME: &str = "welcome";
    pub const PEER_JOINED: &str = "peer_joined";
    pub const PEER_LEFT: &str = "peer_left";
    pub const EVENT: &str = "event";
    pub const LEAVE: &str = "leave";
    pub const ERROR: &str = "error";
    /// Informational server messages that carry nothing the client acts on.
    pub const INFORMATIONAL: [&str; 4] = ["info", "sessions", "switched", "pong"];
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    // ─── Handshake ───
    Hello {
        game: String,
    },
    Welcome {
        net_id: String,
        session_id: String,
        game: String,
        capacity: u32,
        session_size: u32,
    },

    // ─── Membership ───
    PeerJoined {
        net_id: String,
    },
    PeerLeft {
        net_id: String,
    },
    Leave,

    // ─── Gameplay ───
    /// Generic relayed event; `payload` is the raw JSON object, if any.
    Event {
        payload: Option<String>,
    },

    // ─── Diagnostics ───
    Error {
        message: String,
    },
    Info {
        kind: String,
    },
    /// Missing or unrecognized `type`.
    Unknown {
        kind: String,
    },
}

impl Envelope {
    /// Decodes a text frame. Never fails; garbage decodes to `Unknown`.
    pub fn decode(frame: &str) -> Self {
        let ty = field_str(frame, "type").unwrap_or_default();
        match ty.as_str() {
            kind::HELLO => Envelope::Hello {
                game: field_str(frame, "game").unwrap_or_default(),
            },
            kind::WELCOME => Envelope::Welcome {
                net_id: field_str(frame, "net_id").unwrap_or_default(),
                session_id: field_str(frame, "sessionId").unwrap_or_default(),
                game: field_str(frame, "game").unwrap_or_default(),
                capacity: field_u32(frame, "capacity"),
                session_size: field_u32(frame, "sessionSize"),
            },
            kind::PEER_JOINED => Envelope::PeerJoined {
                net_id: field_str(frame, "net_id").unwrap_or_default(),
            },
            kind::PEER_LEFT => Envelope::PeerLeft {
                net_id: field_str(frame, "net_id").unwrap_or_default(),
            },
            kind::LEAVE => Envelope::Leave,
            kind::EVENT => Envelope::Event {
                payload: extract_object(frame, "payload").map(Cow::into_owned),
            },
            kind::ERROR => Envelope::Error {
                message: field_str(frame, "message").unwrap_or_else(|| frame.to_string()),
            },
            k if kind::INFORMATIONAL.contains(&k) => Envelope::Info {
                kind: k.to_string(),
            },
            k => Envelope::Unknown {
                kind: k.to_string(),
            },
        }
    }

    /// Encodes the envelope with the exact key order used on the wire.
    pub fn encode(&self) -> String {
        match self {
            Envelope::Hello { game } => {
                format!(r#"{{"type":"hello","game":{}}}"#, json_string(game))
            }
            Envelope::Welcome {
                net_id,
                session_id,
                game,
                capacity,
                session_size,
            } => format!(
                r#"{{"type":"welcome","net_id":{},"sessionId":{},"game":{},"capacity":{},"sessionSize":{}}}"#,
                json_string(net_id),
                json_string(session_id),
                json_string(game),
                capacity,
                session_size
            ),
            Envelope::PeerJoined { net_id } => {
                format!(r#"{{"type":"peer_joined","net_id":{}}}"#, json_string(net_id))
            }
            Envelope::PeerLeft { net_id } => {
                format!(r#"{{"type":"peer_left","net_id":{}}}"#, json_string(net_id))
            }
            Envelope::Leave => r#"{"type":"leave"}"#.to_string(),
            Envelope::Event { payload } => match payload {
                Some(p) => format!(r#"{{"type":"event","payload":{p}}}"#),
                None => r#"{"type":"event"}"#.to_string(),
            },
            Envelope::Error { message } => {
                format!(r#"{{"type":"error","message":{}}}"#, json_string(message))
            }
            Envelope::Info { kind } | Envelope::Unknown { kind } => {
                format!(r#"{{"type":{}}}"#, json_string(kind))
            }
        }
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// State of one vehicle at one instant, as carried by an `event` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSample {
    pub id: EntityId,
    pub position: Vec3,
    pub rotation: Quat,
    pub velocity: Vec3,
    /// Sender's session clock in seconds.
    pub timestamp: f64,
}

impl SyncSample {
    pub fn new(id: EntityId, state: BodyState, timestamp: f64) -> Self {
        Self {
            id,
            position: state.position,
            rotation: state.rotation,
            velocity: state.velocity,
            timestamp,
        }
    }

    pub fn state(&self) -> BodyState {
        BodyState {
            position: self.position,
            rotation: self.rotation,
            velocity: self.velocity,
        }
    }

    /// Serializes into the flat payload object.
    pub fn to_payload(&self) -> String {
        let p = CarSyncPayload::from(self);
        // Plain struct of strings and finite numbers.
        serde_json::to_string(&p).unwrap_or_else(|_| "{}".to_string())
    }

    /// Full `event` envelope carrying this sample.
    pub fn to_event_frame(&self) -> String {
        Envelope::Event {
            payload: Some(self.to_payload()),
        }
        .encode()
    }

    /// Decodes a payload object. Returns `None` unless it looks like a car
    /// update (a non-empty `carId`); extra keys are ignored, missing numbers
    /// read as zero.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let p: CarSyncPayload = match serde_json::from_str(payload) {
            Ok(p) => p,
            Err(e) => {
                debug!(error = %e, "Payload is not a car update");
                return None;
            }
        };
        if p.car_id.is_empty() {
            return None;
        }
        Some(p.into())
    }
}

/// Wire layout of an entity update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct CarSyncPayload {
    #[serde(rename = "carId")]
    car_id: String,
    #[serde(rename = "posX")]
    pos_x: f32,
    #[serde(rename = "posY")]
    pos_y: f32,
    #[serde(rename = "posZ")]
    pos_z: f32,
    #[serde(rename = "rotX")]
    rot_x: f32,
    #[serde(rename = "rotY")]
    rot_y: f32,
    #[serde(rename = "rotZ")]
    rot_z: f32,
    #[serde(rename = "rotW")]
    rot_w: f32,
    #[serde(rename = "velX")]
    vel_x: f32,
    #[serde(rename = "velY")]
    vel_y: f32,
    #[serde(rename = "velZ")]
    vel_z: f32,
    timestamp: f64,
}

fn finite(v: f32) -> f32 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

impl From<&SyncSample> for CarSyncPayload {
    fn from(s: &SyncSample) -> Self {
        Self {
            car_id: s.id.as_str().to_string(),
            pos_x: finite(s.position.x),
            pos_y: finite(s.position.y),
            pos_z: finite(s.position.z),
            rot_x: finite(s.rotation.x),
            rot_y: finite(s.rotation.y),
            rot_z: finite(s.rotation.z),
            rot_w: finite(s.rotation.w),
            vel_x: finite(s.velocity.x),
            vel_y: finite(s.velocity.y),
            vel_z: finite(s.velocity.z),
            timestamp: if s.timestamp.is_finite() { s.timestamp } else { 0.0 },
        }
    }
}

impl From<CarSyncPayload> for SyncSample {
    fn from(p: CarSyncPayload) -> Self {
        Self {
            id: EntityId::new(p.car_id),
            position: Vec3::new(p.pos_x, p.pos_y, p.pos_z),
            rotation: Quat::new(p.rot_x, p.rot_y, p.rot_z, p.rot_w).normalize(),
            velocity: Vec3::new(p.vel_x, p.vel_y, p.vel_z),
            timestamp: p.timestamp,
        }
    }
}

// ─── Tolerant scanner ───

/// Reads a top-level field as text. Strings are unescaped; numbers and
/// literals are returned verbatim; objects and arrays are returned raw.
pub fn field_str(json: &str, key: &str) -> Option<String> {
    let raw = top_level_value(json, key)?;
    if raw.starts_with('"') {
        Some(unescape(&raw[1..raw.len() - 1]))
    } else {
        Some(raw.to_string())
    }
}

/// Reads a top-level numeric field; anything unparseable reads as zero.
pub fn field_u32(json: &str, key: &str) -> u32 {
    let Some(text) = field_str(json, key) else {
        return 0;
    };
    let text = text.trim();
    if let Ok(v) = text.parse::<u32>() {
        return v;
    }
    match text.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => v.min(u32::MAX as f64) as u32,
        _ => 0,
    }
}

/// Cuts out the object stored under a top-level key.
///
/// The value is taken from its opening `{` to the matching `}`. A value that
/// is a string holding an encoded object is unescaped and returned owned.
pub fn extract_object<'a>(json: &'a str, key: &str) -> Option<Cow<'a, str>> {
    let raw = top_level_value(json, key)?;
    if raw.starts_with('{') {
        return Some(Cow::Borrowed(raw));
    }
    if raw.starts_with('"') {
        let inner = unescape(&raw[1..raw.len() - 1]);
        let trimmed = inner.trim();
        if trimmed.starts_with('{') {
            let end = matching_close(trimmed.as_bytes(), 0)?;
            return Some(Cow::Owned(trimmed[..=end].to_string()));
        }
    }
    None
}

/// Byte span of the raw value stored under `key` at depth 1 of the outermost object.
fn top_level_value<'a>(json: &'a str, key: &str) -> Option<&'a str> {
    let bytes = json.as_bytes();
    let mut i = skip_ws(bytes, 0);
    if bytes.get(i) != Some(&b'{') {
        return None;
    }
    i += 1;
    let mut depth = 1usize;

    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let end = string_end(bytes, i)?;
                if depth == 1 {
                    let after = skip_ws(bytes, end + 1);
                    if bytes.get(after) == Some(&b':') {
                        let name = &json[i + 1..end];
                        let value_start = skip_ws(bytes, after + 1);
                        if name == key {
                            let value_end = value_end(bytes, value_start)?;
                            return Some(&json[value_start..value_end]);
                        }
                        i = value_start;
                        continue;
                    }
                }
                i = end + 1;
            }
            b'{' | b'[' => {
                depth += 1;
                i += 1;
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return None;
                }
                i += 1;
            }
            _ => i += 1,
        }
    }
    None
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Index of the closing quote of the string opening at `start`.
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

/// Index of the bracket closing the one at `start`, skipping string contents.
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                i = string_end(bytes, i)?;
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Exclusive end of the value starting at `start`.
fn value_end(bytes: &[u8], start: usize) -> Option<usize> {
    match bytes.get(start)? {
        b'"' => string_end(bytes, start).map(|e| e + 1),
        b'{' | b'[' => matching_close(bytes, start).map(|e| e + 1),
        _ => {
            let mut i = start;
            while i < bytes.len()
                && !matches!(bytes[i], b',' | b'}' | b']')
                && !bytes[i].is_ascii_whitespace()
            {
                i += 1;
            }
            Some(i)
        }
    }
}

fn unescape(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let hex: String = chars.by_ref().take(4).collect();
                let ch = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .unwrap_or(char::REPLACEMENT_CHARACTER);
                out.push(ch);
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SyncSample {
        SyncSample {
            id: EntityId::new("p2"),
            position: Vec3::new(1.5, -2.25, 30.0),
            rotation: Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 0.7),
            velocity: Vec3::new(0.1, 0.0, -9.5),
            timestamp: 12.75,
        }
    }

    fn assert_close(a: &SyncSample, b: &SyncSample) {
        assert_eq!(a.id, b.id);
        assert!(a.position.distance(b.position) < 1e-5);
        assert!(a.velocity.distance(b.velocity) < 1e-5);
        assert!(a.rotation.angle_to(b.rotation) < 1e-3);
        assert!((a.timestamp - b.timestamp).abs() < 1e-9);
    }

    #[test]
    fn hello_matches_wire_shape() {
        let hello = Envelope::Hello {
            game: "race".into(),
        };
        assert_eq!(hello.encode(), r#"{"type":"hello","game":"race"}"#);
    }

    #[test]
    fn hello_escapes_game_name() {
        let hello = Envelope::Hello {
            game: "a\"b".into(),
        };
        assert_eq!(Envelope::decode(&hello.encode()), hello);
    }

    #[test]
    fn decode_welcome_numbers_quoted_or_not() {
        let a = r#"{"type":"welcome","net_id":"p1","sessionId":"s9","game":"race","capacity":2,"sessionSize":1}"#;
        let b = r#"{ "type" : "welcome", "net_id":"p1", "sessionId":"s9", "game":"race", "capacity":"2", "sessionSize":"1" }"#;
        let expected = Envelope::Welcome {
            net_id: "p1".into(),
            session_id: "s9".into(),
            game: "race".into(),
            capacity: 2,
            session_size: 1,
        };
        assert_eq!(Envelope::decode(a), expected);
        assert_eq!(Envelope::decode(b), expected);
    }

    #[test]
    fn missing_fields_read_as_empty_and_zero() {
        let env = Envelope::decode(r#"{"type":"welcome"}"#);
        assert_eq!(
            env,
            Envelope::Welcome {
                net_id: String::new(),
                session_id: String::new(),
                game: String::new(),
                capacity: 0,
                session_size: 0,
            }
        );
    }

    #[test]
    fn garbage_never_panics() {
        for frame in [
            "",
            "{",
            "}",
            "not json",
            r#"{"type":"#,
            r#"{"type":"event","payload":{"carId":"p2","posX":"#,
            r#"{"type":"event","payload":"#,
            r#"[1,2,3]"#,
            r#"{"type":"welcome","capacity":-4,"sessionSize":1e99}"#,
            "{\"type\":\"error\",\"message\":\"\\u12\"}",
        ] {
            let _ = Envelope::decode(frame);
        }
        assert_eq!(
            Envelope::decode("not json"),
            Envelope::Unknown {
                kind: String::new()
            }
        );
    }

    #[test]
    fn nested_type_does_not_shadow_envelope_type() {
        let frame = r#"{"payload":{"type":"move","from":"e2"},"type":"event"}"#;
        match Envelope::decode(frame) {
            Envelope::Event { payload } => {
                assert_eq!(payload.as_deref(), Some(r#"{"type":"move","from":"e2"}"#));
            }
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn payload_extraction_counts_nested_braces() {
        let frame = r#"{"type":"event","payload":{"a":{"b":{"c":1}},"d":"}{"},"after":true}"#;
        let payload = extract_object(frame, "payload").unwrap();
        assert_eq!(payload, r#"{"a":{"b":{"c":1}},"d":"}{"}"#);
    }

    #[test]
    fn stringified_payload_is_unwrapped() {
        let frame = r#"{"type":"event","payload":"{\"carId\":\"p3\",\"posX\":4}"}"#;
        let payload = extract_object(frame, "payload").unwrap();
        let s = SyncSample::from_payload(&payload).unwrap();
        assert_eq!(s.id, EntityId::new("p3"));
        assert_eq!(s.position.x, 4.0);
    }

    #[test]
    fn sample_roundtrip_through_envelope_with_siblings() {
        let original = sample();
        // Extra keys next to the car fields, including nested objects and a
        // brace inside a string, plus an object sibling of the payload itself.
        let payload = original.to_payload();
        let decorated = format!(
            r#"{},"extra":{{"nested":{{"deep":[1,2,{{"x":"}}"}}]}}}},"note":"a}}b"}}"#,
            payload.trim_end_matches('}')
        );
        let frame = format!(r#"{{"type":"event","sender":{{"id":"p2"}},"payload":{decorated}}}"#);

        let Envelope::Event { payload: Some(p) } = Envelope::decode(&frame) else {
            panic!("expected event with payload");
        };
        assert_eq!(p, decorated);
        let back = SyncSample::from_payload(&p).unwrap();
        assert_close(&original, &back);
    }

    #[test]
    fn event_frame_matches_wire_shape() {
        let frame = sample().to_event_frame();
        assert!(frame.starts_with(r#"{"type":"event","payload":{"carId":"p2","posX":1.5,"#));
        assert!(frame.contains(r#""timestamp":12.75"#));
    }

    #[test]
    fn non_car_payload_is_not_a_sample() {
        assert!(SyncSample::from_payload(r#"{"text":"hello"}"#).is_none());
        assert!(SyncSample::from_payload(r#"{"carId":""}"#).is_none());
        assert!(SyncSample::from_payload("nope").is_none());
    }

    #[test]
    fn non_finite_values_are_sent_as_zero() {
        let mut s = sample();
        s.position.x = f32::NAN;
        s.timestamp = f64::INFINITY;
        let back = SyncSample::from_payload(&s.to_payload()).unwrap();
        assert_eq!(back.position.x, 0.0);
        assert_eq!(back.timestamp, 0.0);
    }

    #[test]
    fn error_message_falls_back_to_frame() {
        assert_eq!(
            Envelope::decode(r#"{"type":"error","message":"room full"}"#),
            Envelope::Error {
                message: "room full".into()
            }
        );
        let raw = r#"{"type":"error","code":7}"#;
        assert_eq!(
            Envelope::decode(raw),
            Envelope::Error {
                message: raw.into()
            }
        );
    }
}
