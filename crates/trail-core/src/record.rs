//! Event records: the unit of the per-session hash-chained log.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// `prev_hash` of the first record in every session.
pub const SENTINEL_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Which way a chunk travelled through the interceptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// User keystrokes forwarded to the wrapped process.
    In,
    /// Wrapped process output forwarded to the user.
    Out,
    /// Lifecycle records emitted by the interceptor itself.
    Control,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
            Self::Control => "control",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "control" => Ok(Self::Control),
            other => Err(format!("unknown direction: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// Encode raw bytes for a JSON line. Valid UTF-8 is stored as text so the
/// log stays greppable; anything else (split multibyte sequences, binary)
/// is stored as base64 so no byte is lost.
pub fn encode_payload(bytes: &[u8]) -> (PayloadEncoding, String) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (PayloadEncoding::Utf8, text.to_owned()),
        Err(_) => (PayloadEncoding::Base64, BASE64.encode(bytes)),
    }
}

pub fn decode_payload(enc: PayloadEncoding, payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    match enc {
        PayloadEncoding::Utf8 => Ok(payload.as_bytes().to_vec()),
        PayloadEncoding::Base64 => BASE64.decode(payload),
    }
}

/// Wall-clock timestamp in the exact textual form that gets hashed.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub fn parse_timestamp(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// One line of `events.jsonl`. Field order here is the on-disk order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub session_id: SessionId,
    pub seq: u64,
    pub ts: String,
    pub dir: Direction,
    pub enc: PayloadEncoding,
    pub payload: String,
    /// Raw payload length in bytes (before any encoding).
    pub len: usize,
    pub prev_hash: String,
    pub hash: String,
}

impl EventRecord {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        decode_payload(self.enc, &self.payload)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.ts)
    }

    /// Parse the payload of a control record. Returns `None` for I/O records
    /// and for control payloads this version does not understand.
    pub fn control_event(&self) -> Option<ControlEvent> {
        if self.dir != Direction::Control || self.enc != PayloadEncoding::Utf8 {
            return None;
        }
        serde_json::from_str(&self.payload).ok()
    }

    /// Identifying key used for idempotent delivery.
    pub fn key(&self) -> String {
        record_key(&self.session_id, self.seq)
    }
}

pub fn record_key(session_id: &SessionId, seq: u64) -> String {
    format!("{session_id}:{seq}")
}

/// Payload of a `control` record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    SessionStarted(SessionStart),
    Resized { cols: u16, rows: u16 },
    SignalForwarded { signal: i32 },
    SessionEnded(SessionEnd),
}

impl ControlEvent {
    pub fn to_payload(&self) -> String {
        // Serializing a plain data enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub cmd: Vec<String>,
    pub cwd: String,
    pub host: String,
    pub user: String,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wrapped_session_uuid: Option<String>,
    /// First line of `<program> --version`, when it answered in time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_version: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEnd {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_payload_stays_text() {
        let (enc, text) = encode_payload("hello \x1b[1mworld".as_bytes());
        assert_eq!(enc, PayloadEncoding::Utf8);
        assert_eq!(text, "hello \x1b[1mworld");
    }

    #[test]
    fn split_multibyte_falls_back_to_base64() {
        let bytes = &"é".as_bytes()[..1];
        let (enc, text) = encode_payload(bytes);
        assert_eq!(enc, PayloadEncoding::Base64);
        assert_eq!(decode_payload(enc, &text).unwrap(), bytes);
    }

    #[test]
    fn direction_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Direction::In).unwrap(), "\"in\"");
        assert_eq!("control".parse::<Direction>().unwrap(), Direction::Control);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn timestamp_has_millis_and_z() {
        let ts = now_timestamp();
        assert!(ts.ends_with('Z'), "got: {ts}");
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(parse_timestamp(&ts).is_some());
    }

    #[test]
    fn control_event_is_tagged() {
        let ev = ControlEvent::Resized { cols: 120, rows: 40 };
        let json = ev.to_payload();
        assert!(json.contains("\"event\":\"resized\""), "got: {json}");
        let back: ControlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn control_event_only_for_control_records() {
        let record = EventRecord {
            session_id: SessionId::new(),
            seq: 0,
            ts: now_timestamp(),
            dir: Direction::Out,
            enc: PayloadEncoding::Utf8,
            payload: ControlEvent::SignalForwarded { signal: 2 }.to_payload(),
            len: 0,
            prev_hash: SENTINEL_HASH.into(),
            hash: SENTINEL_HASH.into(),
        };
        assert!(record.control_event().is_none());

        let control = EventRecord { dir: Direction::Control, ..record };
        assert_eq!(
            control.control_event(),
            Some(ControlEvent::SignalForwarded { signal: 2 })
        );
    }

    #[test]
    fn sentinel_is_64_zeros() {
        assert_eq!(SENTINEL_HASH.len(), 64);
        assert!(SENTINEL_HASH.chars().all(|c| c == '0'));
    }
}
