//! Batch validation. Each record is judged on its own so one bad record
//! does not sink the rest of the batch.

use serde::Deserialize;
use serde_json::Value;

use trail_core::wire::{Rejection, ShipRecord, BATCH_SOURCE};

#[derive(Deserialize)]
struct RawBatch {
    #[serde(default)]
    source: Option<String>,
    records: Vec<Value>,
}

/// A batch split into what may be stored and what may not.
#[derive(Debug, Default)]
pub struct Validated {
    pub source: String,
    pub accepted: Vec<ShipRecord>,
    pub rejected: Vec<Rejection>,
}

/// The body as a whole is unusable.
#[derive(Debug, PartialEq, Eq)]
pub enum BatchError {
    Malformed(String),
    TooLarge { count: usize, max: usize },
}

impl std::fmt::Display for BatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(detail) => write!(f, "malformed body: {detail}"),
            Self::TooLarge { count, max } => write!(f, "batch of {count} records exceeds limit of {max}"),
        }
    }
}

pub fn validate_batch(body: &[u8], max_batch: usize) -> Result<Validated, BatchError> {
    let raw: RawBatch = serde_json::from_slice(body).map_err(|e| BatchError::Malformed(e.to_string()))?;
    if raw.records.len() > max_batch {
        return Err(BatchError::TooLarge {
            count: raw.records.len(),
            max: max_batch,
        });
    }

    let mut validated = Validated {
        source: raw.source.unwrap_or_else(|| BATCH_SOURCE.to_string()),
        ..Validated::default()
    };
    for (index, value) in raw.records.into_iter().enumerate() {
        match validate_record(index, value) {
            Ok(record) => validated.accepted.push(record),
            Err(rejection) => validated.rejected.push(rejection),
        }
    }
    Ok(validated)
}

fn validate_record(index: usize, value: Value) -> Result<ShipRecord, Rejection> {
    let key = key_of(&value);
    let reject = |reason: String| Rejection {
        index,
        key: key.clone(),
        reason,
    };
    let record: ShipRecord = serde_json::from_value(value).map_err(|e| reject(e.to_string()))?;
    if record.session_id.as_str().trim().is_empty() {
        return Err(reject("empty session_id".into()));
    }
    if !is_sha256_hex(&record.hash) {
        return Err(reject("hash is not 64 hex characters".into()));
    }
    Ok(record)
}

/// Best-effort key for a record that may not deserialize.
fn key_of(value: &Value) -> Option<String> {
    let session = value.get("session_id")?.as_str()?;
    let seq = value.get("seq")?.as_u64()?;
    Some(format!("{session}:{seq}"))
}

fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(seq: u64) -> Value {
        json!({
            "session_id": "sess_a",
            "seq": seq,
            "ts": "2024-05-01T10:00:00.000Z",
            "dir": "out",
            "len": 3,
            "hash": "ab".repeat(32),
        })
    }

    fn body(records: Vec<Value>) -> Vec<u8> {
        serde_json::to_vec(&json!({"source": "trail", "records": records})).unwrap()
    }

    #[test]
    fn good_batch_is_fully_accepted() {
        let v = validate_batch(&body(vec![record(0), record(1)]), 10).unwrap();
        assert_eq!(v.accepted.len(), 2);
        assert!(v.rejected.is_empty());
        assert_eq!(v.source, "trail");
    }

    #[test]
    fn bad_records_are_rejected_individually() {
        let mut short_hash = record(1);
        short_hash["hash"] = json!("abc");
        let mut bad_dir = record(2);
        bad_dir["dir"] = json!("sideways");
        let mut no_session = record(3);
        no_session["session_id"] = json!("");

        let v = validate_batch(&body(vec![record(0), short_hash, bad_dir, no_session]), 10).unwrap();
        assert_eq!(v.accepted.len(), 1);
        let reasons: Vec<(usize, Option<&str>)> = v.rejected.iter().map(|r| (r.index, r.key.as_deref())).collect();
        assert_eq!(
            reasons,
            vec![(1, Some("sess_a:1")), (2, Some("sess_a:2")), (3, Some(":3"))]
        );
        assert!(v.rejected[0].reason.contains("64 hex"));
        assert!(v.rejected[1].reason.contains("sideways"));
    }

    #[test]
    fn non_json_is_malformed() {
        assert!(matches!(validate_batch(b"nope", 10), Err(BatchError::Malformed(_))));
        assert!(matches!(validate_batch(b"{\"events\":[]}", 10), Err(BatchError::Malformed(_))));
    }

    #[test]
    fn oversized_batch_is_refused() {
        let err = validate_batch(&body(vec![record(0), record(1), record(2)]), 2).unwrap_err();
        assert_eq!(err, BatchError::TooLarge { count: 3, max: 2 });
    }

    #[test]
    fn missing_source_defaults() {
        let v = validate_batch(&serde_json::to_vec(&json!({"records": []})).unwrap(), 1).unwrap();
        assert_eq!(v.source, "trail");
    }
}
