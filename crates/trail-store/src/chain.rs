//! Hash chain over event records.
//!
//! Each record's hash is SHA-256 over the compact JSON of
//! `{session_id, seq, ts, dir, enc, payload, prev_hash}` in that order.
//! Record 0 links to [`SENTINEL_HASH`]; record n links to record n-1.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use trail_core::record::{Direction, EventRecord, PayloadEncoding, SENTINEL_HASH};

#[derive(Serialize)]
struct HashInput<'a> {
    session_id: &'a str,
    seq: u64,
    ts: &'a str,
    dir: Direction,
    enc: PayloadEncoding,
    payload: &'a str,
    prev_hash: &'a str,
}

/// Hash of a record from its chained fields. The stored `hash` is ignored.
pub fn compute_hash(record: &EventRecord) -> String {
    let input = HashInput {
        session_id: record.session_id.as_str(),
        seq: record.seq,
        ts: &record.ts,
        dir: record.dir,
        enc: record.enc,
        payload: &record.payload,
        prev_hash: &record.prev_hash,
    };
    // A struct of strings and integers always serializes.
    let encoded = serde_json::to_vec(&input).unwrap_or_default();
    format!("{:x}", Sha256::digest(&encoded))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakReason {
    /// Stored `prev_hash` does not equal the predecessor's hash.
    PrevHashMismatch { expected: String, found: String },
    /// Stored `hash` does not match the recomputed one (record edited).
    HashMismatch { expected: String, found: String },
    /// Record at this position carries the wrong sequence number.
    SequenceGap { expected: u64, found: u64 },
    /// Record belongs to another session.
    SessionMismatch { found: String },
    /// Line at this position is not a record at all.
    Unparsable { detail: String },
    /// `len` is not the decoded payload's length. `len` is outside the hash.
    LengthMismatch { declared: usize, actual: usize },
    /// Payload does not decode under its declared encoding.
    UndecodablePayload { detail: String },
}

impl std::fmt::Display for BreakReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrevHashMismatch { .. } => f.write_str("previous hash does not match predecessor"),
            Self::HashMismatch { .. } => f.write_str("record hash does not match its contents"),
            Self::SequenceGap { expected, found } => {
                write!(f, "expected seq {expected}, found {found}")
            }
            Self::SessionMismatch { found } => write!(f, "record from foreign session {found}"),
            Self::Unparsable { detail } => write!(f, "unparsable record: {detail}"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "declared length {declared}, payload has {actual} bytes")
            }
            Self::UndecodablePayload { detail } => write!(f, "undecodable payload: {detail}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChainStatus {
    Intact,
    Broken { position: usize, reason: BreakReason },
    FinalHashMismatch { expected: String, actual: Option<String> },
}

impl std::fmt::Display for ChainStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intact => f.write_str("intact"),
            Self::Broken { position, reason } => write!(f, "chain broken at position {position}: {reason}"),
            Self::FinalHashMismatch { expected, actual } => write!(
                f,
                "final hash mismatch: expected {expected}, log ends at {}",
                actual.as_deref().unwrap_or("nothing")
            ),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Records 0..valid_records are chained correctly.
    pub valid_records: usize,
    /// Hash of the last valid record.
    pub final_hash: Option<String>,
    pub status: ChainStatus,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.status == ChainStatus::Intact
    }

    pub(crate) fn broken_at(
        position: usize,
        final_hash: Option<String>,
        reason: BreakReason,
    ) -> Self {
        Self {
            valid_records: position,
            final_hash,
            status: ChainStatus::Broken { position, reason },
        }
    }
}

/// Recompute the chain over `records` in order.
///
/// Succeeds only when every record is at its own sequence position, links to
/// its predecessor, hashes to its stored value, and (if `expected_final` is
/// given) the last hash equals it. A record's `len` must also agree with its
/// decoded payload. On failure the report still says how many
/// leading records are trustworthy.
pub fn verify(records: &[EventRecord], expected_final: Option<&str>) -> VerifyReport {
    let mut prev_hash: Option<String> = None;
    let session = records.first().map(|r| &r.session_id);

    for (position, record) in records.iter().enumerate() {
        let expected_prev = prev_hash.as_deref().unwrap_or(SENTINEL_HASH);

        if Some(&record.session_id) != session {
            return VerifyReport::broken_at(
                position,
                prev_hash,
                BreakReason::SessionMismatch {
                    found: record.session_id.to_string(),
                },
            );
        }

        if record.prev_hash != expected_prev {
            return VerifyReport::broken_at(
                position,
                prev_hash.clone(),
                BreakReason::PrevHashMismatch {
                    expected: expected_prev.to_string(),
                    found: record.prev_hash.clone(),
                },
            );
        }

        if record.seq != position as u64 {
            return VerifyReport::broken_at(
                position,
                prev_hash,
                BreakReason::SequenceGap {
                    expected: position as u64,
                    found: record.seq,
                },
            );
        }

        let actual = compute_hash(record);
        if actual != record.hash {
            return VerifyReport::broken_at(
                position,
                prev_hash,
                BreakReason::HashMismatch {
                    expected: actual,
                    found: record.hash.clone(),
                },
            );
        }

        let bytes = match record.payload_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                return VerifyReport::broken_at(
                    position,
                    prev_hash,
                    BreakReason::UndecodablePayload { detail: e.to_string() },
                )
            }
        };
        if bytes.len() != record.len {
            return VerifyReport::broken_at(
                position,
                prev_hash,
                BreakReason::LengthMismatch {
                    declared: record.len,
                    actual: bytes.len(),
                },
            );
        }

        prev_hash = Some(actual);
    }

    let status = match expected_final {
        Some(expected) if prev_hash.as_deref() != Some(expected) => ChainStatus::FinalHashMismatch {
            expected: expected.to_string(),
            actual: prev_hash.clone(),
        },
        _ => ChainStatus::Intact,
    };

    VerifyReport {
        valid_records: records.len(),
        final_hash: prev_hash,
        status,
    }
}
