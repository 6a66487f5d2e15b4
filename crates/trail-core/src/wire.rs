//! Shipping wire types shared by the follower and the ingest gateway.

use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, SessionId};
use crate::record::{record_key, Direction, EventRecord};

/// Source tag written into every generic batch.
pub const BATCH_SOURCE: &str = "trail";

/// An event record as it travels over the wire. The payload is omitted
/// unless the operator opts in, so content stays local by default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipRecord {
    pub session_id: SessionId,
    pub seq: u64,
    pub ts: String,
    pub dir: Direction,
    pub len: usize,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl ShipRecord {
    pub fn from_record(record: &EventRecord, include_payload: bool) -> Self {
        Self {
            session_id: record.session_id.clone(),
            seq: record.seq,
            ts: record.ts.clone(),
            dir: record.dir,
            len: record.len,
            hash: record.hash.clone(),
            payload: include_payload.then(|| record.payload.clone()),
        }
    }

    /// `<session_id>:<seq>`, the idempotency key collectors deduplicate on.
    pub fn key(&self) -> String {
        record_key(&self.session_id, self.seq)
    }
}

/// Body of a generic-mode POST.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestBatch {
    pub source: String,
    pub generated_at: String,
    pub records: Vec<ShipRecord>,
}

impl IngestBatch {
    pub fn new(records: Vec<ShipRecord>) -> Self {
        Self {
            source: BATCH_SOURCE.to_string(),
            generated_at: crate::record::now_timestamp(),
            records,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Ok,
    Partial,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub reason: String,
}

/// Per-batch answer from the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub status: IngestStatus,
    pub batch_id: BatchId,
    pub accepted: usize,
    #[serde(default)]
    pub rejected: Vec<Rejection>,
    /// Keys of the accepted records, in batch order.
    #[serde(default)]
    pub keys: Vec<String>,
}
