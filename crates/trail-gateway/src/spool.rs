use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use trail_core::record::now_timestamp;
use trail_core::wire::ShipRecord;
use trail_core::BatchId;

use crate::error::GatewayError;

/// One line of a daily received file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub received_at: String,
    pub batch_id: BatchId,
    pub source: String,
    pub key: String,
    pub record: ShipRecord,
}

/// Append-only daily files under `<root>/gateway/`.
pub struct Spool {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl Spool {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("gateway"),
            lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("received-{}.jsonl", date.format("%Y%m%d")))
    }

    /// Append a batch in one write so concurrent batches never interleave.
    pub fn append(&self, batch_id: &BatchId, source: &str, records: &[ShipRecord]) -> Result<PathBuf, GatewayError> {
        let received_at = now_timestamp();
        let mut buf = Vec::new();
        for record in records {
            let entry = SpoolEntry {
                received_at: received_at.clone(),
                batch_id: batch_id.clone(),
                source: source.to_string(),
                key: record.key(),
                record: record.clone(),
            };
            serde_json::to_writer(&mut buf, &entry)?;
            buf.push(b'\n');
        }

        let path = self.path_for(Utc::now().date_naive());
        let spool_err = |source| GatewayError::Spool {
            path: path.clone(),
            source,
        };
        let _guard = self.lock.lock();
        std::fs::create_dir_all(&self.dir).map_err(spool_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(spool_err)?;
        file.write_all(&buf).map_err(spool_err)?;
        Ok(path)
    }
}
