//! Per-session summary document (`meta.json`).

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use trail_core::record::ControlEvent;
use trail_core::{Direction, EventRecord, SessionId};

use crate::error::StoreError;
use crate::layout::SessionPaths;
use crate::reader::read_log;

pub const METADATA_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub records: u64,
    pub raw_bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub resumed_from: Option<SessionId>,
    pub counters: Counters,
    /// Hash of the last record written. Lets verifiers detect a truncated log.
    pub final_hash: Option<String>,
    pub version: u32,
}

impl SessionMetadata {
    /// Write `meta.json` exactly once, atomically (temp file + rename).
    #[instrument(skip(self), fields(session_id = %self.session_id, path = %path.display()))]
    pub fn write_once(&self, path: &Path) -> Result<(), StoreError> {
        if path.exists() {
            return Err(StoreError::Conflict(format!(
                "metadata already written: {}",
                path.display()
            )));
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)?;
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        debug!("session metadata written");
        Ok(())
    }

    /// `Ok(None)` when the document does not exist.
    pub fn read(path: &Path) -> Result<Option<Self>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn duration_secs(&self) -> Option<f64> {
        let start = chrono::DateTime::parse_from_rfc3339(&self.started_at).ok()?;
        let end = chrono::DateTime::parse_from_rfc3339(self.ended_at.as_deref()?).ok()?;
        Some((end - start).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummarySource {
    Metadata,
    /// No `meta.json`: still running or ended without cleanup.
    EventLog,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub metadata: SessionMetadata,
    pub source: SummarySource,
}

impl SessionSummary {
    /// Derive the same facts `meta.json` would hold by scanning records.
    /// `None` for an empty log.
    pub fn from_log(records: &[EventRecord]) -> Option<Self> {
        let first = records.first()?;
        let mut meta = SessionMetadata {
            session_id: first.session_id.clone(),
            started_at: first.ts.clone(),
            ended_at: None,
            exit_code: None,
            signal: None,
            cmd: Vec::new(),
            cwd: String::new(),
            host: String::new(),
            model: None,
            resumed_from: None,
            counters: Counters::default(),
            final_hash: records.last().map(|r| r.hash.clone()),
            version: METADATA_VERSION,
        };

        for record in records {
            meta.counters.records += 1;
            match record.dir {
                Direction::In => meta.counters.bytes_in += record.len as u64,
                Direction::Out => meta.counters.bytes_out += record.len as u64,
                Direction::Control => match record.control_event() {
                    Some(ControlEvent::SessionStarted(start)) => {
                        meta.cmd = start.cmd;
                        meta.cwd = start.cwd;
                        meta.host = start.host;
                        meta.model = start.model;
                        meta.resumed_from = start.resumed_from;
                    }
                    Some(ControlEvent::SessionEnded(end)) => {
                        meta.ended_at = Some(record.ts.clone());
                        meta.exit_code = end.exit_code;
                        meta.signal = end.signal;
                    }
                    _ => {}
                },
            }
        }
        // Raw capture mirrors output bytes one for one.
        meta.counters.raw_bytes = meta.counters.bytes_out;

        Some(Self {
            metadata: meta,
            source: SummarySource::EventLog,
        })
    }

    /// Prefer `meta.json`; fall back to scanning the event log.
    pub fn load(paths: &SessionPaths) -> Result<Option<Self>, StoreError> {
        if let Some(metadata) = SessionMetadata::read(&paths.meta)? {
            return Ok(Some(Self {
                metadata,
                source: SummarySource::Metadata,
            }));
        }
        if !paths.events.exists() {
            return Ok(None);
        }
        let contents = read_log(&paths.events)?;
        let mut summary = Self::from_log(&contents.records);
        if let Some(summary) = summary.as_mut() {
            if let Ok(raw) = std::fs::metadata(&paths.raw) {
                summary.metadata.counters.raw_bytes = raw.len();
            }
        }
        Ok(summary)
    }

    pub fn is_finalized(&self) -> bool {
        self.source == SummarySource::Metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::EventLog;
    use trail_core::record::{now_timestamp, SessionEnd, SessionStart};

    fn sample_log(paths: &SessionPaths, end: bool) -> SessionId {
        let id = SessionId::new();
        let mut log = EventLog::create(&paths.events, id.clone()).unwrap();
        let start = SessionStart {
            cmd: vec!["codex".into(), "--model".into(), "o3".into()],
            cwd: "/work".into(),
            host: "box".into(),
            model: Some("o3".into()),
            ..SessionStart::default()
        };
        log.append_control(&ControlEvent::SessionStarted(start), now_timestamp())
            .unwrap();
        log.append(Direction::In, &[b'x'; 100], now_timestamp()).unwrap();
        log.append(Direction::Out, &[b'y'; 400], now_timestamp()).unwrap();
        if end {
            let end = SessionEnd {
                exit_code: Some(0),
                signal: None,
                bytes_in: 100,
                bytes_out: 400,
            };
            log.append_control(&ControlEvent::SessionEnded(end), now_timestamp())
                .unwrap();
        }
        log.finish().unwrap();
        id
    }

    #[test]
    fn derived_summary_matches_log() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::from_dir(dir.path().join("s"));
        let id = sample_log(&paths, true);

        let summary = SessionSummary::load(&paths).unwrap().unwrap();
        assert_eq!(summary.source, SummarySource::EventLog);
        let meta = summary.metadata;
        assert_eq!(meta.session_id, id);
        assert_eq!(meta.exit_code, Some(0));
        assert!(meta.ended_at.is_some());
        assert_eq!(meta.model.as_deref(), Some("o3"));
        assert_eq!(meta.counters.records, 4);
        assert_eq!(meta.counters.bytes_in, 100);
        assert_eq!(meta.counters.bytes_out, 400);
    }

    #[test]
    fn abnormal_termination_has_no_end() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::from_dir(dir.path().join("s"));
        sample_log(&paths, false);
        let summary = SessionSummary::load(&paths).unwrap().unwrap();
        assert!(summary.metadata.ended_at.is_none());
        assert!(summary.metadata.exit_code.is_none());
        assert!(!summary.is_finalized());
    }

    #[test]
    fn metadata_written_once_and_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::from_dir(dir.path().join("s"));
        sample_log(&paths, true);
        let derived = SessionSummary::load(&paths).unwrap().unwrap().metadata;

        derived.write_once(&paths.meta).unwrap();
        assert!(matches!(
            derived.write_once(&paths.meta),
            Err(StoreError::Conflict(_))
        ));
        assert!(!paths.meta.with_extension("json.tmp").exists());

        let loaded = SessionSummary::load(&paths).unwrap().unwrap();
        assert!(loaded.is_finalized());
        assert_eq!(loaded.metadata, derived);
    }

    #[test]
    fn missing_session_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::from_dir(dir.path().join("absent"));
        assert!(SessionSummary::load(&paths).unwrap().is_none());
    }

    #[test]
    fn duration_from_timestamps() {
        let meta = SessionMetadata {
            session_id: SessionId::new(),
            started_at: "2024-05-01T10:00:00.000Z".into(),
            ended_at: Some("2024-05-01T10:01:30.500Z".into()),
            exit_code: Some(0),
            signal: None,
            cmd: vec![],
            cwd: String::new(),
            host: String::new(),
            model: None,
            resumed_from: None,
            counters: Counters::default(),
            final_hash: None,
            version: METADATA_VERSION,
        };
        assert_eq!(meta.duration_secs(), Some(90.5));
    }
}
