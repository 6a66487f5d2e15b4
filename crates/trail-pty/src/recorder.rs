//! Best-effort side channel: event log + raw capture for one session.
//!
//! Nothing here may fail the interactive session. The first write error on
//! a sink disables that sink and is kept as a single warning.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use trail_core::record::{ControlEvent, Direction, SessionEnd};
use trail_core::SessionId;
use trail_store::{Counters, EventLog, LogCounters, RawCapture, SessionMetadata, SessionPaths, StoreError};

/// Work sent from the relays and the signal thread to the recorder thread.
#[derive(Debug)]
pub enum RecordMsg {
    Chunk { dir: Direction, bytes: Vec<u8>, ts: String },
    Control { event: ControlEvent, ts: String },
}

pub struct Recorder {
    session_id: SessionId,
    paths: SessionPaths,
    log: Option<EventLog>,
    raw: Option<RawCapture>,
    last_hash: Option<String>,
    counters: Counters,
    warning: Option<String>,
    warning_reported: bool,
}

/// What finalization produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finished {
    pub final_hash: Option<String>,
    pub counters: Counters,
    pub metadata_written: bool,
    /// Set when logging failed and nobody has been told yet.
    pub warning: Option<String>,
}

impl Recorder {
    /// Open both sinks under `paths`. Never fails: a sink that cannot be
    /// opened is simply absent and the reason becomes the warning.
    pub fn open(session_id: SessionId, paths: SessionPaths, transient_retry_limit: u32) -> Self {
        let mut recorder = Self {
            session_id: session_id.clone(),
            paths,
            log: None,
            raw: None,
            last_hash: None,
            counters: Counters::default(),
            warning: None,
            warning_reported: false,
        };
        match EventLog::create(&recorder.paths.events, session_id) {
            Ok(log) => recorder.log = Some(log.with_transient_retry_limit(transient_retry_limit)),
            Err(e) => recorder.note_failure("event log", &e),
        }
        match RawCapture::create(&recorder.paths.raw) {
            Ok(raw) => recorder.raw = Some(raw.with_transient_retry_limit(transient_retry_limit)),
            Err(e) => recorder.note_failure("raw capture", &e),
        }
        recorder
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn is_logging(&self) -> bool {
        self.log.is_some()
    }

    /// The pending warning, handed out at most once.
    pub fn take_warning(&mut self) -> Option<String> {
        if self.warning_reported {
            return None;
        }
        let warning = self.warning.clone()?;
        self.warning_reported = true;
        Some(warning)
    }

    pub fn record(&mut self, msg: RecordMsg) {
        match msg {
            RecordMsg::Chunk { dir, bytes, ts } => self.record_chunk(dir, &bytes, ts),
            RecordMsg::Control { event, ts } => self.record_control(&event, ts),
        }
    }

    pub fn record_chunk(&mut self, dir: Direction, bytes: &[u8], ts: String) {
        if bytes.is_empty() {
            return;
        }
        if dir == Direction::Out {
            if let Some(raw) = self.raw.as_mut() {
                if let Err(e) = raw.append(bytes) {
                    self.raw = None;
                    self.note_failure("raw capture", &e);
                }
            }
        }
        self.append(dir, bytes, ts);
    }

    pub fn record_control(&mut self, event: &ControlEvent, ts: String) {
        self.append(Direction::Control, event.to_payload().as_bytes(), ts);
    }

    fn append(&mut self, dir: Direction, bytes: &[u8], ts: String) {
        let Some(log) = self.log.as_mut() else {
            return;
        };
        match log.append(dir, bytes, ts) {
            Ok(hash) => self.last_hash = Some(hash),
            Err(e) => {
                // What was written before the failure is still in the file.
                let counters = log.counters();
                self.keep_counters(counters);
                self.log = None;
                self.note_failure("event log", &e);
            }
        }
    }

    fn keep_counters(&mut self, counters: LogCounters) {
        self.counters.records = counters.records;
        self.counters.bytes_in = counters.bytes_in;
        self.counters.bytes_out = counters.bytes_out;
    }

    fn note_failure(&mut self, sink: &str, err: &StoreError) {
        warn!(session_id = %self.session_id, sink, error = %err, "session logging disabled");
        if self.warning.is_none() {
            self.warning = Some(format!(
                "trail: {sink} disabled for {} ({err}); the session continues unrecorded",
                self.paths.dir.display()
            ));
        }
    }

    /// Move the recorder onto its own thread. It drains messages until every
    /// sender is dropped, then hands itself back through the join handle.
    pub fn spawn(self) -> (Sender<RecordMsg>, JoinHandle<Recorder>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || self.drain(rx));
        (tx, handle)
    }

    fn drain(mut self, rx: Receiver<RecordMsg>) -> Self {
        for msg in rx {
            self.record(msg);
        }
        self
    }

    /// Append `session_ended`, close both sinks and write `meta.json` from
    /// `metadata` with counters and final hash filled in.
    pub fn finish(mut self, end: SessionEnd, ts: String, mut metadata: SessionMetadata) -> Finished {
        let had_log = self.log.is_some() || self.last_hash.is_some();
        self.record_control(&ControlEvent::SessionEnded(end), ts);

        if let Some(log) = self.log.take() {
            self.keep_counters(log.counters());
            match log.finish() {
                Ok((hash, counters)) => {
                    if counters.records > 0 {
                        self.last_hash = Some(hash);
                    }
                }
                Err(e) => self.note_failure("event log", &e),
            }
        }
        if let Some(raw) = self.raw.take() {
            match raw.finish() {
                Ok(bytes) => self.counters.raw_bytes = bytes,
                Err(e) => self.note_failure("raw capture", &e),
            }
        }

        let mut metadata_written = false;
        if had_log {
            metadata.counters = self.counters;
            metadata.final_hash = self.last_hash.clone();
            match metadata.write_once(&self.paths.meta) {
                Ok(()) => metadata_written = true,
                Err(e) => self.note_failure("metadata", &e),
            }
        }
        debug!(session_id = %self.session_id, records = self.counters.records, "session finalized");

        let warning = self.take_warning();
        Finished {
            final_hash: self.last_hash,
            counters: self.counters,
            metadata_written,
            warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::{FromRawFd, OwnedFd};
    use trail_core::record::{now_timestamp, SessionStart};
    use trail_store::{read_log, verify_file, METADATA_VERSION};

    fn metadata(id: &SessionId) -> SessionMetadata {
        SessionMetadata {
            session_id: id.clone(),
            started_at: now_timestamp(),
            ended_at: Some(now_timestamp()),
            exit_code: Some(0),
            signal: None,
            cmd: vec!["sh".into()],
            cwd: "/".into(),
            host: "h".into(),
            model: None,
            resumed_from: None,
            counters: Counters::default(),
            final_hash: None,
            version: METADATA_VERSION,
        }
    }

    #[test]
    fn records_through_thread_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::new();
        let paths = SessionPaths::from_dir(dir.path().join(id.as_str()));
        let mut recorder = Recorder::open(id.clone(), paths.clone(), 3);
        assert!(recorder.is_logging());
        assert!(recorder.take_warning().is_none());
        recorder.record_control(&ControlEvent::SessionStarted(SessionStart::default()), now_timestamp());

        let (tx, handle) = recorder.spawn();
        tx.send(RecordMsg::Chunk { dir: Direction::In, bytes: b"ls\r".to_vec(), ts: now_timestamp() })
            .unwrap();
        tx.send(RecordMsg::Chunk { dir: Direction::Out, bytes: b"a b\r\n".to_vec(), ts: now_timestamp() })
            .unwrap();
        drop(tx);
        let recorder = handle.join().unwrap();

        let end = SessionEnd { exit_code: Some(0), signal: None, bytes_in: 3, bytes_out: 5 };
        let finished = recorder.finish(end, now_timestamp(), metadata(&id));
        assert!(finished.metadata_written);
        assert!(finished.warning.is_none());
        assert_eq!(finished.counters.records, 4);
        assert_eq!(finished.counters.bytes_in, 3);
        assert_eq!(finished.counters.bytes_out, 5);
        assert_eq!(finished.counters.raw_bytes, 5);

        assert_eq!(std::fs::read(&paths.raw).unwrap(), b"a b\r\n");
        let report = verify_file(&paths.events, finished.final_hash.as_deref()).unwrap();
        assert!(report.report.is_intact());
        let records = read_log(&paths.events).unwrap().records;
        assert!(matches!(records.last().unwrap().control_event(), Some(ControlEvent::SessionEnded(_))));

        let meta = SessionMetadata::read(&paths.meta).unwrap().unwrap();
        assert_eq!(meta.final_hash, finished.final_hash);
        assert_eq!(meta.counters, finished.counters);
    }

    #[test]
    fn log_failure_mid_session_keeps_written_counters() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::new();
        let paths = SessionPaths::from_dir(dir.path().join(id.as_str()));
        let mut recorder = Recorder::open(id.clone(), paths.clone(), 3);

        // A pipe accepts writes until its read end is closed.
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        recorder.log = Some(EventLog::from_writer(id.clone(), File::from(write_end)));

        recorder.record_chunk(Direction::Out, b"abc", now_timestamp());
        recorder.record_chunk(Direction::In, b"xy", now_timestamp());
        drop(read_end);
        recorder.record_chunk(Direction::Out, b"zzzz", now_timestamp());
        assert!(!recorder.is_logging());

        let finished = recorder.finish(SessionEnd::default(), now_timestamp(), metadata(&id));
        assert!(finished.metadata_written);
        assert!(finished.warning.is_some());
        assert!(finished.final_hash.is_some());

        let meta = SessionMetadata::read(&paths.meta).unwrap().unwrap();
        assert_eq!(meta.counters.records, 2);
        assert_eq!(meta.counters.bytes_in, 2);
        assert_eq!(meta.counters.bytes_out, 3);
        assert_eq!(meta.counters.raw_bytes, 7);
    }

    #[test]
    fn unwritable_root_disables_logging_with_one_warning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let id = SessionId::new();
        let paths = SessionPaths::from_dir(blocker.join(id.as_str()));

        let mut recorder = Recorder::open(id.clone(), paths.clone(), 3);
        assert!(!recorder.is_logging());
        let warning = recorder.take_warning().unwrap();
        assert!(warning.contains("event log disabled"));
        assert!(recorder.take_warning().is_none());

        recorder.record_chunk(Direction::Out, b"still fine", now_timestamp());
        let end = SessionEnd::default();
        let finished = recorder.finish(end, now_timestamp(), metadata(&id));
        assert!(!finished.metadata_written);
        assert!(finished.warning.is_none());
        assert!(finished.final_hash.is_none());
    }
}
