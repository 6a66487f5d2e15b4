use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use trail_core::record::{encode_payload, ControlEvent, Direction, EventRecord, SENTINEL_HASH};
use trail_core::SessionId;

use crate::chain::compute_hash;
use crate::error::{is_transient_kind, StoreError};

/// Running totals kept by the writer so finalization needs no re-scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCounters {
    pub records: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Single-writer handle on one session's `events.jsonl`.
///
/// Owning the handle is what makes a caller the session's only writer; the
/// chain head (`next_seq`, `last_hash`) lives here and nowhere else.
pub struct EventLog<W: Write = File> {
    session_id: SessionId,
    path: Option<PathBuf>,
    writer: W,
    next_seq: u64,
    last_hash: String,
    counters: LogCounters,
    transient_retry_limit: u32,
}

impl EventLog<File> {
    /// Create a new log file. Fails if the file already exists so two
    /// writers can never share a session.
    #[instrument(fields(session_id = %session_id, path = %path.display()))]
    pub fn create(path: &Path, session_id: SessionId) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create_new(true).append(true).open(path)?;
        debug!("event log created");
        let mut log = Self::from_writer(session_id, file);
        log.path = Some(path.to_path_buf());
        Ok(log)
    }
}

impl<W: Write> EventLog<W> {
    pub fn from_writer(session_id: SessionId, writer: W) -> Self {
        Self {
            session_id,
            path: None,
            writer,
            next_seq: 0,
            last_hash: SENTINEL_HASH.to_string(),
            counters: LogCounters::default(),
            transient_retry_limit: 3,
        }
    }

    pub fn with_transient_retry_limit(mut self, limit: u32) -> Self {
        self.transient_retry_limit = limit;
        self
    }

    /// Append one record and return its hash.
    ///
    /// The chain head only advances once the whole line is written, so a
    /// failed append can be retried or abandoned without forking the chain.
    pub fn append(&mut self, dir: Direction, payload: &[u8], ts: String) -> Result<String, StoreError> {
        let (enc, text) = encode_payload(payload);
        let mut record = EventRecord {
            session_id: self.session_id.clone(),
            seq: self.next_seq,
            ts,
            dir,
            enc,
            payload: text,
            len: payload.len(),
            prev_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        record.hash = compute_hash(&record);

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        write_all_retrying(&mut self.writer, &line, self.transient_retry_limit)?;

        self.next_seq += 1;
        self.counters.records += 1;
        match dir {
            Direction::In => self.counters.bytes_in += payload.len() as u64,
            Direction::Out => self.counters.bytes_out += payload.len() as u64,
            Direction::Control => {}
        }
        self.last_hash = record.hash.clone();
        Ok(record.hash)
    }

    pub fn append_control(&mut self, event: &ControlEvent, ts: String) -> Result<String, StoreError> {
        self.append(Direction::Control, event.to_payload().as_bytes(), ts)
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Hash of the last written record, or the sentinel before the first.
    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub fn counters(&self) -> LogCounters {
        self.counters
    }

    /// Flush and close. Returns the final hash and counters.
    pub fn finish(mut self) -> Result<(String, LogCounters), StoreError> {
        self.writer.flush()?;
        Ok((self.last_hash, self.counters))
    }
}

/// Write the whole buffer, resuming after interrupted or would-block errors
/// up to `limit` times. Any other error is returned immediately.
pub(crate) fn write_all_retrying<W: Write>(writer: &mut W, mut buf: &[u8], limit: u32) -> io::Result<()> {
    let mut transient = 0;
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(e) if is_transient_kind(e.kind()) && transient < limit => {
                transient += 1;
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::verify;
    use crate::reader::read_log;
    use trail_core::record::now_timestamp;

    /// Fails the first `failures` writes with `kind`, then accepts a few
    /// bytes at a time.
    struct Flaky {
        failures: u32,
        kind: io::ErrorKind,
        out: Vec<u8>,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::from(self.kind));
            }
            let n = buf.len().min(7);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn append_chains_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = EventLog::create(&path, SessionId::new()).unwrap();

        let h0 = log.append(Direction::In, b"ls\r", now_timestamp()).unwrap();
        let h1 = log.append(Direction::Out, b"file.txt\r\n", now_timestamp()).unwrap();
        assert_ne!(h0, h1);
        assert_eq!(log.next_seq(), 2);
        assert_eq!(log.last_hash(), h1);

        let (final_hash, counters) = log.finish().unwrap();
        assert_eq!(final_hash, h1);
        assert_eq!(counters, LogCounters { records: 2, bytes_in: 3, bytes_out: 10 });

        let contents = read_log(&path).unwrap();
        assert_eq!(contents.records.len(), 2);
        assert_eq!(contents.records[0].prev_hash, SENTINEL_HASH);
        assert_eq!(contents.records[1].prev_hash, h0);
        assert!(verify(&contents.records, Some(&final_hash)).is_intact());
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        std::fs::write(&path, b"").unwrap();
        assert!(EventLog::create(&path, SessionId::new()).is_err());
    }

    #[test]
    fn control_records_do_not_count_bytes() {
        let mut log = EventLog::from_writer(SessionId::new(), Vec::new());
        log.append_control(&ControlEvent::Resized { cols: 80, rows: 24 }, now_timestamp())
            .unwrap();
        let counters = log.counters();
        assert_eq!(counters.records, 1);
        assert_eq!(counters.bytes_in + counters.bytes_out, 0);
    }

    #[test]
    fn transient_errors_are_retried_within_budget() {
        let flaky = Flaky { failures: 3, kind: io::ErrorKind::Interrupted, out: Vec::new() };
        let mut log = EventLog::from_writer(SessionId::new(), flaky).with_transient_retry_limit(3);
        log.append(Direction::Out, b"hello world", now_timestamp()).unwrap();
        assert_eq!(log.next_seq(), 1);
        assert!(log.writer.out.ends_with(b"\n"));
    }

    #[test]
    fn transient_errors_beyond_budget_fail_without_advancing() {
        let flaky = Flaky { failures: 5, kind: io::ErrorKind::WouldBlock, out: Vec::new() };
        let mut log = EventLog::from_writer(SessionId::new(), flaky).with_transient_retry_limit(2);
        let err = log.append(Direction::Out, b"x", now_timestamp()).unwrap_err();
        assert!(err.is_transient());
        assert_eq!(log.next_seq(), 0);
        assert_eq!(log.last_hash(), SENTINEL_HASH);
    }

    #[test]
    fn hard_errors_are_not_retried() {
        let flaky = Flaky { failures: 1, kind: io::ErrorKind::PermissionDenied, out: Vec::new() };
        let mut log = EventLog::from_writer(SessionId::new(), flaky);
        let err = log.append(Direction::In, b"x", now_timestamp()).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn binary_payload_roundtrips_through_base64() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let mut log = EventLog::create(&path, SessionId::new()).unwrap();
        let bytes = [0xff, 0x00, 0x1b, b'[', 0xc3];
        log.append(Direction::Out, &bytes, now_timestamp()).unwrap();
        log.finish().unwrap();

        let contents = read_log(&path).unwrap();
        assert_eq!(contents.records[0].payload_bytes().unwrap(), bytes);
        assert_eq!(contents.records[0].len, bytes.len());
    }
}
