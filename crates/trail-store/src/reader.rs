//! Readers for `events.jsonl` that tolerate a concurrent writer.
//!
//! Only newline-terminated lines are ever interpreted. Bytes after the last
//! `\n` are either a write in progress or a crash-truncated record; both are
//! left alone until (if ever) the newline arrives.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use trail_core::EventRecord;

use crate::chain::{verify, BreakReason, VerifyReport};
use crate::error::StoreError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogLine {
    Record(EventRecord),
    /// A complete line that is not a record. `line` is 0-based.
    Corrupt { line: usize, detail: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PositionedLine {
    pub line: LogLine,
    /// Byte offset just past this line.
    pub end_offset: u64,
    /// Lines consumed including this one.
    pub lines_through: usize,
}

/// Incremental, offset-based reader.
#[derive(Clone, Debug)]
pub struct LogReader {
    path: PathBuf,
    offset: u64,
    line: usize,
}

impl LogReader {
    pub fn new(path: &Path) -> Self {
        Self::at(path, 0, 0)
    }

    /// Resume from a byte offset previously returned by [`offset`](Self::offset).
    pub fn at(path: &Path, offset: u64, line: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            offset,
            line,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte offset just past the last complete line consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of complete lines consumed.
    pub fn lines_consumed(&self) -> usize {
        self.line
    }

    /// Read up to `max` complete lines appended since the previous call.
    pub fn poll(&mut self, max: usize) -> Result<Vec<LogLine>, StoreError> {
        Ok(self.poll_positioned(max)?.into_iter().map(|p| p.line).collect())
    }

    /// Like [`poll`](Self::poll), but each line carries the reader position
    /// just past it, so a consumer can persist progress line by line.
    pub fn poll_positioned(&mut self, max: usize) -> Result<Vec<PositionedLine>, StoreError> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            // The file was replaced or truncated under us; nothing past the
            // old offset can be trusted to line up.
            debug!(path = %self.path.display(), len, offset = self.offset, "log shrank, rewinding");
            self.offset = 0;
            self.line = 0;
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut out = Vec::new();
        let mut buf = Vec::new();
        while out.len() < max {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            let line = parse_line(&buf[..n - 1], self.line);
            self.offset += n as u64;
            self.line += 1;
            out.push(PositionedLine {
                line,
                end_offset: self.offset,
                lines_through: self.line,
            });
        }
        Ok(out)
    }

    /// True when bytes follow the last complete line.
    pub fn has_partial_tail(&self) -> Result<bool, StoreError> {
        let len = std::fs::metadata(&self.path)?.len();
        Ok(len > self.offset)
    }
}

fn parse_line(bytes: &[u8], line: usize) -> LogLine {
    match serde_json::from_slice::<EventRecord>(bytes) {
        Ok(record) => LogLine::Record(record),
        Err(e) => LogLine::Corrupt {
            line,
            detail: e.to_string(),
        },
    }
}

/// Everything readable from one log file.
#[derive(Clone, Debug, Default)]
pub struct LogContents {
    /// Records before the first corrupt line.
    pub records: Vec<EventRecord>,
    /// First complete line that failed to parse.
    pub corrupt: Option<(usize, String)>,
    /// Bytes after the last newline (crash mid-write or a write in flight).
    pub truncated_tail: bool,
}

/// Read a whole log. Stops collecting at the first corrupt line.
pub fn read_log(path: &Path) -> Result<LogContents, StoreError> {
    let mut reader = LogReader::new(path);
    let mut contents = LogContents::default();
    'outer: loop {
        let lines = reader.poll(1024)?;
        if lines.is_empty() {
            break;
        }
        for line in lines {
            match line {
                LogLine::Record(record) => contents.records.push(record),
                LogLine::Corrupt { line, detail } => {
                    contents.corrupt = Some((line, detail));
                    break 'outer;
                }
            }
        }
    }
    if contents.corrupt.is_none() {
        contents.truncated_tail = reader.has_partial_tail()?;
    }
    Ok(contents)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileVerification {
    pub path: PathBuf,
    pub report: VerifyReport,
    /// An incomplete trailing record was ignored. Prior records still count.
    pub truncated_tail: bool,
}

impl FileVerification {
    pub fn is_intact(&self) -> bool {
        self.report.is_intact()
    }
}

/// Verify a log file on disk. A corrupt line in the middle of the file is a
/// chain break at its position; an unterminated last line is reported as a
/// truncated tail and does not invalidate earlier records.
#[instrument(fields(path = %path.display()))]
pub fn verify_file(path: &Path, expected_final: Option<&str>) -> Result<FileVerification, StoreError> {
    let contents = read_log(path)?;
    let report = match contents.corrupt {
        Some((line, detail)) => {
            let prefix = verify(&contents.records, None);
            if prefix.is_intact() {
                VerifyReport::broken_at(line, prefix.final_hash, BreakReason::Unparsable { detail })
            } else {
                prefix
            }
        }
        None => verify(&contents.records, expected_final),
    };
    if !report.is_intact() {
        debug!(status = ?report.status, "chain verification failed");
    }
    Ok(FileVerification {
        path: path.to_path_buf(),
        report,
        truncated_tail: contents.truncated_tail,
    })
}
