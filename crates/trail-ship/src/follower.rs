//! Tails session logs and ships new records with at-least-once delivery.
//!
//! A session's cursor only moves after the destination acknowledged every
//! record up to it, so a crash re-sends at most the batch in flight. A batch
//! that keeps failing is held: the session is skipped until the hold's
//! cooldown passes, and other sessions keep flowing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use trail_core::config::FollowerConfig;
use trail_core::wire::ShipRecord;
use trail_core::SessionId;
use trail_store::layout::{discover_all, EVENTS_FILE};
use trail_store::{CursorRepo, HeldBatch, LogLine, LogReader};

use crate::error::ShipError;
use crate::retry::RetryPolicy;
use crate::sink::Sink;

#[derive(Clone, Debug)]
pub struct FollowOptions {
    pub batch_size: usize,
    pub include_payload: bool,
    /// Ship records already present in sessions found on the first pass.
    /// When false those sessions start at their current end.
    pub from_beginning: bool,
    pub hold_cooldown: Duration,
    pub poll_interval: Duration,
}

impl Default for FollowOptions {
    fn default() -> Self {
        Self::from_config(&FollowerConfig::default())
    }
}

impl FollowOptions {
    pub fn from_config(config: &FollowerConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            include_payload: config.include_payload,
            from_beginning: config.from_beginning,
            hold_cooldown: Duration::from_secs(config.hold_cooldown_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(50)),
        }
    }
}

/// What one pass over the root did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct PassSummary {
    pub sessions: usize,
    pub shipped: usize,
    pub batches: usize,
    /// Records the destination refused individually.
    pub rejected: usize,
    /// Sessions skipped because their hold has not expired.
    pub deferred: usize,
    /// Sessions started at their end instead of shipped.
    pub primed: usize,
    /// `<path>:<line>` of complete lines that are not records.
    pub corrupt: Vec<String>,
    /// Every hold outstanding after the pass.
    pub held: Vec<HeldBatch>,
}

pub struct Follower {
    root: PathBuf,
    repo: CursorRepo,
    sink: Arc<dyn Sink>,
    policy: RetryPolicy,
    options: FollowOptions,
    first_pass_done: bool,
}

impl Follower {
    pub fn new(root: PathBuf, repo: CursorRepo, sink: Arc<dyn Sink>, policy: RetryPolicy, options: FollowOptions) -> Self {
        Self {
            root,
            repo,
            sink,
            policy,
            options,
            first_pass_done: false,
        }
    }

    pub fn repo(&self) -> &CursorRepo {
        &self.repo
    }

    /// Ship whatever is new in every session under the root.
    #[instrument(skip(self), fields(root = %self.root.display(), sink = self.sink.name()))]
    pub async fn run_once(&mut self) -> Result<PassSummary, ShipError> {
        let mut summary = PassSummary::default();
        let prime = !self.first_pass_done && !self.options.from_beginning;
        for location in discover_all(&self.root)? {
            if !location.paths.events.is_file() {
                continue;
            }
            summary.sessions += 1;
            self.ship_session(&location.session_id, &location.paths.events, prime, &mut summary)
                .await?;
        }
        self.first_pass_done = true;
        summary.held = self.repo.list_held()?;
        if summary.shipped > 0 || !summary.held.is_empty() {
            info!(
                sessions = summary.sessions,
                shipped = summary.shipped,
                batches = summary.batches,
                held = summary.held.len(),
                "follow pass complete"
            );
        }
        Ok(summary)
    }

    /// Ship one `events.jsonl` regardless of where it lives.
    pub async fn ship_file(&mut self, path: &Path) -> Result<PassSummary, ShipError> {
        let session_id = session_id_for(path)?;
        let mut summary = PassSummary {
            sessions: 1,
            ..PassSummary::default()
        };
        self.ship_session(&session_id, path, false, &mut summary).await?;
        summary.held = self.repo.held(&session_id)?.into_iter().collect();
        Ok(summary)
    }

    /// Follow until cancelled. File events wake the loop early; the poll
    /// interval is the fallback when watching is unavailable.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ShipError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watcher = match watch(&self.root, self.options.poll_interval, tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "file watching unavailable, polling only");
                None
            }
        };

        info!(
            root = %self.root.display(),
            sink = self.sink.name(),
            interval_ms = self.options.poll_interval.as_millis() as u64,
            "follower started"
        );
        loop {
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "follow pass failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = rx.recv() => {
                    while rx.try_recv().is_ok() {}
                }
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }
        info!("follower stopped");
        Ok(())
    }

    async fn ship_session(
        &mut self,
        session_id: &SessionId,
        path: &Path,
        prime: bool,
        summary: &mut PassSummary,
    ) -> Result<(), ShipError> {
        if let Some(hold) = self.repo.held(session_id)? {
            if !hold.is_due(Utc::now()) {
                summary.deferred += 1;
                return Ok(());
            }
            debug!(%session_id, attempts = hold.attempts, "hold expired, retrying");
        }

        let cursor = self.repo.get(session_id)?;
        if cursor.is_none() && prime {
            if self.prime(session_id, path, summary)? {
                summary.primed += 1;
            }
            return Ok(());
        }

        let path_str = path.to_string_lossy().into_owned();
        let (offset, line, mut last_seq) = cursor.map_or((0, 0, None), |c| (c.byte_offset, c.line, c.last_seq));
        let mut reader = LogReader::at(path, offset, line);

        loop {
            let lines = reader.poll_positioned(self.options.batch_size)?;
            if lines.is_empty() {
                return Ok(());
            }

            let mut batch: Vec<ShipRecord> = Vec::new();
            let mut position = None;
            let mut stop = false;
            for positioned in lines {
                match positioned.line {
                    LogLine::Record(record) if &record.session_id != session_id => {
                        summary.corrupt.push(format!("{}:{}", path.display(), positioned.lines_through - 1));
                        warn!(%session_id, found = %record.session_id, "foreign record in session log");
                        stop = true;
                        break;
                    }
                    LogLine::Record(record) => {
                        position = Some((positioned.end_offset, positioned.lines_through));
                        // Already acknowledged; the log was rewound or rewritten.
                        if last_seq.is_some_and(|seen| record.seq <= seen) {
                            continue;
                        }
                        batch.push(ShipRecord::from_record(&record, self.options.include_payload));
                    }
                    LogLine::Corrupt { line, detail } => {
                        summary.corrupt.push(format!("{}:{line}", path.display()));
                        warn!(%session_id, line, %detail, "corrupt line, session paused");
                        stop = true;
                        break;
                    }
                }
            }

            let Some((end_offset, lines_through)) = position else {
                return Ok(());
            };
            let (Some(first), Some(last)) = (batch.first().map(|r| r.seq), batch.last().map(|r| r.seq)) else {
                // Only duplicates; skip past them.
                if let Some(seen) = last_seq {
                    self.repo.advance(session_id, &path_str, seen, end_offset, lines_through)?;
                }
                if stop {
                    return Ok(());
                }
                continue;
            };

            match self.policy.deliver(self.sink.as_ref(), &batch).await {
                Ok(receipt) => {
                    self.repo.advance(session_id, &path_str, last, end_offset, lines_through)?;
                    if self.repo.release(session_id)? {
                        info!(%session_id, "held batch delivered");
                    }
                    last_seq = Some(last);
                    summary.shipped += batch.len();
                    summary.batches += 1;
                    summary.rejected += receipt.rejected.len();
                    debug!(%session_id, first, last, accepted = receipt.accepted, "batch delivered");
                }
                Err(outcome) => {
                    let cooldown = chrono::Duration::from_std(self.options.hold_cooldown).unwrap_or_else(|_| chrono::Duration::zero());
                    self.repo.hold(
                        session_id,
                        first,
                        last,
                        outcome.attempts,
                        outcome.error.error_kind(),
                        &outcome.error.to_string(),
                        Utc::now() + cooldown,
                    )?;
                    warn!(
                        %session_id,
                        first,
                        last,
                        attempts = outcome.attempts,
                        kind = outcome.error.error_kind(),
                        "batch held"
                    );
                    return Ok(());
                }
            }
            if stop {
                return Ok(());
            }
        }
    }

    /// Start a session at its current end, or just before its first corrupt
    /// line. Returns false when there is no good record to start after, in
    /// which case it ships from the start later.
    fn prime(&self, session_id: &SessionId, path: &Path, summary: &mut PassSummary) -> Result<bool, ShipError> {
        let mut reader = LogReader::new(path);
        let mut end = None;
        'scan: loop {
            let lines = reader.poll_positioned(1024)?;
            if lines.is_empty() {
                break;
            }
            for positioned in lines {
                match positioned.line {
                    LogLine::Record(record) if &record.session_id != session_id => {
                        summary.corrupt.push(format!("{}:{}", path.display(), positioned.lines_through - 1));
                        warn!(%session_id, found = %record.session_id, "foreign record in session log");
                        break 'scan;
                    }
                    LogLine::Record(record) => end = Some((record.seq, positioned.end_offset, positioned.lines_through)),
                    LogLine::Corrupt { line, detail } => {
                        summary.corrupt.push(format!("{}:{line}", path.display()));
                        warn!(%session_id, line, %detail, "corrupt line, session paused");
                        break 'scan;
                    }
                }
            }
        }
        let Some((seq, offset, line)) = end else {
            return Ok(false);
        };
        self.repo
            .advance(session_id, &path.to_string_lossy(), seq, offset, line)?;
        debug!(%session_id, seq, "primed at end of log");
        Ok(true)
    }
}

/// Session id from a `sess_*` parent directory, else from the first record.
fn session_id_for(path: &Path) -> Result<SessionId, ShipError> {
    let from_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| n.starts_with("sess_"))
        .map(SessionId::from_raw);
    if let Some(id) = from_dir {
        return Ok(id);
    }
    match LogReader::new(path).poll(1)?.into_iter().next() {
        Some(LogLine::Record(record)) => Ok(record.session_id),
        _ => Err(ShipError::NotASessionLog(path.display().to_string())),
    }
}

fn watch(root: &Path, interval: Duration, tx: mpsc::UnboundedSender<()>) -> Result<PollWatcher, ShipError> {
    std::fs::create_dir_all(root).map_err(notify::Error::io)?;
    let config = notify::Config::default().with_poll_interval(interval);
    let mut watcher = PollWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                    && event
                        .paths
                        .iter()
                        .any(|p| p.file_name().is_some_and(|n| n == EVENTS_FILE));
                if relevant {
                    let _ = tx.send(());
                }
            }
        },
        config,
    )?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DeliveryReceipt;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use parking_lot::Mutex;
    use trail_core::record::now_timestamp;
    use trail_core::{DeliveryError, Direction};
    use trail_store::layout::SessionPaths;
    use trail_store::{Database, EventLog};

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<(String, u64)>>,
        fail: Mutex<Option<DeliveryError>>,
    }

    #[async_trait]
    impl Sink for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn deliver(&self, records: &[ShipRecord]) -> Result<DeliveryReceipt, DeliveryError> {
            if let Some(err) = self.fail.lock().clone() {
                return Err(err);
            }
            self.seen
                .lock()
                .extend(records.iter().map(|r| (r.session_id.to_string(), r.seq)));
            Ok(DeliveryReceipt::all(records.len()))
        }
    }

    fn session(root: &Path, n: usize) -> (SessionId, EventLog) {
        let id = SessionId::new();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let paths = SessionPaths::new(root, date, &id);
        std::fs::create_dir_all(&paths.dir).unwrap();
        let mut log = EventLog::create(&paths.events, id.clone()).unwrap();
        for i in 0..n {
            log.append(Direction::Out, format!("{i}").as_bytes(), now_timestamp()).unwrap();
        }
        (id, log)
    }

    fn follower(root: &Path, sink: Arc<Collect>, options: FollowOptions) -> Follower {
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        Follower::new(
            root.to_path_buf(),
            CursorRepo::new(Database::in_memory().unwrap()),
            sink,
            policy,
            options,
        )
    }

    fn options() -> FollowOptions {
        FollowOptions {
            batch_size: 3,
            hold_cooldown: Duration::ZERO,
            ..FollowOptions::default()
        }
    }

    #[tokio::test]
    async fn ships_everything_then_only_new_records() {
        let dir = tempfile::tempdir().unwrap();
        let (id, mut log) = session(dir.path(), 7);
        let sink = Arc::new(Collect::default());
        let mut follower = follower(dir.path(), sink.clone(), options());

        let first = follower.run_once().await.unwrap();
        assert_eq!(first.shipped, 7);
        assert_eq!(first.batches, 3);

        assert_eq!(follower.run_once().await.unwrap().shipped, 0);

        log.append(Direction::In, b"x", now_timestamp()).unwrap();
        assert_eq!(follower.run_once().await.unwrap().shipped, 1);

        let seqs: Vec<u64> = sink.seen.lock().iter().map(|(_, s)| *s).collect();
        assert_eq!(seqs, (0..8).collect::<Vec<_>>());
        assert_eq!(follower.repo().get(&id).unwrap().unwrap().last_seq, Some(7));
    }

    #[tokio::test]
    async fn existing_sessions_start_at_end_without_from_beginning() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut old) = session(dir.path(), 4);
        let sink = Arc::new(Collect::default());
        let mut follower = follower(
            dir.path(),
            sink.clone(),
            FollowOptions {
                from_beginning: false,
                ..options()
            },
        );

        let first = follower.run_once().await.unwrap();
        assert_eq!(first.shipped, 0);
        assert_eq!(first.primed, 1);

        old.append(Direction::Out, b"new", now_timestamp()).unwrap();
        let (_, _fresh) = session(dir.path(), 2);
        let second = follower.run_once().await.unwrap();
        // One new record in the old session plus the whole new session.
        assert_eq!(second.shipped, 3);
    }

    #[tokio::test]
    async fn failure_holds_session_and_keeps_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let (id, _log) = session(dir.path(), 2);
        let sink = Arc::new(Collect::default());
        *sink.fail.lock() = Some(DeliveryError::Rejected {
            status: 400,
            body: "schema".into(),
        });
        let mut follower = follower(dir.path(), sink.clone(), options());

        let summary = follower.run_once().await.unwrap();
        assert_eq!(summary.shipped, 0);
        assert_eq!(summary.held.len(), 1);
        assert_eq!(summary.held[0].error_kind, "rejected");
        assert_eq!((summary.held[0].first_seq, summary.held[0].last_seq), (0, 1));
        assert!(follower.repo().get(&id).unwrap().is_none());

        *sink.fail.lock() = None;
        let retry = follower.run_once().await.unwrap();
        assert_eq!(retry.shipped, 2);
        assert!(retry.held.is_empty());
    }

    #[tokio::test]
    async fn corrupt_line_pauses_only_that_session() {
        let dir = tempfile::tempdir().unwrap();
        let (bad, log) = session(dir.path(), 2);
        let bad_path = log.path().unwrap().to_path_buf();
        drop(log);
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&bad_path).unwrap();
            f.write_all(b"{garbage\n").unwrap();
        }
        let (good, _log) = session(dir.path(), 3);

        let sink = Arc::new(Collect::default());
        let mut follower = follower(dir.path(), sink.clone(), options());
        let summary = follower.run_once().await.unwrap();
        assert_eq!(summary.shipped, 5);
        assert_eq!(summary.corrupt, vec![format!("{}:2", bad_path.display())]);
        assert_eq!(follower.repo().get(&bad).unwrap().unwrap().last_seq, Some(1));
        assert_eq!(follower.repo().get(&good).unwrap().unwrap().last_seq, Some(2));
    }

    #[tokio::test]
    async fn priming_stops_before_a_corrupt_line() {
        let dir = tempfile::tempdir().unwrap();
        let (id, mut log) = session(dir.path(), 2);
        let path = log.path().unwrap().to_path_buf();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{garbage\n").unwrap();
        }
        log.append(Direction::Out, b"after", now_timestamp()).unwrap();
        log.append(Direction::Out, b"more", now_timestamp()).unwrap();

        let sink = Arc::new(Collect::default());
        let mut follower = follower(
            dir.path(),
            sink.clone(),
            FollowOptions {
                from_beginning: false,
                ..options()
            },
        );
        let summary = follower.run_once().await.unwrap();
        assert_eq!(summary.primed, 1);
        assert_eq!(summary.corrupt, vec![format!("{}:2", path.display())]);
        assert_eq!(follower.repo().get(&id).unwrap().unwrap().last_seq, Some(1));

        let next = follower.run_once().await.unwrap();
        assert_eq!(next.shipped, 0);
        assert_eq!(next.corrupt.len(), 1);
        assert!(sink.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn ship_file_reads_session_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (id, log) = session(dir.path(), 2);
        let path = log.path().unwrap().to_path_buf();
        let sink = Arc::new(Collect::default());
        let mut follower = follower(dir.path(), sink.clone(), options());
        let summary = follower.ship_file(&path).await.unwrap();
        assert_eq!(summary.shipped, 2);
        assert_eq!(sink.seen.lock()[0].0, id.to_string());
    }

    #[test]
    fn non_session_file_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello\n").unwrap();
        assert!(matches!(session_id_for(&path), Err(ShipError::NotASessionLog(_))));
    }
}
