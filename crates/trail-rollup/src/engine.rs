use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use trail_core::argv;
use trail_core::config::RollupConfig;
use trail_core::record::parse_timestamp;
use trail_store::{
    discover_sessions, verify_file, Counters, SessionLocation, SessionMetadata, SessionSummary, SummarySource,
};

use crate::error::RollupError;
use crate::estimator::{CostEstimate, RateLookup, RateTable, TokenHeuristic};
use crate::report::{Granularity, IntegrityFailure, RollupRange, RollupReport, RollupStats};

/// Everything the report needs from one verified session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionFacts {
    pub session_id: String,
    pub date: NaiveDate,
    pub started_at: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration_secs: Option<f64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub model: Option<String>,
    pub subcommand: String,
    pub start_hour: Option<u32>,
    pub cost: CostEstimate,
    /// Summary came from `meta.json` rather than a log scan.
    pub finalized: bool,
}

enum Outcome {
    Counted(SessionFacts),
    Flagged(IntegrityFailure),
    Empty,
}

pub struct RollupEngine {
    root: PathBuf,
    heuristic: TokenHeuristic,
    rates: Box<dyn RateLookup>,
}

impl RollupEngine {
    pub fn new(root: impl Into<PathBuf>, heuristic: TokenHeuristic, rates: Box<dyn RateLookup>) -> Self {
        Self {
            root: root.into(),
            heuristic,
            rates,
        }
    }

    pub fn from_config(root: impl Into<PathBuf>, config: &RollupConfig) -> Self {
        Self::new(
            root,
            TokenHeuristic::from_config(config),
            Box::new(RateTable::from_config(config)),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Verify and aggregate every session that started in `range`.
    ///
    /// Sessions whose chain does not verify are listed in
    /// `integrity_failures` and contribute nothing to any total.
    #[instrument(skip(self), fields(root = %self.root.display(), start = %range.start, end = %range.end))]
    pub fn run(&self, range: RollupRange, granularity: Granularity) -> Result<RollupReport, RollupError> {
        let locations = discover_sessions(&self.root, range.start, range.end)?;
        let mut report = RollupReport {
            range,
            granularity,
            totals: RollupStats::default(),
            buckets: BTreeMap::new(),
            sessions: Vec::new(),
            integrity_failures: Vec::new(),
        };

        // Discovery returns sessions in id order, which keeps float sums stable.
        for location in &locations {
            match self.analyze(location)? {
                Outcome::Counted(facts) => {
                    report.totals.add(&facts);
                    report
                        .buckets
                        .entry(granularity.bucket(facts.date))
                        .or_default()
                        .add(&facts);
                    report.sessions.push(facts);
                }
                Outcome::Flagged(failure) => {
                    warn!(session_id = %failure.session_id, reason = %failure.reason, "integrity failure");
                    report.integrity_failures.push(failure);
                }
                Outcome::Empty => debug!(session_id = %location.session_id, "skipping empty session"),
            }
        }

        info!(
            sessions = report.totals.sessions,
            integrity_failures = report.integrity_failures.len(),
            "rollup complete"
        );
        Ok(report)
    }

    fn analyze(&self, location: &SessionLocation) -> Result<Outcome, RollupError> {
        let paths = &location.paths;
        let flag = |reason: String| {
            Outcome::Flagged(IntegrityFailure {
                session_id: location.session_id.to_string(),
                path: paths.events.display().to_string(),
                reason,
            })
        };

        if !paths.events.exists() {
            return Ok(flag("event log missing".to_string()));
        }
        let metadata = match SessionMetadata::read(&paths.meta) {
            Ok(metadata) => metadata,
            Err(e) => return Ok(flag(format!("unreadable metadata: {e}"))),
        };
        let expected_final = metadata.as_ref().and_then(|m| m.final_hash.clone());
        let verification = verify_file(&paths.events, expected_final.as_deref())?;
        if !verification.report.is_intact() {
            return Ok(flag(verification.report.status.to_string()));
        }

        // Every figure below comes from the verified records. `meta.json` is
        // only trusted for what the log cannot say, and only where it agrees.
        let contents = trail_store::read_log(&paths.events)?;
        let Some(scanned) = SessionSummary::from_log(&contents.records) else {
            return Ok(Outcome::Empty);
        };
        if scanned.metadata.session_id != location.session_id {
            return Ok(flag(format!("log belongs to {}", scanned.metadata.session_id)));
        }
        let summary = match metadata {
            None => scanned,
            Some(metadata) => match reconcile(metadata, scanned.metadata) {
                Ok(metadata) => SessionSummary {
                    metadata,
                    source: SummarySource::Metadata,
                },
                Err(reason) => return Ok(flag(reason)),
            },
        };
        Ok(Outcome::Counted(self.facts(location.date, &summary)))
    }

    fn facts(&self, date: NaiveDate, summary: &SessionSummary) -> SessionFacts {
        let meta = &summary.metadata;
        let model = meta.model.clone().or_else(|| argv::detect_model(&meta.cmd));
        let tokens_in = self.heuristic.estimate(meta.counters.bytes_in, model.as_deref());
        let tokens_out = self.heuristic.estimate(meta.counters.bytes_out, model.as_deref());
        let cost = CostEstimate::compute(self.rates.rate_for(model.as_deref()), tokens_in, tokens_out);
        let subcommand = if meta.cmd.is_empty() {
            "interactive".to_string()
        } else {
            argv::subcommand(&meta.cmd)
        };
        SessionFacts {
            session_id: meta.session_id.to_string(),
            date,
            started_at: meta.started_at.clone(),
            exit_code: meta.exit_code,
            signal: meta.signal,
            duration_secs: meta.duration_secs(),
            bytes_in: meta.counters.bytes_in,
            bytes_out: meta.counters.bytes_out,
            tokens_in,
            tokens_out,
            model,
            subcommand,
            start_hour: parse_timestamp(&meta.started_at).map(|t| t.hour()),
            cost,
            finalized: summary.is_finalized(),
        }
    }
}

/// Merge `meta.json` with what the log says.
///
/// Counters always come from the log. The exit status comes from the log's
/// end record when there is one; `meta.json` only fills it in for sessions
/// whose log was cut short by a recording failure.
fn reconcile(metadata: SessionMetadata, scanned: SessionMetadata) -> Result<SessionMetadata, String> {
    let (stored, counted) = (&metadata.counters, &scanned.counters);
    if (stored.records, stored.bytes_in, stored.bytes_out) != (counted.records, counted.bytes_in, counted.bytes_out) {
        return Err(format!(
            "metadata counters disagree with log: {} records, {} bytes in, {} bytes out recorded; log has {}, {}, {}",
            stored.records, stored.bytes_in, stored.bytes_out, counted.records, counted.bytes_in, counted.bytes_out
        ));
    }
    if metadata.started_at != scanned.started_at {
        return Err(format!(
            "metadata start {} disagrees with log start {}",
            metadata.started_at, scanned.started_at
        ));
    }
    let log_ended = scanned.ended_at.is_some();
    if log_ended && (metadata.exit_code, metadata.signal) != (scanned.exit_code, scanned.signal) {
        return Err("metadata exit status disagrees with log".to_string());
    }
    Ok(SessionMetadata {
        counters: Counters {
            raw_bytes: metadata.counters.raw_bytes,
            ..scanned.counters
        },
        cmd: scanned.cmd,
        model: scanned.model,
        ended_at: if log_ended { scanned.ended_at } else { metadata.ended_at },
        exit_code: if log_ended { scanned.exit_code } else { metadata.exit_code },
        signal: if log_ended { scanned.signal } else { metadata.signal },
        ..metadata
    })
}
