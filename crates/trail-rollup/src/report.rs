use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::engine::SessionFacts;
use crate::error::RollupError;
use crate::estimator::{round6, CostEstimate};

/// Inclusive date range, in UTC session-start dates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl RollupRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, RollupError> {
        if start > end {
            return Err(RollupError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    /// The ISO week (Monday to Sunday) containing `date`.
    pub fn week_of(date: NaiveDate) -> Self {
        let start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
        Self {
            start,
            end: start + Duration::days(6),
        }
    }

    /// `days` days ending with `end`. Zero is treated as one.
    pub fn last_days(end: NaiveDate, days: u32) -> Self {
        let span = i64::from(days.max(1)) - 1;
        Self {
            start: end - Duration::days(span),
            end,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn label(&self) -> String {
        if self.start == self.end {
            self.start.format("%Y-%m-%d").to_string()
        } else {
            format!("{} to {}", self.start.format("%Y-%m-%d"), self.end.format("%Y-%m-%d"))
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    Daily,
    Weekly,
}

impl Granularity {
    pub fn bucket(&self, date: NaiveDate) -> String {
        match self {
            Self::Daily => date.format("%Y-%m-%d").to_string(),
            Self::Weekly => {
                let week = date.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" | "day" => Ok(Self::Daily),
            "weekly" | "week" => Ok(Self::Weekly),
            other => Err(RollupError::UnknownGranularity(other.to_string())),
        }
    }
}

/// Aggregate figures over a set of verified sessions.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupStats {
    pub sessions: u64,
    pub successful: u64,
    pub failed: u64,
    /// No end record yet: still running, or killed without cleanup.
    pub unfinished: u64,
    pub total_duration_secs: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Sum over sessions whose model could be priced.
    pub cost_usd: f64,
    pub unknown_cost_sessions: u64,
    pub exit_codes: BTreeMap<String, u64>,
    pub models: BTreeMap<String, u64>,
    pub subcommands: BTreeMap<String, u64>,
    /// Session starts per UTC hour.
    pub hours: BTreeMap<u32, u64>,
}

impl RollupStats {
    pub fn add(&mut self, facts: &SessionFacts) {
        self.sessions += 1;
        let exit_key = match (facts.exit_code, facts.signal) {
            (Some(0), _) => {
                self.successful += 1;
                "0".to_string()
            }
            (Some(code), _) => {
                self.failed += 1;
                code.to_string()
            }
            (None, Some(signal)) => {
                self.failed += 1;
                format!("signal:{signal}")
            }
            (None, None) => {
                self.unfinished += 1;
                "unfinished".to_string()
            }
        };
        *self.exit_codes.entry(exit_key).or_default() += 1;

        self.total_duration_secs = round6(self.total_duration_secs + facts.duration_secs.unwrap_or(0.0));
        self.bytes_in += facts.bytes_in;
        self.bytes_out += facts.bytes_out;
        self.tokens_in += facts.tokens_in;
        self.tokens_out += facts.tokens_out;
        match facts.cost {
            CostEstimate::Known(usd) => self.cost_usd = round6(self.cost_usd + usd),
            CostEstimate::Unknown => self.unknown_cost_sessions += 1,
        }

        let model = facts.model.clone().unwrap_or_else(|| "unknown".to_string());
        *self.models.entry(model).or_default() += 1;
        *self.subcommands.entry(facts.subcommand.clone()).or_default() += 1;
        if let Some(hour) = facts.start_hour {
            *self.hours.entry(hour).or_default() += 1;
        }
    }

    pub fn avg_duration_secs(&self) -> f64 {
        if self.sessions == 0 {
            return 0.0;
        }
        self.total_duration_secs / self.sessions as f64
    }

    pub fn avg_cost_usd(&self) -> f64 {
        let priced = self.sessions - self.unknown_cost_sessions;
        if priced == 0 {
            return 0.0;
        }
        self.cost_usd / priced as f64
    }
}

/// A session left out of the totals because its log did not verify.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFailure {
    pub session_id: String,
    pub path: String,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RollupReport {
    pub range: RollupRange,
    pub granularity: Granularity,
    pub totals: RollupStats,
    pub buckets: BTreeMap<String, RollupStats>,
    pub sessions: Vec<SessionFacts>,
    pub integrity_failures: Vec<IntegrityFailure>,
}

impl RollupReport {
    pub fn to_json(&self) -> Result<String, RollupError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Session Report - {}", self.range.label());
        out.push('\n');
        write_stats(&mut out, "##", &self.totals);

        if self.buckets.len() > 1 {
            for (bucket, stats) in &self.buckets {
                let _ = writeln!(out, "\n## {bucket}\n");
                let _ = writeln!(
                    out,
                    "- **Sessions**: {} ({} ok, {} failed, {} unfinished)",
                    stats.sessions, stats.successful, stats.failed, stats.unfinished
                );
                let _ = writeln!(
                    out,
                    "- **Bytes**: {} in / {} out",
                    stats.bytes_in, stats.bytes_out
                );
                let _ = writeln!(out, "- **Estimated Cost**: ${:.4}", stats.cost_usd);
            }
        }

        if !self.integrity_failures.is_empty() {
            let _ = writeln!(out, "\n## Integrity Failures\n");
            for failure in &self.integrity_failures {
                let _ = writeln!(out, "- **{}**: {} ({})", failure.session_id, failure.reason, failure.path);
            }
        }
        out
    }
}

fn write_stats(out: &mut String, heading: &str, stats: &RollupStats) {
    let pct = if stats.sessions == 0 {
        0.0
    } else {
        100.0 * stats.successful as f64 / stats.sessions as f64
    };
    let _ = writeln!(out, "{heading} Summary\n");
    let _ = writeln!(out, "- **Total Sessions**: {}", stats.sessions);
    let _ = writeln!(out, "- **Successful**: {} ({pct:.1}%)", stats.successful);
    let _ = writeln!(out, "- **Failed**: {}", stats.failed);
    let _ = writeln!(out, "- **Unfinished**: {}", stats.unfinished);
    let _ = writeln!(out, "- **Total Duration**: {:.2} hours", stats.total_duration_secs / 3600.0);
    let _ = writeln!(out, "- **Avg Session**: {:.1} seconds", stats.avg_duration_secs());

    let _ = writeln!(out, "\n{heading} Usage & Costs\n");
    let _ = writeln!(out, "- **Input**: {} bytes (~{} tokens)", stats.bytes_in, stats.tokens_in);
    let _ = writeln!(out, "- **Output**: {} bytes (~{} tokens)", stats.bytes_out, stats.tokens_out);
    let _ = writeln!(out, "- **Estimated Cost**: ${:.4}", stats.cost_usd);
    let _ = writeln!(out, "- **Cost/Session**: ${:.4}", stats.avg_cost_usd());
    if stats.unknown_cost_sessions > 0 {
        let _ = writeln!(out, "- **Unknown Cost**: {} sessions", stats.unknown_cost_sessions);
    }

    write_counts(out, heading, "Commands Used", &stats.subcommands);
    write_counts(out, heading, "Models Used", &stats.models);
    write_counts(out, heading, "Exit Codes", &stats.exit_codes);

    if !stats.hours.is_empty() {
        let _ = writeln!(out, "\n{heading} Hourly Distribution\n");
        for (hour, count) in &stats.hours {
            let bar = "#".repeat((*count).min(20) as usize);
            let _ = writeln!(out, "- **{hour:02}:00**: {count:2} {bar}");
        }
    }
}

/// Most frequent first; ties by name so output is stable.
fn write_counts(out: &mut String, heading: &str, title: &str, counts: &BTreeMap<String, u64>) {
    if counts.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{heading} {title}\n");
    let mut sorted: Vec<_> = counts.iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (name, count) in sorted {
        let _ = writeln!(out, "- **{name}**: {count} sessions");
    }
}
