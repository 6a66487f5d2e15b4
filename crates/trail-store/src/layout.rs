//! On-disk layout: `<root>/YYYY/MM/DD/<session_id>/{events.jsonl,raw.log,meta.json}`.
//!
//! The date is the UTC date the session started. Anything under the root
//! that does not fit the pattern (`diagnostics/`, `gateway/`, the follower
//! database) is ignored.

use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use trail_core::SessionId;

use crate::error::StoreError;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const RAW_FILE: &str = "raw.log";
pub const META_FILE: &str = "meta.json";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub events: PathBuf,
    pub raw: PathBuf,
    pub meta: PathBuf,
}

impl SessionPaths {
    pub fn new(root: &Path, date: NaiveDate, session_id: &SessionId) -> Self {
        Self::from_dir(date_dir(root, date).join(session_id.as_str()))
    }

    pub fn from_dir(dir: PathBuf) -> Self {
        Self {
            events: dir.join(EVENTS_FILE),
            raw: dir.join(RAW_FILE),
            meta: dir.join(META_FILE),
            dir,
        }
    }
}

pub fn date_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(format!("{:04}", date.year()))
        .join(format!("{:02}", date.month()))
        .join(format!("{:02}", date.day()))
}

/// A session directory found under the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionLocation {
    pub session_id: SessionId,
    pub date: NaiveDate,
    pub paths: SessionPaths,
}

/// Sessions whose start date lies in `[start, end]`, ordered by id.
#[instrument(fields(root = %root.display(), %start, %end))]
pub fn discover_sessions(root: &Path, start: NaiveDate, end: NaiveDate) -> Result<Vec<SessionLocation>, StoreError> {
    let mut found: Vec<SessionLocation> = walk(root)?
        .into_iter()
        .filter(|loc| loc.date >= start && loc.date <= end)
        .collect();
    found.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(found)
}

/// Every session under the root, ordered by id.
pub fn discover_all(root: &Path) -> Result<Vec<SessionLocation>, StoreError> {
    let mut found = walk(root)?;
    found.sort_by(|a, b| a.session_id.cmp(&b.session_id));
    Ok(found)
}

fn walk(root: &Path) -> Result<Vec<SessionLocation>, StoreError> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(4)
        .max_depth(4)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.depth() == 4 || is_numeric_dir(e));
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry during discovery");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !name.starts_with(SessionId::PREFIX) {
            continue;
        }
        let Some(date) = date_from_path(root, entry.path()) else {
            continue;
        };
        out.push(SessionLocation {
            session_id: SessionId::from_raw(name.into_owned()),
            date,
            paths: SessionPaths::from_dir(entry.path().to_path_buf()),
        });
    }
    Ok(out)
}

fn is_numeric_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
}

fn date_from_path(root: &Path, session_dir: &Path) -> Option<NaiveDate> {
    let rel = session_dir.strip_prefix(root).ok()?;
    let mut parts = rel.components().map(|c| c.as_os_str().to_str());
    let year = parts.next()??.parse().ok()?;
    let month = parts.next()??.parse().ok()?;
    let day = parts.next()??.parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<PathBuf>,
    pub kept: usize,
    pub dry_run: bool,
}

/// Delete session directories that started more than `retention_days`
/// before `today`, then any date directories left empty. A negative
/// retention keeps everything.
#[instrument(fields(root = %root.display(), retention_days, dry_run))]
pub fn prune(root: &Path, retention_days: i64, today: NaiveDate, dry_run: bool) -> Result<PruneReport, StoreError> {
    let mut report = PruneReport {
        dry_run,
        ..PruneReport::default()
    };
    let sessions = discover_all(root)?;
    if retention_days < 0 {
        report.kept = sessions.len();
        return Ok(report);
    }
    let cutoff = today - Duration::days(retention_days);

    for loc in sessions {
        if loc.date >= cutoff {
            report.kept += 1;
            continue;
        }
        if !dry_run {
            std::fs::remove_dir_all(&loc.paths.dir)?;
            info!(session_id = %loc.session_id, path = %loc.paths.dir.display(), "pruned session");
        }
        report.removed.push(loc.paths.dir);
    }

    if !dry_run {
        remove_empty_date_dirs(root)?;
    }
    Ok(report)
}

fn remove_empty_date_dirs(root: &Path) -> Result<(), StoreError> {
    // Deepest first so a day, then its month, then its year can go.
    let dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(3)
        .contents_first(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || is_numeric_dir(e))
        .filter_map(Result::ok)
        .map(|e| e.into_path())
        .collect();
    for dir in dirs {
        let empty = std::fs::read_dir(&dir)?.next().is_none();
        if empty {
            std::fs::remove_dir(&dir)?;
        }
    }
    Ok(())
}
