use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;
use serde::Serialize;
use tracing::instrument;

use trail_core::SessionId;

use crate::database::Database;
use crate::error::StoreError;

/// Follower progress for one session. Everything up to and including
/// `last_seq` has been acknowledged by the destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cursor {
    pub session_id: SessionId,
    pub path: String,
    pub last_seq: Option<u64>,
    /// Byte offset just past the line holding `last_seq`.
    pub byte_offset: u64,
    /// Lines consumed up to `byte_offset`.
    pub line: usize,
    pub updated_at: String,
}

/// A batch the destination kept refusing. The cursor does not move past it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HeldBatch {
    pub session_id: SessionId,
    pub first_seq: u64,
    pub last_seq: u64,
    pub attempts: u32,
    pub error_kind: String,
    pub last_error: String,
    pub held_at: String,
    pub retry_after: String,
}

impl HeldBatch {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.retry_after)
            .map(|t| t.with_timezone(&Utc) <= now)
            .unwrap_or(true)
    }
}

#[derive(Clone)]
pub struct CursorRepo {
    db: Database,
}

impl CursorRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn get(&self, session_id: &SessionId) -> Result<Option<Cursor>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT session_id, path, last_seq, byte_offset, line, updated_at
                 FROM cursors WHERE session_id = ?1",
                [session_id.as_str()],
                row_to_cursor,
            )
            .optional()?
            .transpose()
        })
    }

    /// Record that everything through `last_seq` was acknowledged.
    #[instrument(skip(self, path), fields(session_id = %session_id, last_seq))]
    pub fn advance(
        &self,
        session_id: &SessionId,
        path: &str,
        last_seq: u64,
        byte_offset: u64,
        line: usize,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cursors (session_id, path, last_seq, byte_offset, line, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(session_id) DO UPDATE SET
                    path = excluded.path,
                    last_seq = excluded.last_seq,
                    byte_offset = excluded.byte_offset,
                    line = excluded.line,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    session_id.as_str(),
                    path,
                    to_i64(last_seq)?,
                    to_i64(byte_offset)?,
                    to_i64(line as u64)?,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list(&self) -> Result<Vec<Cursor>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, path, last_seq, byte_offset, line, updated_at
                 FROM cursors ORDER BY session_id",
            )?;
            let rows = stmt.query_map([], row_to_cursor)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// Hold (or re-hold) a session's pending batch until `retry_after`.
    #[instrument(skip(self, last_error), fields(session_id = %session_id, error_kind))]
    #[allow(clippy::too_many_arguments)]
    pub fn hold(
        &self,
        session_id: &SessionId,
        first_seq: u64,
        last_seq: u64,
        attempts: u32,
        error_kind: &str,
        last_error: &str,
        retry_after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO held (session_id, first_seq, last_seq, attempts, error_kind, last_error, held_at, retry_after)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(session_id) DO UPDATE SET
                    first_seq = excluded.first_seq,
                    last_seq = excluded.last_seq,
                    attempts = held.attempts + excluded.attempts,
                    error_kind = excluded.error_kind,
                    last_error = excluded.last_error,
                    retry_after = excluded.retry_after",
                rusqlite::params![
                    session_id.as_str(),
                    to_i64(first_seq)?,
                    to_i64(last_seq)?,
                    attempts,
                    error_kind,
                    last_error,
                    now,
                    retry_after.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn held(&self, session_id: &SessionId) -> Result<Option<HeldBatch>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT session_id, first_seq, last_seq, attempts, error_kind, last_error, held_at, retry_after
                 FROM held WHERE session_id = ?1",
                [session_id.as_str()],
                row_to_held,
            )
            .optional()?
            .transpose()
        })
    }

    pub fn list_held(&self) -> Result<Vec<HeldBatch>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, first_seq, last_seq, attempts, error_kind, last_error, held_at, retry_after
                 FROM held ORDER BY session_id",
            )?;
            let rows = stmt.query_map([], row_to_held)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row??);
            }
            Ok(out)
        })
    }

    /// Clear a hold once its batch is delivered.
    pub fn release(&self, session_id: &SessionId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM held WHERE session_id = ?1", [session_id.as_str()])?;
            Ok(n > 0)
        })
    }
}

fn to_i64(v: u64) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|_| StoreError::Serialization(format!("value out of range: {v}")))
}

fn to_u64(v: i64, table: &'static str, column: &'static str) -> Result<u64, StoreError> {
    u64::try_from(v).map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("negative value {v}"),
    })
}

// Inner Result carries conversion failures that rusqlite cannot express.
fn row_to_cursor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Cursor, StoreError>> {
    let session_id: String = row.get(0)?;
    let path: String = row.get(1)?;
    let last_seq: Option<i64> = row.get(2)?;
    let byte_offset: i64 = row.get(3)?;
    let line: i64 = row.get(4)?;
    let updated_at: String = row.get(5)?;
    let build = || -> Result<Cursor, StoreError> {
        Ok(Cursor {
            session_id: SessionId::from_raw(session_id),
            path,
            last_seq: last_seq.map(|v| to_u64(v, "cursors", "last_seq")).transpose()?,
            byte_offset: to_u64(byte_offset, "cursors", "byte_offset")?,
            line: to_u64(line, "cursors", "line")? as usize,
            updated_at,
        })
    };
    Ok(build())
}

fn row_to_held(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<HeldBatch, StoreError>> {
    let session_id: String = row.get(0)?;
    let first_seq: i64 = row.get(1)?;
    let last_seq: i64 = row.get(2)?;
    let attempts: u32 = row.get(3)?;
    let error_kind: String = row.get(4)?;
    let last_error: String = row.get(5)?;
    let held_at: String = row.get(6)?;
    let retry_after: String = row.get(7)?;
    let build = || -> Result<HeldBatch, StoreError> {
        Ok(HeldBatch {
            session_id: SessionId::from_raw(session_id),
            first_seq: to_u64(first_seq, "held", "first_seq")?,
            last_seq: to_u64(last_seq, "held", "last_seq")?,
            attempts,
            error_kind,
            last_error,
            held_at,
            retry_after,
        })
    };
    Ok(build())
}
