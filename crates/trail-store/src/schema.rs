/// SQL DDL for the follower state database.
/// WAL mode enabled at connection time.
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS cursors (
    session_id TEXT PRIMARY KEY,
    path TEXT NOT NULL,
    last_seq INTEGER,
    byte_offset INTEGER NOT NULL DEFAULT 0,
    line INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS held (
    session_id TEXT PRIMARY KEY,
    first_seq INTEGER NOT NULL,
    last_seq INTEGER NOT NULL,
    attempts INTEGER NOT NULL,
    error_kind TEXT NOT NULL,
    last_error TEXT NOT NULL,
    held_at TEXT NOT NULL,
    retry_after TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_held_retry_after ON held(retry_after);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = FULL;
"#;
