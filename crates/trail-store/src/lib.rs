pub mod chain;
pub mod cursors;
pub mod database;
pub mod error;
pub mod layout;
pub mod log;
pub mod meta;
pub mod raw;
pub mod reader;
pub mod schema;

pub use chain::{compute_hash, verify, BreakReason, ChainStatus, VerifyReport};
pub use cursors::{Cursor, CursorRepo, HeldBatch};
pub use database::Database;
pub use error::StoreError;
pub use layout::{discover_all, discover_sessions, prune, PruneReport, SessionLocation, SessionPaths};
pub use log::{EventLog, LogCounters};
pub use meta::{Counters, SessionMetadata, SessionSummary, SummarySource, METADATA_VERSION};
pub use raw::RawCapture;
pub use reader::{read_log, verify_file, FileVerification, LogContents, LogLine, LogReader, PositionedLine};
