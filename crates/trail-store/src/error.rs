use std::io;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt row in {table}.{column}: {detail}")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },
}

impl StoreError {
    /// Interrupted or would-block I/O: worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(e) if is_transient_kind(e.kind()))
    }
}

pub(crate) fn is_transient_kind(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock)
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_io_kinds() {
        assert!(StoreError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_transient());
        assert!(StoreError::Io(io::Error::from(io::ErrorKind::WouldBlock)).is_transient());
        assert!(!StoreError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn display_includes_detail() {
        let err = StoreError::CorruptRow {
            table: "cursors",
            column: "last_seq",
            detail: "negative".into(),
        };
        assert_eq!(err.to_string(), "corrupt row in cursors.last_seq: negative");
    }
}
