use chrono::NaiveDate;

#[derive(Debug, thiserror::Error)]
pub enum RollupError {
    #[error("invalid range: {start} is after {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    #[error("unknown granularity: {0}")]
    UnknownGranularity(String),

    #[error("store error: {0}")]
    Store(#[from] trail_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
