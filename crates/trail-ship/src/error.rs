use trail_core::DeliveryError;
use trail_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ShipError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("not a session log: {0}")]
    NotASessionLog(String),
}
