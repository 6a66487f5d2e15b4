pub mod argv;
pub mod config;
pub mod errors;
pub mod ids;
pub mod record;
pub mod wire;

pub use config::TrailConfig;
pub use errors::DeliveryError;
pub use ids::{BatchId, SessionId};
pub use record::{ControlEvent, Direction, EventRecord, PayloadEncoding, SENTINEL_HASH};
