//! Forwarding event records to a remote collector.
//!
//! Local logs are only ever read. Progress lives in the follower's own
//! SQLite database.

pub mod error;
pub mod follower;
pub mod retry;
pub mod sink;

pub use error::ShipError;
pub use follower::{FollowOptions, Follower, PassSummary};
pub use retry::{RetryOutcome, RetryPolicy};
pub use sink::{sink_from_config, DeliveryReceipt, GenericSink, LokiSink, Sink};
