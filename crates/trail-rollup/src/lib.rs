//! Offline aggregation over recorded sessions.
//!
//! Every function here is a pure function of the files under the log root
//! and the explicit inputs; nothing reads global configuration.

pub mod engine;
pub mod error;
pub mod estimator;
pub mod report;

pub use engine::{RollupEngine, SessionFacts};
pub use error::RollupError;
pub use estimator::{CostEstimate, RateLookup, RateTable, TokenHeuristic};
pub use report::{Granularity, IntegrityFailure, RollupRange, RollupReport, RollupStats};
