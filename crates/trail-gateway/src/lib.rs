//! Local HTTP ingest endpoint for shipped session records.

pub mod error;
pub mod ingest;
pub mod server;
pub mod spool;

pub use error::GatewayError;
pub use ingest::{validate_batch, BatchError, Validated};
pub use server::{build_router, start, GatewayHandle, GatewayOptions};
pub use spool::{Spool, SpoolEntry};
