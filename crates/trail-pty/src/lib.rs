//! Transparent PTY interception with side-channel recording.
//!
//! Unix only: the wrapped program runs on the slave side of a pseudo-terminal
//! while two relay threads copy bytes between it and the real terminal.

#![cfg(unix)]

pub mod error;
pub mod exit;
pub mod interceptor;
pub mod pty;
pub mod recorder;
mod relay;
mod signals;
pub mod terminal;

pub use error::InterceptError;
pub use exit::ExitOutcome;
pub use interceptor::{hostname, InterceptOptions, Interceptor, SessionOutcome, TerminalIo};
