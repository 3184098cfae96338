//! # camlink Diagnostics
//!
//! Stream statistics and structured logging for the camlink bridge.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod logging;
pub mod stats;

// Re-export main types
pub use logging::{init_logging, try_init_logging, LoggingError};
pub use stats::StreamStats;
