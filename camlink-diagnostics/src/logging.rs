//! Structured logging setup

use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

/// Logging setup errors
#[derive(Error, Debug)]
pub enum LoggingError {
    /// A global subscriber is already installed
    #[error("Logging already initialized: {reason}")]
    AlreadyInitialized {
        /// Reason reported by the subscriber registry
        reason: String,
    },
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global fmt subscriber, filtered by `RUST_LOG`
pub fn init_logging() -> Result<(), LoggingError> {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_target(true)
        .try_init()
        .map_err(|e| LoggingError::AlreadyInitialized {
            reason: e.to_string(),
        })?;
    tracing::debug!("Logging initialized");
    Ok(())
}

/// Like [`init_logging`], but a second call is not an error
pub fn try_init_logging() {
    let _ = init_logging();
}
