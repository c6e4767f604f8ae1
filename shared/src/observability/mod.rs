//! Observability utilities for logging, tracing, and metrics
//!
//! Provides centralized observability setup for all services

pub mod logging;
pub mod metrics;
pub mod tracing;

pub use self::logging::*;
pub use self::metrics::*;
pub use self::tracing::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Invalid logging option: {0}")]
    InvalidOption(String),
}

pub type ObservabilityResult<T> = Result<T, ObservabilityError>;
