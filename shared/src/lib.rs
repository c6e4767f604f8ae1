//! Shared utilities and types for the event gateway services

// Re-export common dependencies
pub use anyhow;
pub use bytes;
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tracing;

pub mod messaging;
pub mod observability;
