//! Request and response shapes of the HTTP surface

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::*;

/// Body returned for an accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub status: String,
}

impl PublishAck {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

/// Liveness body; never reflects broker state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(
            serde_json::to_string(&PublishAck::success()).unwrap(),
            r#"{"status":"success"}"#
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus { status: true }).unwrap(),
            r#"{"status":true}"#
        );
    }
}
