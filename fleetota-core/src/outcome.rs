//! Result of one node update pipeline run

use serde::{Deserialize, Serialize};

use crate::health::HealthReport;

/// What a node reports after an install attempt.
///
/// Only built through the constructors below: `rolled_back` implies
/// `!success`, and `success` implies `health_check_passed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub health_check_passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
    /// Present when the post-install health check actually ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
}

impl Outcome {
    /// Install and health check both passed
    pub fn committed(health: HealthReport) -> Self {
        Self {
            success: true,
            health_check_passed: true,
            error_message: None,
            rolled_back: false,
            health: Some(health),
        }
    }

    /// Failed before anything on the node changed
    pub fn aborted(error: impl Into<String>) -> Self {
        Self {
            success: false,
            health_check_passed: false,
            error_message: Some(error.into()),
            rolled_back: false,
            health: None,
        }
    }

    /// Failed after install started; `rolled_back` tells whether the
    /// previous state was restored
    pub fn rolled_back(error: impl Into<String>, rolled_back: bool, health: Option<HealthReport>) -> Self {
        Self {
            success: false,
            health_check_passed: false,
            error_message: Some(error.into()),
            rolled_back,
            health,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_keep_invariants() {
        let ok = Outcome::committed(HealthReport::healthy());
        assert!(ok.success && ok.health_check_passed && !ok.rolled_back);
        assert!(ok.error_message.is_none());

        let aborted = Outcome::aborted("checksum mismatch");
        assert!(!aborted.success && !aborted.rolled_back && aborted.health.is_none());

        let rb = Outcome::rolled_back("health check failed", true, Some(HealthReport::unhealthy("cpu")));
        assert!(!rb.success && rb.rolled_back && !rb.health_check_passed);
    }

    #[test]
    fn test_json_shape() {
        let json = serde_json::to_value(Outcome::aborted("boom")).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_message"], "boom");
        assert!(json.get("health").is_none());
    }
}
