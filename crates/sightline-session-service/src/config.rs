//! Session service configuration

use pipeline_engine::{ExhaustionAction, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionServiceError};

/// Tunables of the session service.
///
/// Every field has a default, so a partial JSON object is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionServiceConfig {
    /// Events buffered per run before the run waits for its consumer
    pub event_buffer: usize,
    /// Prior turns read from the history store for each run
    pub history_limit: usize,
    /// Policy of the query generate/validate loop
    pub query_policy: RetryPolicy,
    /// Policy of the interpretation generate/validate loop
    pub interpretation_policy: RetryPolicy,
    /// Cancel the in-flight run of a session when a new run starts for it
    pub supersede_in_flight: bool,
    /// Append question and answer to the history store after a successful run
    pub record_history: bool,
}

impl Default for SessionServiceConfig {
    fn default() -> Self {
        Self {
            event_buffer: 64,
            history_limit: 10,
            query_policy: RetryPolicy::query_validation(),
            interpretation_policy: RetryPolicy::interpretation_validation(),
            supersede_in_flight: true,
            record_history: true,
        }
    }
}

impl SessionServiceConfig {
    /// Reject configurations the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(SessionServiceError::InvalidConfig(
                "eventBuffer must be at least 1".to_string(),
            ));
        }
        for (name, policy) in [
            ("queryPolicy", &self.query_policy),
            ("interpretationPolicy", &self.interpretation_policy),
        ] {
            if policy.max_attempts == 0 {
                return Err(SessionServiceError::InvalidConfig(format!(
                    "{}.maxAttempts must be at least 1",
                    name
                )));
            }
        }
        // An unaccepted query is never executed.
        if self.query_policy.on_exhaustion == ExhaustionAction::ProceedWithBestEffort {
            return Err(SessionServiceError::InvalidConfig(
                "queryPolicy.onExhaustion must be abort_run".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionServiceConfig::default();
        assert_eq!(config.event_buffer, 64);
        assert_eq!(config.history_limit, 10);
        assert_eq!(config.query_policy.max_attempts, 3);
        assert_eq!(
            config.interpretation_policy.on_exhaustion,
            ExhaustionAction::ProceedWithBestEffort
        );
        assert!(config.supersede_in_flight);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "historyLimit": 4,
            "queryPolicy": {"maxAttempts": 5, "onExhaustion": "abort_run"}
        }"#;
        let config: SessionServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.history_limit, 4);
        assert_eq!(config.query_policy.max_attempts, 5);
        assert_eq!(config.event_buffer, 64);
        assert!(config.record_history);
    }

    #[test]
    fn test_best_effort_query_policy_is_rejected() {
        let config = SessionServiceConfig {
            query_policy: RetryPolicy::new(3, ExhaustionAction::ProceedWithBestEffort),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SessionServiceError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_buffer_is_rejected() {
        let config = SessionServiceConfig {
            event_buffer: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
