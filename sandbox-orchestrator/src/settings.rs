use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

/// Upper bound for the cleanup grace period: one year.
pub const MAX_CLEANUP_GRACE_SECS: u64 = 366 * 24 * 60 * 60;

/// Tunables for the executors and the scheduler. All durations are seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Members provisioned together in one driver invocation (provider quota).
    pub batch_size: usize,
    pub group_cooldown_secs: u64,
    pub cleanup_grace_secs: u64,
    pub creation_timeout_secs: u64,
    pub destruction_timeout_secs: u64,
    pub destroy_max_retries: u32,
    pub destroy_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Units of work allowed to run at once across all workshops.
    pub worker_pool_size: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            batch_size: 3,
            group_cooldown_secs: 300,
            cleanup_grace_secs: 7200,
            creation_timeout_secs: 1800,
            destruction_timeout_secs: 600,
            destroy_max_retries: 2,
            destroy_backoff_secs: 30,
            max_backoff_secs: 300,
            worker_pool_size: 4,
        }
    }
}

impl OrchestratorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OrchestratorError::InvalidInput(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(OrchestratorError::InvalidInput(
                "worker_pool_size must be at least 1".into(),
            ));
        }
        if self.creation_timeout_secs == 0 || self.destruction_timeout_secs == 0 {
            return Err(OrchestratorError::InvalidInput(
                "driver timeouts must be positive".into(),
            ));
        }
        if self.destruction_timeout_secs >= self.creation_timeout_secs {
            return Err(OrchestratorError::InvalidInput(format!(
                "destruction_timeout_secs ({}) must be shorter than creation_timeout_secs ({})",
                self.destruction_timeout_secs, self.creation_timeout_secs
            )));
        }
        if self.cleanup_grace_secs > MAX_CLEANUP_GRACE_SECS {
            return Err(OrchestratorError::InvalidInput(format!(
                "cleanup_grace_secs must be at most {MAX_CLEANUP_GRACE_SECS}"
            )));
        }
        Ok(())
    }

    pub fn group_cooldown(&self) -> Duration {
        Duration::from_secs(self.group_cooldown_secs)
    }

    /// Saturates instead of overflowing for values `validate` would reject.
    pub fn cleanup_grace(&self) -> chrono::TimeDelta {
        i64::try_from(self.cleanup_grace_secs)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .unwrap_or(chrono::TimeDelta::MAX)
    }

    pub fn creation_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_timeout_secs)
    }

    pub fn destruction_timeout(&self) -> Duration {
        Duration::from_secs(self.destruction_timeout_secs)
    }

    pub fn destroy_backoff(&self) -> Duration {
        Duration::from_secs(self.destroy_backoff_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_provider_quota() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.batch_size, 3);
        assert_eq!(settings.group_cooldown(), Duration::from_secs(300));
        assert_eq!(settings.cleanup_grace(), chrono::Duration::hours(2));
        assert_eq!(settings.destroy_max_retries, 2);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let settings = OrchestratorSettings {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(OrchestratorError::InvalidInput(_))
        ));
    }

    #[test]
    fn destroy_deadline_must_be_shorter_than_creation() {
        let settings = OrchestratorSettings {
            creation_timeout_secs: 600,
            destruction_timeout_secs: 600,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(OrchestratorError::InvalidInput(msg)) if msg.contains("destruction_timeout_secs")
        ));
    }

    #[test]
    fn oversized_grace_is_rejected_without_panicking() {
        let settings = OrchestratorSettings {
            cleanup_grace_secs: u64::MAX,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
        assert_eq!(settings.cleanup_grace(), chrono::TimeDelta::MAX);

        let year = OrchestratorSettings {
            cleanup_grace_secs: MAX_CLEANUP_GRACE_SECS,
            ..Default::default()
        };
        assert!(year.validate().is_ok());
    }

    #[test]
    fn partial_settings_keep_defaults() {
        let settings: OrchestratorSettings =
            serde_json::from_str(r#"{"batch_size": 2, "group_cooldown_secs": 0}"#).unwrap();
        assert_eq!(settings.batch_size, 2);
        assert_eq!(settings.group_cooldown_secs, 0);
        assert_eq!(settings.destruction_timeout_secs, 600);
    }
}
