//! Timeout enforcement for build invocations.
//!
//! - `overall_seconds`: maximum wall-clock time per build
//! - `idle_log_seconds`: maximum time without new output on stdout/stderr
//!
//! The enforcer only reports timeout conditions; terminating the child is
//! the executor's job.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Upper bound for `overall_seconds`.
pub const MAX_OVERALL_SECONDS: u64 = 86_400;

/// Timeout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Maximum wall-clock time per build (default: 3600 = 1 hour)
    pub overall_seconds: u64,

    /// Maximum time without output; `None` disables the idle check
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_log_seconds: Option<u64>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            overall_seconds: 3600,
            idle_log_seconds: None,
        }
    }
}

impl TimeoutConfig {
    /// Validate bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // overall_seconds must be in (0, 86400]
        if self.overall_seconds == 0 || self.overall_seconds > MAX_OVERALL_SECONDS {
            return Err(TimeoutValidationError::OverallOutOfBounds {
                value: self.overall_seconds,
            });
        }

        // idle_log_seconds must be in (0, overall_seconds]
        if let Some(idle) = self.idle_log_seconds {
            if idle == 0 || idle > self.overall_seconds {
                return Err(TimeoutValidationError::IdleOutOfBounds {
                    value: idle,
                    max: self.overall_seconds,
                });
            }
        }

        Ok(())
    }
}

/// Timeout validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("overall_seconds must be in (0, 86400], got {value}")]
    OverallOutOfBounds { value: u64 },

    #[error("idle_log_seconds must be in (0, {max}], got {value}")]
    IdleOutOfBounds { value: u64, max: u64 },
}

/// Timeout check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    Ok,
    /// Overall wall-clock timeout exceeded
    OverallTimeout,
    /// No output for longer than the idle limit
    IdleTimeout,
}

/// Tracks wall-clock time and output activity for one build.
#[derive(Debug)]
pub struct TimeoutEnforcer {
    config: TimeoutConfig,
    start_time: Instant,
    last_activity: Instant,
}

impl TimeoutEnforcer {
    pub fn new(config: TimeoutConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            start_time: now,
            last_activity: now,
        }
    }

    /// Adopt an activity timestamp observed elsewhere (the log streamers).
    pub fn sync_activity(&mut self, last_activity: Instant) {
        if last_activity > self.last_activity {
            self.last_activity = last_activity;
        }
    }

    pub fn check(&self) -> TimeoutStatus {
        let now = Instant::now();

        if now.duration_since(self.start_time) > Duration::from_secs(self.config.overall_seconds) {
            return TimeoutStatus::OverallTimeout;
        }

        if let Some(idle) = self.config.idle_log_seconds {
            if now.duration_since(self.last_activity) > Duration::from_secs(idle) {
                return TimeoutStatus::IdleTimeout;
            }
        }

        TimeoutStatus::Ok
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TimeoutConfig::default().validate().is_ok());
    }

    #[test]
    fn test_overall_bounds() {
        let zero = TimeoutConfig {
            overall_seconds: 0,
            idle_log_seconds: None,
        };
        assert_eq!(
            zero.validate(),
            Err(TimeoutValidationError::OverallOutOfBounds { value: 0 })
        );

        let huge = TimeoutConfig {
            overall_seconds: MAX_OVERALL_SECONDS + 1,
            idle_log_seconds: None,
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_idle_must_not_exceed_overall() {
        let config = TimeoutConfig {
            overall_seconds: 60,
            idle_log_seconds: Some(120),
        };
        assert_eq!(
            config.validate(),
            Err(TimeoutValidationError::IdleOutOfBounds { value: 120, max: 60 })
        );
    }

    #[test]
    fn test_fresh_enforcer_is_ok() {
        let enforcer = TimeoutEnforcer::new(TimeoutConfig::default());
        assert_eq!(enforcer.check(), TimeoutStatus::Ok);
        assert!(enforcer.elapsed() < Duration::from_secs(3600));
    }

    #[test]
    fn test_sync_activity_never_moves_backwards() {
        let mut enforcer = TimeoutEnforcer::new(TimeoutConfig::default());
        let earlier = enforcer.last_activity;
        let later = earlier + Duration::from_millis(5);
        enforcer.sync_activity(later);
        enforcer.sync_activity(earlier);
        assert_eq!(enforcer.last_activity, later);
    }

    #[test]
    fn test_idle_timeout_fires_without_output() {
        let mut enforcer = TimeoutEnforcer::new(TimeoutConfig {
            overall_seconds: 60,
            idle_log_seconds: Some(1),
        });
        enforcer.last_activity -= Duration::from_secs(2);
        assert_eq!(enforcer.check(), TimeoutStatus::IdleTimeout);
    }
}
