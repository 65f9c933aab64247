//! Validated shutdown grace period.

use std::time::Duration;

use super::ConfigError;

/// Time the scheduler waits for outstanding units after cancelling them.
///
/// # Valid Range
///
/// - Minimum: 100 milliseconds
/// - Maximum: 60 seconds
/// - Default: 5 seconds
///
/// When the grace period expires, remaining unit tasks are aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownGrace(Duration);

impl ShutdownGrace {
    pub const DEFAULT_MS: u64 = 5_000;
    pub const MIN_MS: u64 = 100;
    pub const MAX_MS: u64 = 60_000;

    /// Create a grace period, rejecting values outside the valid range.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        let min = Duration::from_millis(Self::MIN_MS);
        let max = Duration::from_millis(Self::MAX_MS);
        if duration < min {
            return Err(ConfigError::Invalid {
                field: "shutdown_grace_ms",
                reason: format!("must be at least {:?}, got {:?}", min, duration),
            });
        }
        if duration > max {
            return Err(ConfigError::Invalid {
                field: "shutdown_grace_ms",
                reason: format!("must be at most {:?}, got {:?}", max, duration),
            });
        }
        Ok(Self(duration))
    }

    pub fn from_millis(millis: u64) -> Result<Self, ConfigError> {
        Self::new(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for ShutdownGrace {
    fn default() -> Self {
        Self(Duration::from_millis(Self::DEFAULT_MS))
    }
}
