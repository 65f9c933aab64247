//! Engine settings as read from `dapwire.toml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ConfigError, ShutdownGrace};
use crate::scheduler::SchedulerOptions;

/// Every field is optional in the file; missing ones take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Process-wide bound on concurrently running units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    pub supersede_serial: bool,
    pub shutdown_grace_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    pub inbound_queue_capacity: usize,
    pub read_chunk_size: usize,
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: None,
            supersede_serial: true,
            shutdown_grace_ms: ShutdownGrace::DEFAULT_MS,
            request_timeout_ms: None,
            inbound_queue_capacity: 256,
            read_chunk_size: 8192,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineSettings {
    /// Parse settings from TOML text and validate them.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ShutdownGrace::from_millis(self.shutdown_grace_ms)?;
        if self.concurrency == Some(0) {
            return Err(ConfigError::Invalid {
                field: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "request_timeout_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.inbound_queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "inbound_queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "read_chunk_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Validated grace period; falls back to the default if out of range.
    pub fn shutdown_grace(&self) -> ShutdownGrace {
        ShutdownGrace::from_millis(self.shutdown_grace_ms).unwrap_or_else(|e| {
            log::warn!(target: "dapwire::config", "{}, using default", e);
            ShutdownGrace::default()
        })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            concurrency: self.concurrency,
            supersede_serial: self.supersede_serial,
            request_timeout: self.request_timeout(),
        }
    }
}
