//! Configuration for the registry and the tracker.

use std::time::Duration;

use crate::error::StateError;

/// Configuration for [`DeviceRegistry`](crate::DeviceRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Silence after which an online device is considered gone
    /// Default: 180 seconds
    pub stale_after: Duration,

    /// How often the background sweeper demotes stale devices
    /// Default: 60 seconds
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.stale_after.is_zero() {
            return Err(StateError::Configuration(
                "Device staleness window must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(StateError::Configuration(
                "Device sweep interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`FeedbackTracker`](crate::FeedbackTracker).
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// How long a device has to acknowledge a command
    /// Default: 1 second
    pub timeout: Duration,

    /// Granularity of timeout detection
    /// Default: 100 milliseconds
    pub sweep_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.timeout.is_zero() {
            return Err(StateError::Configuration(
                "Feedback timeout must be greater than 0".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() || self.sweep_interval > self.timeout {
            return Err(StateError::Configuration(
                "Feedback sweep interval must be non-zero and not exceed the timeout".to_string(),
            ));
        }
        Ok(())
    }
}
