//! Configuration for the MQTT gateway
//!
//! Controls the broker endpoint, the room whose topics are subscribed, and the
//! reconnect policy applied when the connection drops.

use std::time::Duration;

use crate::error::GatewayError;

/// Configuration for [`MqttGateway`](crate::MqttGateway).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Broker host name or address
    /// Default: "localhost"
    pub host: String,

    /// Broker TCP port
    /// Default: 1883
    pub port: u16,

    /// MQTT client identifier; must be unique per broker
    /// Default: "museum-controller"
    pub client_id: String,

    /// Room whose topics are subscribed
    /// Default: "room1"
    pub room: String,

    /// MQTT keep-alive interval
    /// Default: 60 seconds
    pub keep_alive: Duration,

    /// First delay after a connection failure; doubles per consecutive failure
    /// Default: 2 seconds
    pub backoff_base: Duration,

    /// Upper bound for the reconnect delay
    /// Default: 60 seconds
    pub backoff_max: Duration,

    /// Consecutive connection failures tolerated before the gateway gives up
    /// Default: 10
    pub max_consecutive_failures: u32,

    /// Capacity of the client request queue
    /// Default: 64
    pub request_capacity: usize,

    /// Capacity of the inbound message channel
    /// Default: 1000
    pub inbound_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "museum-controller".to_string(),
            room: "room1".to_string(),
            keep_alive: Duration::from_secs(60),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            max_consecutive_failures: 10,
            request_capacity: 64,
            inbound_capacity: 1000,
        }
    }
}

impl GatewayConfig {
    /// Create a GatewayConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a broker on the same host, reconnecting quickly
    pub fn local(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Reconnect delay after `failures` consecutive connection failures.
    ///
    /// `min(base * 2^min(failures - 1, 6), max)`; zero failures yields zero.
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(6);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.host.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "Broker host must not be empty".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(GatewayError::Configuration(
                "Broker port must be greater than 0".to_string(),
            ));
        }

        if self.client_id.trim().is_empty() {
            return Err(GatewayError::Configuration(
                "Client id must not be empty".to_string(),
            ));
        }

        let room = self.room.trim();
        if room.is_empty() || room.contains(['/', '+', '#']) {
            return Err(GatewayError::Configuration(format!(
                "Invalid room identifier '{}': must be a single topic segment",
                self.room
            )));
        }

        if self.backoff_base.is_zero() || self.backoff_base > self.backoff_max {
            return Err(GatewayError::Configuration(
                "Invalid backoff: base must be non-zero and not exceed max".to_string(),
            ));
        }

        if self.max_consecutive_failures == 0 {
            return Err(GatewayError::Configuration(
                "Max consecutive failures must be greater than 0".to_string(),
            ));
        }

        if self.request_capacity == 0 || self.inbound_capacity == 0 {
            return Err(GatewayError::Configuration(
                "Channel capacities must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    // Builder methods

    pub fn with_broker(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    pub fn with_inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }
}
