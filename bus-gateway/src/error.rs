//! Error types for the bus gateway.

/// Errors surfaced by [`BusGateway`](crate::BusGateway) implementations.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The broker connection is down; the publish was not attempted
    #[error("Not connected to broker")]
    NotConnected,

    /// The topic cannot be used for publishing
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// The client rejected the publish request
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribing to a topic filter failed
    #[error("Subscribe to '{0}' failed")]
    Subscribe(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An error occurred during shutdown
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Convenience type alias for gateway results.
pub type Result<T> = std::result::Result<T, GatewayError>;
