//! # museum-bus
//!
//! Transport gateway between the show controller and the field bus.
//!
//! The controller never talks to the broker directly. It publishes through the
//! [`BusGateway`] trait and receives every inbound message as an
//! [`InboundMessage`] on a single channel handed to the gateway at startup.
//!
//! Two implementations are provided:
//!
//! - [`MqttGateway`]: an MQTT client that keeps the room subscriptions alive
//!   across reconnects, backing off exponentially and reporting a
//!   [`GatewayFatal`] once the broker has been unreachable for too long.
//! - [`MemoryBus`]: an in-process bus that records publishes, used for tests
//!   and dry runs without a broker.
//!
//! ```rust,ignore
//! use bus_gateway::{BusGateway, GatewayConfig, MqttGateway};
//! use tokio::sync::mpsc;
//!
//! let config = GatewayConfig::new().with_broker("broker.lan", 1883).with_room("room1");
//! let (inbound_tx, mut inbound_rx) = mpsc::channel(config.inbound_capacity);
//! let (gateway, handle) = MqttGateway::connect(config, inbound_tx)?;
//!
//! gateway.publish("room1/light", "ON").await?;
//! while let Some(message) = inbound_rx.recv().await {
//!     println!("{message}");
//! }
//! handle.shutdown().await?;
//! ```

use async_trait::async_trait;

pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod mqtt;
pub mod topics;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use memory::{MemoryBus, PublishedMessage};
pub use message::InboundMessage;
pub use mqtt::{wait_for_fatal, GatewayFatal, GatewayHandle, LinkState, MqttGateway};
pub use topics::RoomTopics;

/// Outbound half of the bus contract.
///
/// Delivery is at-least-once. Implementations fail fast with
/// [`GatewayError::NotConnected`] while the connection is down instead of
/// queueing commands for later.
#[async_trait]
pub trait BusGateway: Send + Sync {
    /// Publish a non-retained message.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Whether the broker connection is currently up.
    fn is_connected(&self) -> bool;
}
