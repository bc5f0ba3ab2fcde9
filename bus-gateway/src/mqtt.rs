//! MQTT implementation of the gateway.
//!
//! A background driver task owns the rumqttc event loop. It re-subscribes the
//! room topics on every ConnAck, forwards inbound publishes to the inbound
//! channel, and backs off between reconnect attempts. After
//! `max_consecutive_failures` failed attempts in a row it gives up and
//! publishes [`LinkState::Failed`] so the process can exit and be restarted by
//! its supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::message::InboundMessage;
use crate::topics::{validate_publish_topic, RoomTopics};
use crate::BusGateway;

/// Reported once the gateway stops retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayFatal {
    pub consecutive_failures: u32,
    pub last_error: String,
}

impl std::fmt::Display for GatewayFatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "broker unreachable after {} consecutive failures (last error: {})",
            self.consecutive_failures, self.last_error
        )
    }
}

/// Connection lifecycle as observed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    /// Waiting before the next attempt
    Reconnecting { failures: u32, delay: Duration },
    /// Retries exhausted; the driver has stopped
    Failed(GatewayFatal),
    /// Stopped by [`GatewayHandle::shutdown`]
    Stopped,
}

/// Publishing side of the MQTT connection.
pub struct MqttGateway {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
}

/// Owner of the driver task. Dropping it stops the driver.
pub struct GatewayHandle {
    driver: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    state_rx: watch::Receiver<LinkState>,
}

impl MqttGateway {
    /// Start the driver task and return the publishing half with its handle.
    ///
    /// Must be called from within a tokio runtime. The connection is
    /// established in the background; publishes fail with
    /// [`GatewayError::NotConnected`] until the first ConnAck.
    pub fn connect(
        config: GatewayConfig,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(Arc<Self>, GatewayHandle)> {
        config.validate()?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        tracing::info!(
            "Connecting to MQTT broker {}:{} as '{}' (room {})",
            config.host,
            config.port,
            config.client_id,
            config.room
        );

        let driver = Driver {
            client: client.clone(),
            eventloop,
            connected: Arc::clone(&connected),
            topics: RoomTopics::new(config.room.clone()),
            config,
            inbound_tx,
            state_tx,
            failures: 0,
        };
        let task = tokio::spawn(driver.run(shutdown_rx));

        let gateway = Arc::new(Self { client, connected });
        let handle = GatewayHandle {
            driver: Some(task),
            shutdown_tx: Some(shutdown_tx),
            state_rx,
        };
        Ok((gateway, handle))
    }
}

#[async_trait]
impl BusGateway for MqttGateway {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(GatewayError::NotConnected);
        }
        validate_publish_topic(topic).map_err(|reason| GatewayError::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        })?;

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| GatewayError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!("Published {} = {}", topic, payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl GatewayHandle {
    /// Current link state.
    pub fn state(&self) -> LinkState {
        self.state_rx.borrow().clone()
    }

    /// Receiver for link state changes.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Resolve once the driver gives up; `None` if it stopped for any other reason.
    pub async fn fatal(&self) -> Option<GatewayFatal> {
        let mut state_rx = self.state_rx.clone();
        wait_for_fatal(&mut state_rx).await
    }

    /// Disconnect from the broker and wait up to 5 seconds for the driver to stop.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        if let Some(task) = self.driver.take() {
            match timeout(Duration::from_secs(5), task).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(GatewayError::Shutdown(format!(
                    "MQTT driver task panicked: {e}"
                ))),
                Err(_) => Err(GatewayError::Shutdown(
                    "MQTT driver shutdown timed out after 5 seconds".to_string(),
                )),
            }
        } else {
            Ok(())
        }
    }
}

/// Wait on a link state receiver until the gateway fails or stops.
pub async fn wait_for_fatal(state_rx: &mut watch::Receiver<LinkState>) -> Option<GatewayFatal> {
    loop {
        match &*state_rx.borrow_and_update() {
            LinkState::Failed(fatal) => return Some(fatal.clone()),
            LinkState::Stopped => return None,
            _ => {}
        }
        if state_rx.changed().await.is_err() {
            return None;
        }
    }
}

struct Driver {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    topics: RoomTopics,
    config: GatewayConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
    state_tx: watch::Sender<LinkState>,
    failures: u32,
}

enum Flow {
    Continue,
    Backoff(Duration),
    Stop(LinkState),
}

impl Driver {
    async fn run(mut self, mut shutdown_rx: mpsc::Receiver<()>) {
        let final_state = loop {
            let polled = tokio::select! {
                _ = shutdown_rx.recv() => {
                    self.disconnect().await;
                    break LinkState::Stopped;
                }
                polled = self.eventloop.poll() => polled,
            };

            let flow = match polled {
                Ok(event) => self.handle_event(event).await,
                Err(e) => self.handle_connection_error(e.to_string()),
            };

            match flow {
                Flow::Continue => {}
                Flow::Backoff(delay) => {
                    tokio::select! {
                        _ = shutdown_rx.recv() => break LinkState::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Flow::Stop(state) => break state,
            }
        };

        self.connected.store(false, Ordering::SeqCst);
        if let LinkState::Failed(fatal) = &final_state {
            tracing::error!("MQTT gateway giving up: {}", fatal);
        } else {
            tracing::info!("MQTT gateway stopped");
        }
        let _ = self.state_tx.send(final_state);
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                self.on_connected();
                Flow::Continue
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let payload = match String::from_utf8(publish.payload.to_vec()) {
                    Ok(payload) => payload,
                    Err(_) => {
                        tracing::warn!(
                            "Dropping non-UTF-8 payload on {} ({} bytes)",
                            publish.topic,
                            publish.payload.len()
                        );
                        return Flow::Continue;
                    }
                };
                let message = InboundMessage {
                    topic: publish.topic,
                    payload,
                    retained: publish.retain,
                };
                tracing::trace!("Inbound {}", message);
                if self.inbound_tx.send(message).await.is_err() {
                    tracing::warn!("Inbound channel closed, stopping MQTT driver");
                    self.disconnect().await;
                    return Flow::Stop(LinkState::Stopped);
                }
                Flow::Continue
            }
            Event::Incoming(Packet::Disconnect) => {
                tracing::warn!("Broker sent DISCONNECT");
                self.connected.store(false, Ordering::SeqCst);
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn on_connected(&mut self) {
        if self.failures > 0 {
            tracing::info!(
                "MQTT connection restored after {} failed attempt(s)",
                self.failures
            );
        } else {
            tracing::info!("MQTT connected");
        }
        self.failures = 0;
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.state_tx.send(LinkState::Connected);

        // try_subscribe: the event loop is polled by this task, so awaiting
        // the request queue here could deadlock
        for filter in self.topics.subscriptions() {
            match self.client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                Ok(()) => tracing::debug!("Subscribed to {}", filter),
                Err(e) => tracing::error!("Failed to subscribe to {}: {}", filter, e),
            }
        }
    }

    fn handle_connection_error(&mut self, error: String) -> Flow {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        self.failures += 1;

        if was_connected {
            tracing::warn!("MQTT connection lost: {}", error);
        }

        if self.failures >= self.config.max_consecutive_failures {
            return Flow::Stop(LinkState::Failed(GatewayFatal {
                consecutive_failures: self.failures,
                last_error: error,
            }));
        }

        let delay = self.config.backoff_delay(self.failures);
        tracing::warn!(
            "MQTT connection attempt {} failed: {}; retrying in {:?}",
            self.failures,
            error,
            delay
        );
        let _ = self.state_tx.send(LinkState::Reconnecting {
            failures: self.failures,
            delay,
        });
        Flow::Backoff(delay)
    }

    async fn disconnect(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        if self.client.try_disconnect().is_err() {
            return;
        }
        // Drive the loop until the DISCONNECT packet is written
        let _ = timeout(Duration::from_secs(1), async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}
