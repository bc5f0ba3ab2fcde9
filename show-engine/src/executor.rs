//! Executes scene actions against the bus and the local media player.

use std::sync::Arc;

use bus_gateway::topics::feedback_topic_for;
use bus_gateway::{BusGateway, RoomTopics};
use museum_scene::{Action, ActionKind};
use museum_state::FeedbackTracker;
use tokio::time::Instant;

use crate::config::FeedbackChannel;
use crate::media::{MediaCommand, MediaPlayer};

/// What happened to one action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Handed to the gateway. `tracked` is true when a feedback expectation was registered.
    Published { tracked: bool },
    /// Dropped because the gateway is disconnected
    Skipped,
    /// The gateway or the media player refused it
    Failed(String),
    /// Executed by the local media player
    Played,
}

/// Runs actions on behalf of the state machine.
///
/// Failures never propagate: a show keeps going when one device command or
/// one sound effect cannot be delivered.
pub struct ActionExecutor {
    bus: Arc<dyn BusGateway>,
    tracker: Arc<FeedbackTracker>,
    media: Arc<dyn MediaPlayer>,
    channel: FeedbackChannel,
    topics: RoomTopics,
}

impl ActionExecutor {
    pub fn new(
        bus: Arc<dyn BusGateway>,
        tracker: Arc<FeedbackTracker>,
        media: Arc<dyn MediaPlayer>,
        channel: FeedbackChannel,
        room: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            tracker,
            media,
            channel,
            topics: RoomTopics::new(room),
        }
    }

    pub fn tracker(&self) -> &Arc<FeedbackTracker> {
        &self.tracker
    }

    pub fn media(&self) -> &Arc<dyn MediaPlayer> {
        &self.media
    }

    /// Topic a command to `topic` is acknowledged on under the configured channel.
    pub fn expected_topic(&self, topic: &str) -> Option<String> {
        let per_command = feedback_topic_for(topic)?;
        match self.channel {
            FeedbackChannel::PerCommand => Some(per_command),
            FeedbackChannel::RoomStatus if self.topics.is_room_topic(topic) => {
                Some(self.topics.status_topic())
            }
            FeedbackChannel::RoomStatus => Some(per_command),
        }
    }

    /// Execute a list of actions in order.
    pub async fn execute_all(&self, actions: &[Action], now: Instant) {
        for action in actions {
            self.execute(action, now).await;
        }
    }

    pub async fn execute(&self, action: &Action, now: Instant) -> ActionOutcome {
        match action.kind {
            ActionKind::Mqtt => self.publish(action, now).await,
            kind => self.play(kind, action).await,
        }
    }

    async fn publish(&self, action: &Action, now: Instant) -> ActionOutcome {
        if !self.bus.is_connected() {
            tracing::warn!(
                "Bus disconnected, skipping {} = {}",
                action.topic,
                action.message
            );
            return ActionOutcome::Skipped;
        }

        // Registered before the publish so a fast reply cannot beat it
        let expected = self.expected_topic(&action.topic);
        let tracked = expected.as_deref().is_some_and(|expected| {
            self.tracker
                .track(&action.topic, expected, &action.message, now)
        });

        match self.bus.publish(&action.topic, &action.message).await {
            Ok(()) => {
                tracing::info!("Published {} = {}", action.topic, action.message);
                ActionOutcome::Published { tracked }
            }
            Err(e) => {
                if tracked {
                    if let Some(expected) = expected.as_deref() {
                        self.tracker.withdraw(&action.topic, expected);
                    }
                }
                tracing::error!("Failed to publish {}: {}", action.topic, e);
                ActionOutcome::Failed(e.to_string())
            }
        }
    }

    async fn play(&self, kind: ActionKind, action: &Action) -> ActionOutcome {
        let command = match MediaCommand::parse(kind, &action.message) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("{}", e);
                return ActionOutcome::Failed(e.to_string());
            }
        };
        match self.media.execute(kind, command).await {
            Ok(()) => ActionOutcome::Played,
            Err(e) => {
                tracing::error!("Media command failed: {}", e);
                ActionOutcome::Failed(e.to_string())
            }
        }
    }
}
