//! Configuration for the show controller.

use museum_state::{RegistryConfig, TrackerConfig};

use crate::error::EngineError;

/// Where room devices acknowledge commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedbackChannel {
    /// `<command topic>/feedback`
    #[default]
    PerCommand,
    /// One shared `<room>/status` topic for every room command
    RoomStatus,
}

/// Configuration for [`ShowController`](crate::ShowController).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Room served by this controller
    /// Default: "room1"
    pub room: String,

    /// Track device acknowledgements while a scene runs
    /// Default: true
    pub feedback_tracking: bool,

    /// Acknowledgement topic layout used by the room's devices
    /// Default: PerCommand
    pub feedback_channel: FeedbackChannel,

    /// Feedback timeout and sweep granularity
    pub tracker: TrackerConfig,

    /// Device staleness window and sweep interval
    pub registry: RegistryConfig,

    /// Capacity of the control channel
    /// Default: 256
    pub control_capacity: usize,

    /// Capacity of the show event broadcast
    /// Default: 256
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            room: "room1".to_string(),
            feedback_tracking: true,
            feedback_channel: FeedbackChannel::PerCommand,
            tracker: TrackerConfig::default(),
            registry: RegistryConfig::default(),
            control_capacity: 256,
            event_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let room = self.room.trim();
        if room.is_empty() || room.contains(['/', '+', '#']) {
            return Err(EngineError::Configuration(format!(
                "Invalid room identifier '{}'",
                self.room
            )));
        }
        if self.control_capacity == 0 || self.event_capacity == 0 {
            return Err(EngineError::Configuration(
                "Channel capacities must be greater than 0".to_string(),
            ));
        }
        self.tracker.validate()?;
        self.registry.validate()?;
        Ok(())
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = room.into();
        self
    }

    pub fn with_feedback_tracking(mut self, enabled: bool) -> Self {
        self.feedback_tracking = enabled;
        self
    }

    pub fn with_feedback_channel(mut self, channel: FeedbackChannel) -> Self {
        self.feedback_channel = channel;
        self
    }

    pub fn with_tracker(mut self, tracker: TrackerConfig) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }
}
