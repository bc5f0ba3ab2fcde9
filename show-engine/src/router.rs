//! Inbound message routing.
//!
//! Every message the gateway delivers goes through [`MessageRouter::route`]
//! exactly once. The router classifies it by topic and hands it to one of
//! three consumers, wired once at startup:
//!
//! 1. `devices/<id>/status` goes to the [`DeviceStatusSink`]
//! 2. feedback topics go to the [`FeedbackSink`], including `<room>/status`
//!    when the room acknowledges on [`FeedbackChannel::RoomStatus`]
//! 3. scene triggers and every other room topic go to the [`SceneEventSink`]
//!
//! Anything else is dropped. The router holds no show state.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bus_gateway::topics::{device_status_id, is_feedback_topic, DEVICES_PREFIX};
use bus_gateway::{InboundMessage, RoomTopics};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::FeedbackChannel;

const NAMED_SCENE_SUFFIX: &str = "/start_scene";

/// Which scene a trigger asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "scene", content = "name", rename_all = "snake_case")]
pub enum SceneTrigger {
    /// The room's default scene
    Default,
    /// A scene from the room's library, by file stem
    Named(String),
}

impl fmt::Display for SceneTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneTrigger::Default => write!(f, "default scene"),
            SceneTrigger::Named(name) => write!(f, "scene '{name}'"),
        }
    }
}

/// Scene-related input for the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneEvent {
    Trigger(SceneTrigger),
    Bus { topic: String, payload: String },
}

pub trait DeviceStatusSink: Send + Sync {
    fn device_status(&self, device_id: &str, payload: &str, retained: bool);
}

pub trait FeedbackSink: Send + Sync {
    fn feedback(&self, topic: &str, payload: &str);
}

pub trait SceneEventSink: Send + Sync {
    fn scene_trigger(&self, trigger: SceneTrigger);
    fn bus_event(&self, topic: &str, payload: &str);
}

impl SceneEventSink for mpsc::UnboundedSender<SceneEvent> {
    fn scene_trigger(&self, trigger: SceneTrigger) {
        let _ = self.send(SceneEvent::Trigger(trigger));
    }

    fn bus_event(&self, topic: &str, payload: &str) {
        let _ = self.send(SceneEvent::Bus {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
    }
}

/// Where a message was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    DeviceStatus,
    Feedback,
    SceneTrigger,
    SceneEvent,
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterCounts {
    pub device_status: u64,
    pub feedback: u64,
    pub scene_triggers: u64,
    pub scene_events: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct RouterStats {
    device_status: AtomicU64,
    feedback: AtomicU64,
    scene_triggers: AtomicU64,
    scene_events: AtomicU64,
    dropped: AtomicU64,
}

impl RouterStats {
    fn record(&self, route: Route) {
        let counter = match route {
            Route::DeviceStatus => &self.device_status,
            Route::Feedback => &self.feedback,
            Route::SceneTrigger => &self.scene_triggers,
            Route::SceneEvent => &self.scene_events,
            Route::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RouterCounts {
        RouterCounts {
            device_status: self.device_status.load(Ordering::Relaxed),
            feedback: self.feedback.load(Ordering::Relaxed),
            scene_triggers: self.scene_triggers.load(Ordering::Relaxed),
            scene_events: self.scene_events.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Classifies inbound messages by topic.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use bus_gateway::InboundMessage;
/// use show_engine::router::{
///     DeviceStatusSink, FeedbackSink, MessageRouter, Route, SceneEvent, SceneTrigger,
/// };
/// use tokio::sync::mpsc;
///
/// struct Ignore;
/// impl DeviceStatusSink for Ignore {
///     fn device_status(&self, _: &str, _: &str, _: bool) {}
/// }
/// impl FeedbackSink for Ignore {
///     fn feedback(&self, _: &str, _: &str) {}
/// }
///
/// let (tx, mut rx) = mpsc::unbounded_channel::<SceneEvent>();
/// let router = MessageRouter::new("room1", Arc::new(Ignore), Arc::new(Ignore), Arc::new(tx));
///
/// let route = router.route(&InboundMessage::new("room1/scene", "START"));
/// assert_eq!(route, Route::SceneTrigger);
/// assert_eq!(rx.try_recv().unwrap(), SceneEvent::Trigger(SceneTrigger::Default));
/// ```
pub struct MessageRouter {
    topics: RoomTopics,
    devices: Arc<dyn DeviceStatusSink>,
    feedback: Arc<dyn FeedbackSink>,
    scenes: Arc<dyn SceneEventSink>,
    channel: FeedbackChannel,
    stats: RouterStats,
}

impl MessageRouter {
    pub fn new(
        room: impl Into<String>,
        devices: Arc<dyn DeviceStatusSink>,
        feedback: Arc<dyn FeedbackSink>,
        scenes: Arc<dyn SceneEventSink>,
    ) -> Self {
        Self {
            topics: RoomTopics::new(room),
            devices,
            feedback,
            scenes,
            channel: FeedbackChannel::default(),
            stats: RouterStats::default(),
        }
    }

    /// Treat `<room>/status` as the shared acknowledgement topic.
    pub fn with_feedback_channel(mut self, channel: FeedbackChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn topics(&self) -> &RoomTopics {
        &self.topics
    }

    pub fn counts(&self) -> RouterCounts {
        self.stats.snapshot()
    }

    /// Dispatch one message. The first matching rule wins.
    pub fn route(&self, message: &InboundMessage) -> Route {
        let route = self.dispatch(message);
        self.stats.record(route);
        route
    }

    fn dispatch(&self, message: &InboundMessage) -> Route {
        let topic = message.topic.as_str();
        let payload = message.payload.as_str();

        if topic.is_empty() {
            tracing::warn!("Dropping message with empty topic");
            return Route::Dropped;
        }

        if let Some(device_id) = device_status_id(topic) {
            self.devices
                .device_status(device_id, payload, message.retained);
            return Route::DeviceStatus;
        }

        if self.is_feedback(topic) {
            self.feedback.feedback(topic, payload);
            return Route::Feedback;
        }

        let Some(local) = self.topics.strip_room(topic) else {
            tracing::debug!("Ignoring message outside room {}: {}", self.topics.room(), topic);
            return Route::Dropped;
        };

        if local == "scene" && payload.trim().eq_ignore_ascii_case("START") {
            tracing::info!("Scene trigger received on {}", topic);
            self.scenes.scene_trigger(SceneTrigger::Default);
            return Route::SceneTrigger;
        }

        if let Some(named) = self.named_scene(local, payload) {
            return match named {
                Some(name) => {
                    tracing::info!("Named scene trigger received: {}", name);
                    self.scenes.scene_trigger(SceneTrigger::Named(name));
                    Route::SceneTrigger
                }
                None => {
                    tracing::warn!("Dropping scene trigger without a name on {}", topic);
                    Route::Dropped
                }
            };
        }

        tracing::debug!("Room event: {} = {}", topic, payload);
        self.scenes.bus_event(topic, payload);
        Route::SceneEvent
    }

    fn is_feedback(&self, topic: &str) -> bool {
        if topic == self.topics.status_topic() {
            return self.channel == FeedbackChannel::RoomStatus;
        }
        if !is_feedback_topic(topic) {
            return false;
        }
        self.topics.is_room_topic(topic)
            || topic
                .strip_prefix(DEVICES_PREFIX)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// `Some(None)` marks a named-scene topic with no usable name.
    fn named_scene(&self, local: &str, payload: &str) -> Option<Option<String>> {
        let name = if local == &NAMED_SCENE_SUFFIX[1..] {
            payload.trim()
        } else {
            let name = local.strip_suffix(NAMED_SCENE_SUFFIX)?;
            if name.contains('/') {
                return None;
            }
            name
        };
        let name = name.strip_suffix(".json").unwrap_or(name).trim();
        Some((!name.is_empty()).then(|| name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;

    #[derive(Default)]
    struct Recorder {
        devices: Mutex<Vec<(String, String, bool)>>,
        feedback: Mutex<Vec<(String, String)>>,
    }

    impl DeviceStatusSink for Recorder {
        fn device_status(&self, device_id: &str, payload: &str, retained: bool) {
            self.devices
                .lock()
                .push((device_id.to_string(), payload.to_string(), retained));
        }
    }

    impl FeedbackSink for Recorder {
        fn feedback(&self, topic: &str, payload: &str) {
            self.feedback
                .lock()
                .push((topic.to_string(), payload.to_string()));
        }
    }

    fn router() -> (
        MessageRouter,
        Arc<Recorder>,
        mpsc::UnboundedReceiver<SceneEvent>,
    ) {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let router = MessageRouter::new("room1", recorder.clone(), recorder.clone(), Arc::new(tx));
        (router, recorder, rx)
    }

    #[rstest]
    #[case("devices/esp32_01/status", "online", Route::DeviceStatus)]
    #[case("room1/light/feedback", "OK", Route::Feedback)]
    #[case("room1/status", "OK", Route::SceneEvent)]
    #[case("devices/esp32_01/relay/feedback", "OK", Route::Feedback)]
    #[case("room1/scene", "start", Route::SceneTrigger)]
    #[case("room1/scene", "PAUSE", Route::SceneEvent)]
    #[case("room1/finale/start_scene", "", Route::SceneTrigger)]
    #[case("room1/start_scene", "finale.json", Route::SceneTrigger)]
    #[case("room1/start_scene", "  ", Route::Dropped)]
    #[case("room1/emergency", "STOP", Route::SceneEvent)]
    #[case("room2/emergency", "STOP", Route::Dropped)]
    #[case("devices/esp32_01/relay", "ON", Route::Dropped)]
    #[case("", "x", Route::Dropped)]
    fn test_route_priority(#[case] topic: &str, #[case] payload: &str, #[case] expected: Route) {
        let (router, _, _rx) = router();
        assert_eq!(router.route(&InboundMessage::new(topic, payload)), expected);
    }

    #[test]
    fn test_room_status_is_feedback_only_on_shared_channel() {
        let recorder = Arc::new(Recorder::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = MessageRouter::new("room1", recorder.clone(), recorder.clone(), Arc::new(tx))
            .with_feedback_channel(FeedbackChannel::RoomStatus);

        assert_eq!(
            router.route(&InboundMessage::new("room1/status", "OK")),
            Route::Feedback
        );
        assert_eq!(
            recorder.feedback.lock().as_slice(),
            &[("room1/status".to_string(), "OK".to_string())]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_room_status_reaches_scene_on_per_command_channel() {
        let (router, recorder, mut rx) = router();
        router.route(&InboundMessage::new("room1/status", "READY"));

        assert!(recorder.feedback.lock().is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            SceneEvent::Bus {
                topic: "room1/status".to_string(),
                payload: "READY".to_string()
            }
        );
    }

    #[test]
    fn test_named_scene_strips_extension() {
        let (router, _, mut rx) = router();
        router.route(&InboundMessage::new("room1/start_scene", "finale.json"));
        router.route(&InboundMessage::new("room1/intro/start_scene", "GO"));

        assert_eq!(
            rx.try_recv().unwrap(),
            SceneEvent::Trigger(SceneTrigger::Named("finale".to_string()))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SceneEvent::Trigger(SceneTrigger::Named("intro".to_string()))
        );
    }

    #[test]
    fn test_sinks_receive_payloads_and_counts() {
        let (router, recorder, mut rx) = router();
        router.route(&InboundMessage::retained("devices/esp32_01/status", "online"));
        router.route(&InboundMessage::new("room1/light/feedback", "OK"));
        router.route(&InboundMessage::new("room1/button", "PRESS"));
        router.route(&InboundMessage::new("lobby/light", "ON"));

        assert_eq!(
            recorder.devices.lock().as_slice(),
            &[("esp32_01".to_string(), "online".to_string(), true)]
        );
        assert_eq!(recorder.feedback.lock().len(), 1);
        assert_eq!(
            rx.try_recv().unwrap(),
            SceneEvent::Bus {
                topic: "room1/button".to_string(),
                payload: "PRESS".to_string()
            }
        );

        let counts = router.counts();
        assert_eq!(counts.device_status, 1);
        assert_eq!(counts.feedback, 1);
        assert_eq!(counts.scene_events, 1);
        assert_eq!(counts.dropped, 1);
    }
}
