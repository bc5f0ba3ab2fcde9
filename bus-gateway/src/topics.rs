//! Topic layout shared by the gateway, the router and the feedback tracker.
//!
//! Field devices publish presence on `devices/<id>/status` and acknowledge
//! commands on `<command topic>/feedback`. Everything scene-related lives
//! under the room prefix.

/// Suffix devices append to a command topic when acknowledging it.
pub const FEEDBACK_SUFFIX: &str = "/feedback";

/// Prefix of device presence topics.
pub const DEVICES_PREFIX: &str = "devices";

/// Last segments that address a whole group and are never acknowledged.
const CONTROL_SEGMENTS: [&str; 3] = ["STOP", "RESET", "GLOBAL"];

/// Room-scoped topics for control and scene events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomTopics {
    room: String,
}

impl RoomTopics {
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Topic filters the gateway subscribes to on every (re)connect.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{DEVICES_PREFIX}/+/status"),
            format!("{DEVICES_PREFIX}/+/+{FEEDBACK_SUFFIX}"),
            format!("{}/+/feedback", self.room),
            self.scene_topic(),
            format!("{}/#", self.room),
        ]
    }

    /// Topic that starts the room's default scene with payload `START`.
    pub fn scene_topic(&self) -> String {
        format!("{}/scene", self.room)
    }

    /// Topic that starts a scene named in the payload.
    pub fn named_scene_topic(&self) -> String {
        format!("{}/start_scene", self.room)
    }

    /// Legacy acknowledgement channel shared by older room devices.
    pub fn status_topic(&self) -> String {
        format!("{}/status", self.room)
    }

    /// Topic with the room prefix removed, if it belongs to this room.
    pub fn strip_room<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.room.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
    }

    pub fn is_room_topic(&self, topic: &str) -> bool {
        self.strip_room(topic).is_some()
    }
}

/// Device id carried by a `devices/<id>/status` topic.
pub fn device_status_id(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(DEVICES_PREFIX), Some(id), Some("status"), None) if !id.is_empty() => Some(id),
        _ => None,
    }
}

pub fn is_feedback_topic(topic: &str) -> bool {
    topic.ends_with(FEEDBACK_SUFFIX)
}

/// Command topic a feedback topic acknowledges.
pub fn original_topic_from_feedback(topic: &str) -> Option<&str> {
    topic
        .strip_suffix(FEEDBACK_SUFFIX)
        .filter(|original| !original.is_empty())
}

/// Topic on which a device acknowledges a command published to `topic`.
///
/// Room-scoped topics need at least two segments and device-scoped topics
/// (`devices/<id>/<x>`) at least three. Group control commands, local media
/// topics and feedback topics themselves get no acknowledgement.
pub fn feedback_topic_for(topic: &str) -> Option<String> {
    let parts: Vec<&str> = topic.split('/').collect();
    let last = parts.last()?;

    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    if CONTROL_SEGMENTS.contains(&last.to_ascii_uppercase().as_str()) {
        return None;
    }
    if matches!(*last, "audio" | "video" | "feedback") {
        return None;
    }

    let min_segments = if parts[0] == DEVICES_PREFIX { 3 } else { 2 };
    (parts.len() >= min_segments).then(|| format!("{topic}{FEEDBACK_SUFFIX}"))
}

/// Whether `topic` matches the MQTT filter `pattern` (`+` one level, `#` the rest).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut filter = pattern.split('/');
    let mut levels = topic.split('/');

    loop {
        match (filter.next(), levels.next()) {
            (Some("#"), _) => return filter.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(level)) if expected == level => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Reject topics that cannot be published to.
pub fn validate_publish_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("topic is empty");
    }
    if topic.contains(['+', '#']) {
        return Err("wildcards are not allowed");
    }
    if topic.contains('\0') {
        return Err("topic contains a NUL character");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_room_subscriptions() {
        let topics = RoomTopics::new("room1");
        assert_eq!(
            topics.subscriptions(),
            vec![
                "devices/+/status",
                "devices/+/+/feedback",
                "room1/+/feedback",
                "room1/scene",
                "room1/#"
            ]
        );
        assert_eq!(topics.named_scene_topic(), "room1/start_scene");
    }

    #[test]
    fn test_strip_room() {
        let topics = RoomTopics::new("room1");
        assert_eq!(topics.strip_room("room1/motor1"), Some("motor1"));
        assert_eq!(topics.strip_room("room10/motor1"), None);
        assert_eq!(topics.strip_room("room1"), None);
        assert_eq!(topics.strip_room("room1/"), None);
        assert!(!topics.is_room_topic("room2/motor1"));
    }

    #[rstest]
    #[case("devices/esp32_01/status", Some("esp32_01"))]
    #[case("devices//status", None)]
    #[case("devices/esp32_01/status/extra", None)]
    #[case("devices/esp32_01/heartbeat", None)]
    #[case("room1/esp32_01/status", None)]
    fn test_device_status_id(#[case] topic: &str, #[case] expected: Option<&str>) {
        assert_eq!(device_status_id(topic), expected);
    }

    #[rstest]
    #[case("room1/light", Some("room1/light/feedback"))]
    #[case("room1/motor1/speed", Some("room1/motor1/speed/feedback"))]
    #[case("devices/esp32_01/relay", Some("devices/esp32_01/relay/feedback"))]
    #[case("devices/esp32_01", None)]
    #[case("room1", None)]
    #[case("room1/STOP", None)]
    #[case("room1/lights/reset", None)]
    #[case("room1/GLOBAL", None)]
    #[case("room1/audio", None)]
    #[case("room1/video", None)]
    #[case("room1/light/feedback", None)]
    #[case("room1//light", None)]
    fn test_feedback_topic_for(#[case] topic: &str, #[case] expected: Option<&str>) {
        assert_eq!(feedback_topic_for(topic).as_deref(), expected);
    }

    #[test]
    fn test_original_topic_from_feedback() {
        assert_eq!(
            original_topic_from_feedback("room1/light/feedback"),
            Some("room1/light")
        );
        assert_eq!(original_topic_from_feedback("/feedback"), None);
        assert_eq!(original_topic_from_feedback("room1/light"), None);
    }

    #[rstest]
    #[case("room1/#", "room1/motor1", true)]
    #[case("room1/#", "room1/motor1/feedback", true)]
    #[case("room1/#", "room1", true)]
    #[case("room1/#", "room2/motor1", false)]
    #[case("devices/+/status", "devices/esp32_01/status", true)]
    #[case("devices/+/status", "devices/esp32_01/x/status", false)]
    #[case("room1/+/feedback", "room1/light/feedback", true)]
    #[case("room1/scene", "room1/scene", true)]
    #[case("room1/scene", "room1/scene/extra", false)]
    #[case("#", "anything/at/all", true)]
    #[case("+", "a/b", false)]
    fn test_topic_matches(#[case] pattern: &str, #[case] topic: &str, #[case] expected: bool) {
        assert_eq!(topic_matches(pattern, topic), expected);
    }

    #[test]
    fn test_validate_publish_topic() {
        assert!(validate_publish_topic("room1/light").is_ok());
        assert!(validate_publish_topic("").is_err());
        assert!(validate_publish_topic("room1/#").is_err());
        assert!(validate_publish_topic("room1/+/x").is_err());
    }
}
