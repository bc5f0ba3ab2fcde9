use bus_gateway::topics::{
    device_status_id, feedback_topic_for, is_feedback_topic, original_topic_from_feedback,
    topic_matches,
};
use bus_gateway::{BusGateway, MemoryBus, RoomTopics};
use proptest::prelude::*;

fn segment() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,8}"
}

fn topic() -> impl Strategy<Value = String> {
    prop::collection::vec(segment(), 1..5).prop_map(|parts| parts.join("/"))
}

proptest! {
    #[test]
    fn prop_feedback_topic_round_trips(topic in topic()) {
        if let Some(feedback) = feedback_topic_for(&topic) {
            prop_assert!(is_feedback_topic(&feedback));
            prop_assert_eq!(original_topic_from_feedback(&feedback), Some(topic.as_str()));
            prop_assert!(feedback_topic_for(&feedback).is_none());
        }
    }

    #[test]
    fn prop_room_wildcard_covers_room_topics(room in segment(), rest in topic()) {
        let topics = RoomTopics::new(room.clone());
        let full = format!("{}/{}", room, rest);
        let pattern = format!("{}/#", room);
        prop_assert!(topic_matches(&pattern, &full));
        prop_assert!(topics.is_room_topic(&full));
        prop_assert_eq!(topics.strip_room(&full), Some(rest.as_str()));
    }

    #[test]
    fn prop_exact_filter_matches_only_itself(a in topic(), b in topic()) {
        prop_assert!(topic_matches(&a, &a));
        prop_assert_eq!(topic_matches(&a, &b), a == b);
    }
}

#[test]
fn test_every_subscription_filter_is_reachable() {
    let topics = RoomTopics::new("room1");
    let samples = [
        "devices/esp32_01/status",
        "devices/esp32_01/relay/feedback",
        "room1/light/feedback",
        "room1/scene",
        "room1/motor1",
    ];
    for (filter, sample) in topics.subscriptions().iter().zip(samples) {
        assert!(topic_matches(filter, sample), "{filter} !~ {sample}");
    }
    assert_eq!(device_status_id(samples[0]), Some("esp32_01"));
}

#[tokio::test]
async fn test_memory_bus_delivers_device_feedback_loop() {
    let bus = MemoryBus::new();
    let mut feedback = bus.subscribe("room1/+/feedback");

    bus.publish("room1/light", "ON").await.unwrap();
    let expected = feedback_topic_for("room1/light").unwrap();
    bus.publish(&expected, "OK").await.unwrap();

    let message = feedback.recv().await.unwrap();
    assert_eq!(message.topic, "room1/light/feedback");
    assert_eq!(message.payload, "OK");
    assert!(!message.retained);
}
