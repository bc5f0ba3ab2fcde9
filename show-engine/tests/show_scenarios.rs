use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bus_gateway::{InboundMessage, MemoryBus};
use museum_scene::{ActionKind, SceneLibrary};
use museum_state::FeedbackOutcome;
use show_engine::{
    EngineConfig, FeedbackChannel, LoggingMediaPlayer, MediaCommand, Phase, SceneTrigger,
    ShowController, ShowEvent, ShowHandle, StopReason,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};

struct Show {
    bus: Arc<MemoryBus>,
    media: Arc<LoggingMediaPlayer>,
    handle: ShowHandle,
    events: broadcast::Receiver<ShowEvent>,
    task: JoinHandle<show_engine::Result<()>>,
}

impl Show {
    fn launch(default_scene: &str, config: EngineConfig) -> Self {
        Self::launch_with_media(default_scene, config, LoggingMediaPlayer::new())
    }

    fn launch_with_media(default_scene: &str, config: EngineConfig, media: LoggingMediaPlayer) -> Self {
        let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let library = SceneLibrary::new(fixtures, "room1", default_scene);
        let bus = Arc::new(MemoryBus::new());
        let media = Arc::new(media);

        let (controller, handle) =
            ShowController::new(config, library, bus.clone(), media.clone()).unwrap();
        let events = handle.subscribe();
        let task = tokio::spawn(controller.run());

        Self {
            bus,
            media,
            handle,
            events,
            task,
        }
    }

    /// Skip events until one matches.
    async fn wait_for(&mut self, matches: impl Fn(&ShowEvent) -> bool) -> ShowEvent {
        timeout(Duration::from_secs(120), async {
            loop {
                let event = self.events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event did not arrive")
    }

    async fn wait_for_state(&mut self, state: &str) {
        self.wait_for(|event| matches!(event, ShowEvent::StateEntered { state: s, .. } if s == state))
            .await;
    }

    async fn wait_for_stop(&mut self) -> StopReason {
        match self
            .wait_for(|event| matches!(event, ShowEvent::SceneStopped { .. }))
            .await
        {
            ShowEvent::SceneStopped { reason, .. } => reason,
            _ => unreachable!(),
        }
    }

    async fn finish(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap().unwrap();
    }
}

/// Let the controller drain its queue without moving the clock.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_audio_end_drives_intro_to_completion() {
    let mut show = Show::launch("intro", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { .. }))
        .await;

    assert_eq!(show.bus.payloads_for("room1/motor1"), vec!["ON:50:L:0"]);
    assert_eq!(
        show.media.history(),
        vec![(
            ActionKind::Audio,
            MediaCommand::Play {
                file: "welcome.mp3".to_string(),
                volume: Some(0.8)
            }
        )]
    );
    assert_eq!(show.media.preloaded(), vec!["welcome.mp3"]);

    // Only the completion of welcome.mp3 leaves the first state
    sleep(Duration::from_secs(30)).await;
    show.handle
        .media_ended(ActionKind::Audio, "ambience.mp3")
        .await
        .unwrap();
    settle().await;
    assert_eq!(show.handle.status().current_state.as_deref(), Some("start"));

    show.handle
        .media_ended(ActionKind::Audio, "welcome.mp3")
        .await
        .unwrap();
    show.wait_for_state("main_show").await;
    let entered = Instant::now();

    sleep_until(entered + Duration::from_millis(1990)).await;
    assert_eq!(show.bus.payloads_for("room1/motor1"), vec!["ON:50:L:0"]);
    sleep_until(entered + Duration::from_millis(2010)).await;
    assert_eq!(show.bus.payloads_for("room1/motor1"), vec!["ON:50:L:0", "OFF"]);

    show.wait_for_state("end").await;
    let elapsed = entered.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "left main_show after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_050), "left main_show after {elapsed:?}");

    assert_eq!(show.wait_for_stop().await, StopReason::End);
    assert_eq!(show.bus.payloads_for("room1/light"), vec!["OFF"]);

    let status = show.handle.status();
    assert_eq!(status.phase, Phase::Stopped { reason: StopReason::End });
    let visited: Vec<&str> = status.history.iter().map(|v| v.state.as_str()).collect();
    assert_eq!(visited, vec!["start", "main_show", "end"]);

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_emergency_stop_cancels_pending_timeline() {
    let mut show = Show::launch("lockdown", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    sleep(Duration::from_secs(6)).await;
    assert_eq!(show.bus.payloads_for("room1/fog"), vec!["ON"]);

    show.handle
        .deliver(InboundMessage::new("room1/emergency", "STOP"))
        .await
        .unwrap();
    assert_eq!(show.wait_for_stop().await, StopReason::End);

    sleep(Duration::from_secs(30)).await;
    assert!(show.bus.payloads_for("room1/siren").is_empty());
    assert_eq!(show.bus.payloads_for("room1/door"), vec!["LOCK"]);

    let status = show.handle.status();
    assert_eq!(status.phase, Phase::Stopped { reason: StopReason::End });
    assert_eq!(status.current_state, None);
    assert!(!show.handle.tracker().is_enabled());
    assert_eq!(status.feedback.pending, 0);

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_global_timeout_preempts_local_timeout() {
    let mut show = Show::launch("countdown", EngineConfig::default());
    let start = Instant::now();
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    assert_eq!(show.wait_for_stop().await, StopReason::End);
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(show.bus.payloads_for("room1/confetti").is_empty());

    let history = show.handle.status().history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, "wait");

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_local_button_transition() {
    let mut show = Show::launch("lockdown", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { .. }))
        .await;

    show.handle
        .deliver(InboundMessage::new("room1/button", "PRESS"))
        .await
        .unwrap();
    show.wait_for_state("release").await;
    assert_eq!(show.wait_for_stop().await, StopReason::End);
    assert_eq!(show.bus.payloads_for("room1/door"), vec!["LOCK", "UNLOCK"]);
    assert!(show.bus.payloads_for("room1/fog").is_empty());

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_trigger_while_running_is_ignored() {
    let mut show = Show::launch("intro", EngineConfig::default());
    show.handle
        .deliver(InboundMessage::new("room1/scene", "START"))
        .await
        .unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { .. }))
        .await;

    show.handle
        .deliver(InboundMessage::new("room1/lockdown/start_scene", "GO"))
        .await
        .unwrap();
    show.handle
        .deliver(InboundMessage::new("room1/scene", "START"))
        .await
        .unwrap();
    settle().await;

    let status = show.handle.status();
    assert_eq!(status.scene_id.as_deref(), Some("intro"));
    assert_eq!(status.history.len(), 1);
    assert_eq!(status.router.scene_triggers, 3);
    assert_eq!(show.bus.payloads_for("room1/motor1").len(), 1);
    assert!(show.bus.payloads_for("room1/door").is_empty());

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_scene_is_rejected_and_controller_survives() {
    let mut show = Show::launch("intro", EngineConfig::default());
    show.handle
        .start_scene(SceneTrigger::Named("nowhere".to_string()))
        .await
        .unwrap();

    let rejected = show
        .wait_for(|event| matches!(event, ShowEvent::SceneRejected { .. }))
        .await;
    assert!(matches!(
        rejected,
        ShowEvent::SceneRejected { trigger: SceneTrigger::Named(ref name), .. } if name == "nowhere"
    ));
    assert_eq!(show.handle.status().phase, Phase::NotStarted);

    show.handle
        .start_scene(SceneTrigger::Named("countdown.json".to_string()))
        .await
        .unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { scene_id, .. } if scene_id == "countdown"))
        .await;

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_bus_keeps_show_running() {
    let mut show = Show::launch("lockdown", EngineConfig::default());
    show.bus.set_connected(false);
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    show.wait_for_state("release").await;
    let status = show.handle.status();
    assert!(show.bus.published().is_empty());
    assert_eq!(status.feedback.tracked, 0);
    assert_eq!(show.wait_for_stop().await, StopReason::End);

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_room_status_acknowledgement() {
    let config = EngineConfig::new().with_feedback_channel(FeedbackChannel::RoomStatus);
    let mut show = Show::launch("intro", config);
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { .. }))
        .await;

    sleep(Duration::from_millis(300)).await;
    show.handle
        .deliver(InboundMessage::new("room1/status", "OK"))
        .await
        .unwrap();

    match show
        .wait_for(|event| matches!(event, ShowEvent::FeedbackResolved { .. }))
        .await
    {
        ShowEvent::FeedbackResolved {
            source_topic,
            latency_ms,
            outcome,
            ..
        } => {
            assert_eq!(source_topic, "room1/motor1");
            assert_eq!(outcome, FeedbackOutcome::Acknowledged);
            assert!((300..310).contains(&latency_ms), "latency {latency_ms}ms");
        }
        _ => unreachable!(),
    }

    let stats = show.handle.status().feedback;
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.timed_out, 0);
    // The run is unaffected by feedback
    assert_eq!(show.handle.status().current_state.as_deref(), Some("start"));

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_unacknowledged_command_times_out_in_background() {
    let mut show = Show::launch("intro", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    let timed_out = show
        .wait_for(|event| matches!(event, ShowEvent::FeedbackTimedOut(_)))
        .await;
    match timed_out {
        ShowEvent::FeedbackTimedOut(timeout) => {
            assert_eq!(timeout.source_topic, "room1/motor1");
            assert_eq!(timeout.expected_topic, "room1/motor1/feedback");
        }
        _ => unreachable!(),
    }
    assert_eq!(show.handle.status().current_state.as_deref(), Some("start"));

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_presence_is_reported() {
    let mut show = Show::launch("intro", EngineConfig::default());
    show.handle
        .deliver(InboundMessage::new("devices/esp32_01/status", "online"))
        .await
        .unwrap();

    match show
        .wait_for(|event| matches!(event, ShowEvent::Presence(_)))
        .await
    {
        ShowEvent::Presence(change) => assert_eq!(change.device_id, "esp32_01"),
        _ => unreachable!(),
    }

    let status = show.handle.status();
    assert_eq!(status.online_devices, vec!["esp32_01"]);
    assert_eq!(status.devices.online, 1);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["room"], "room1");
    assert_eq!(json["devices"]["online"], 1);

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_external_stop() {
    let mut show = Show::launch("lockdown", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { .. }))
        .await;

    show.handle.stop_scene().await.unwrap();
    assert_eq!(show.wait_for_stop().await, StopReason::External);

    sleep(Duration::from_secs(10)).await;
    assert!(show.bus.payloads_for("room1/fog").is_empty());

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_player_completion_drives_audio_end() {
    let media = LoggingMediaPlayer::new().with_playback_duration(Duration::from_secs(5));
    let mut show = Show::launch_with_media("intro", EngineConfig::default(), media);
    let start = Instant::now();
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    show.wait_for_state("main_show").await;
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5), "left start after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(5050), "left start after {elapsed:?}");

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_global_timeout_counts_from_scene_start() {
    let mut show = Show::launch("relay", EngineConfig::default());
    let start = Instant::now();
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    show.wait_for_state("third").await;
    assert!(start.elapsed() >= Duration::from_secs(8));
    assert_eq!(show.bus.payloads_for("room1/lamp"), vec!["ON"]);

    // Two state changes later the scene clock is still the one that ends the run
    assert_eq!(show.wait_for_stop().await, StopReason::End);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(10), "stopped after {elapsed:?}");
    assert!(elapsed < Duration::from_millis(10_050), "stopped after {elapsed:?}");

    let visited: Vec<String> = show
        .handle
        .status()
        .history
        .into_iter()
        .map(|v| v.state)
        .collect();
    assert_eq!(visited, vec!["first", "second", "third"]);

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_delay_is_rejected() {
    let mut show = Show::launch("runaway", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();

    match show
        .wait_for(|event| matches!(event, ShowEvent::SceneRejected { .. }))
        .await
    {
        ShowEvent::SceneRejected { trigger, reason } => {
            assert_eq!(trigger, SceneTrigger::Default);
            assert!(reason.contains("timing"), "{reason}");
        }
        _ => unreachable!(),
    }

    show.handle
        .start_scene(SceneTrigger::Named("countdown".to_string()))
        .await
        .unwrap();
    assert_eq!(show.wait_for_stop().await, StopReason::End);

    show.finish().await;
}

#[tokio::test(start_paused = true)]
async fn test_year_long_delays_stay_pending() {
    let mut show = Show::launch("vigil", EngineConfig::default());
    show.handle.start_scene(SceneTrigger::Default).await.unwrap();
    show.wait_for(|event| matches!(event, ShowEvent::SceneStarted { .. }))
        .await;

    sleep(Duration::from_secs(60)).await;
    let status = show.handle.status();
    assert_eq!(status.current_state.as_deref(), Some("watch"));
    assert!(show.bus.payloads_for("room1/bell").is_empty());

    show.handle
        .deliver(InboundMessage::new("room1/button", "PRESS"))
        .await
        .unwrap();
    assert_eq!(show.wait_for_stop().await, StopReason::End);

    show.finish().await;
}
