//! The show controller event loop.
//!
//! [`ShowController::run`] is the single place where the scene state machine
//! is evaluated. Inbound messages and operator commands arrive as
//! [`ControlEvent`]s on one channel, and the media player reports finished
//! playback on its own; time-based rules are driven by sleeping until the
//! machine's next deadline. Device presence and feedback
//! are handled by their own components and only reported through
//! [`ShowEvent`]s.

use std::sync::Arc;

use bus_gateway::{BusGateway, InboundMessage};
use chrono::{DateTime, Utc};
use museum_scene::{ActionKind, Scene, SceneLibrary, Target};
use museum_state::{
    DeviceRegistry, DeviceSummary, FeedbackOutcome, FeedbackStats, FeedbackTimeout,
    FeedbackTracker, PresenceChange, Sweeper,
};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::ActionExecutor;
use crate::global::Trigger;
use crate::machine::{Phase, SceneMachine, StepReport, StopReason, VisitedState};
use crate::media::{MediaFinished, MediaPlayer};
use crate::router::{
    DeviceStatusSink, FeedbackSink, MessageRouter, RouterCounts, SceneEvent, SceneTrigger,
};

/// Input to the controller loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// A message delivered by the gateway
    Bus(InboundMessage),
    /// Local playback finished
    MediaEnded { kind: ActionKind, file: String },
    StartScene(SceneTrigger),
    StopScene,
    Shutdown,
}

/// Observable show activity, for dashboards and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ShowEvent {
    SceneStarted {
        scene_id: String,
        state: String,
    },
    StateEntered {
        scene_id: String,
        from: String,
        state: String,
    },
    SceneStopped {
        scene_id: String,
        reason: StopReason,
    },
    SceneRejected {
        trigger: SceneTrigger,
        reason: String,
    },
    Presence(PresenceChange),
    FeedbackResolved {
        source_topic: String,
        command: String,
        latency_ms: u64,
        outcome: FeedbackOutcome,
    },
    FeedbackTimedOut(FeedbackTimeout),
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Serialize)]
pub struct ShowStatus {
    pub room: String,
    pub phase: Phase,
    pub scene_id: Option<String>,
    pub current_state: Option<String>,
    pub history: Vec<VisitedState>,
    pub devices: DeviceSummary,
    pub online_devices: Vec<String>,
    pub feedback: FeedbackStats,
    pub router: RouterCounts,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct MachineSnapshot {
    phase: Phase,
    scene_id: Option<String>,
    current_state: Option<String>,
    history: Vec<VisitedState>,
    updated_at: DateTime<Utc>,
}

impl Default for MachineSnapshot {
    fn default() -> Self {
        Self {
            phase: Phase::NotStarted,
            scene_id: None,
            current_state: None,
            history: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

struct RegistrySink {
    registry: Arc<DeviceRegistry>,
    events: broadcast::Sender<ShowEvent>,
}

impl DeviceStatusSink for RegistrySink {
    fn device_status(&self, device_id: &str, payload: &str, retained: bool) {
        if let Some(change) = self
            .registry
            .update(device_id, payload, retained, Instant::now())
        {
            let _ = self.events.send(ShowEvent::Presence(change));
        }
    }
}

struct TrackerSink {
    tracker: Arc<FeedbackTracker>,
    events: broadcast::Sender<ShowEvent>,
}

impl FeedbackSink for TrackerSink {
    fn feedback(&self, topic: &str, payload: &str) {
        if let Some(resolution) = self.tracker.handle(topic, payload, Instant::now()) {
            let _ = self.events.send(ShowEvent::FeedbackResolved {
                source_topic: resolution.source_topic,
                command: resolution.command,
                latency_ms: resolution.latency.as_millis() as u64,
                outcome: resolution.outcome,
            });
        }
    }
}

/// Owns the state machine and serializes every evaluation.
pub struct ShowController {
    config: EngineConfig,
    library: SceneLibrary,
    machine: SceneMachine,
    router: Arc<MessageRouter>,
    registry: Arc<DeviceRegistry>,
    tracker: Arc<FeedbackTracker>,
    control_rx: mpsc::Receiver<ControlEvent>,
    scene_rx: mpsc::UnboundedReceiver<SceneEvent>,
    media_rx: mpsc::UnboundedReceiver<MediaFinished>,
    events: broadcast::Sender<ShowEvent>,
    snapshot: Arc<RwLock<MachineSnapshot>>,
}

/// Cloneable remote control for a running [`ShowController`].
#[derive(Clone)]
pub struct ShowHandle {
    room: String,
    control_tx: mpsc::Sender<ControlEvent>,
    events: broadcast::Sender<ShowEvent>,
    snapshot: Arc<RwLock<MachineSnapshot>>,
    registry: Arc<DeviceRegistry>,
    tracker: Arc<FeedbackTracker>,
    router: Arc<MessageRouter>,
}

impl ShowController {
    /// Build a controller and its handle. Nothing runs until [`run`](Self::run).
    pub fn new(
        config: EngineConfig,
        library: SceneLibrary,
        bus: Arc<dyn BusGateway>,
        media: Arc<dyn MediaPlayer>,
    ) -> Result<(Self, ShowHandle)> {
        config.validate()?;

        let tracker = Arc::new(FeedbackTracker::new(config.tracker.clone()));
        let registry = Arc::new(DeviceRegistry::new(config.registry.clone()));
        let (control_tx, control_rx) = mpsc::channel(config.control_capacity);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (scene_tx, scene_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        media.set_completion_sender(media_tx);

        let router = Arc::new(MessageRouter::new(
            config.room.clone(),
            Arc::new(RegistrySink {
                registry: Arc::clone(&registry),
                events: events.clone(),
            }),
            Arc::new(TrackerSink {
                tracker: Arc::clone(&tracker),
                events: events.clone(),
            }),
            Arc::new(scene_tx),
        )
        .with_feedback_channel(config.feedback_channel));

        let executor = ActionExecutor::new(
            bus,
            Arc::clone(&tracker),
            media,
            config.feedback_channel,
            config.room.clone(),
        );
        let machine = SceneMachine::new(executor, config.feedback_tracking);
        let snapshot = Arc::new(RwLock::new(MachineSnapshot::default()));

        let handle = ShowHandle {
            room: config.room.clone(),
            control_tx,
            events: events.clone(),
            snapshot: Arc::clone(&snapshot),
            registry: Arc::clone(&registry),
            tracker: Arc::clone(&tracker),
            router: Arc::clone(&router),
        };

        let controller = Self {
            config,
            library,
            machine,
            router,
            registry,
            tracker,
            control_rx,
            scene_rx,
            media_rx,
            events,
            snapshot,
        };
        Ok((controller, handle))
    }

    /// Run until [`ShowHandle::shutdown`] is called or every handle is dropped.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            "Show controller running for room {} (scenes in {})",
            self.config.room,
            self.library.room_dir().display()
        );

        let feedback_sweeper = {
            let tracker = Arc::clone(&self.tracker);
            let events = self.events.clone();
            Sweeper::start("feedback", self.config.tracker.sweep_interval, move |now| {
                for timeout in tracker.sweep(now) {
                    let _ = events.send(ShowEvent::FeedbackTimedOut(timeout));
                }
            })
        };
        let device_sweeper = {
            let registry = Arc::clone(&self.registry);
            let events = self.events.clone();
            Sweeper::start("device", self.config.registry.sweep_interval, move |now| {
                for change in registry.sweep(now) {
                    let _ = events.send(ShowEvent::Presence(change));
                }
            })
        };

        loop {
            let deadline = self.machine.next_deadline();
            tokio::select! {
                biased;

                event = self.control_rx.recv() => {
                    let event = event.unwrap_or(ControlEvent::Shutdown);
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                Some(MediaFinished { kind, file }) = self.media_rx.recv() => {
                    self.handle_event(ControlEvent::MediaEnded { kind, file }).await;
                }
                _ = wait_until(deadline) => {
                    let report = self.machine.step(&Trigger::Tick, Instant::now()).await;
                    self.after_step(report);
                }
            }
        }

        tracing::info!("Show controller shutting down");
        if self.machine.is_running() {
            self.machine.stop(StopReason::Shutdown, Instant::now()).await;
            self.announce_stop();
        }
        self.refresh_snapshot();

        let feedback_result = feedback_sweeper.shutdown().await;
        let device_result = device_sweeper.shutdown().await;
        feedback_result?;
        device_result?;
        Ok(())
    }

    /// Returns false when the loop should exit.
    async fn handle_event(&mut self, event: ControlEvent) -> bool {
        match event {
            ControlEvent::Bus(message) => {
                self.router.route(&message);
                while let Ok(scene_event) = self.scene_rx.try_recv() {
                    match scene_event {
                        SceneEvent::Trigger(trigger) => self.start_scene(trigger).await,
                        SceneEvent::Bus { topic, payload } => {
                            self.step(Trigger::Bus { topic, payload }).await
                        }
                    }
                }
            }
            ControlEvent::MediaEnded { kind, file } => {
                tracing::debug!("{} playback ended: {}", kind, file);
                self.step(Trigger::MediaEnded { kind, file }).await;
            }
            ControlEvent::StartScene(trigger) => self.start_scene(trigger).await,
            ControlEvent::StopScene => {
                if self.machine.is_running() {
                    self.machine.stop(StopReason::External, Instant::now()).await;
                    self.announce_stop();
                } else {
                    tracing::debug!("Stop requested with no scene running");
                }
            }
            ControlEvent::Shutdown => return false,
        }
        self.refresh_snapshot();
        true
    }

    async fn step(&mut self, trigger: Trigger) {
        if !self.machine.is_running() {
            tracing::debug!("No scene running, ignoring {}", trigger);
            return;
        }
        let report = self.machine.step(&trigger, Instant::now()).await;
        self.after_step(report);
    }

    async fn start_scene(&mut self, trigger: SceneTrigger) {
        if let Some(scene) = self.machine.scene().filter(|_| self.machine.is_running()) {
            tracing::info!(
                "Ignoring {} trigger: scene '{}' is already running",
                trigger,
                scene.id
            );
            return;
        }

        let loaded = match &trigger {
            SceneTrigger::Default => self.library.load_default(),
            SceneTrigger::Named(name) => self.library.load_named(name),
        };
        let scene = match loaded {
            Ok(scene) => Arc::new(scene),
            Err(e) => {
                self.reject(trigger, e.into());
                return;
            }
        };

        let files = scene.media_files();
        if !files.is_empty() {
            if let Err(e) = self.machine.executor().media().preload(&files).await {
                tracing::warn!("Media preload failed for '{}': {}", scene.id, e);
            }
        }

        match self.machine.start(Arc::clone(&scene), Instant::now()).await {
            Ok(()) => {
                let _ = self.events.send(ShowEvent::SceneStarted {
                    scene_id: scene.id.clone(),
                    state: scene.initial_state.clone(),
                });
            }
            Err(e) => self.reject(trigger, e),
        }
    }

    fn reject(&self, trigger: SceneTrigger, error: EngineError) {
        tracing::error!("Cannot start {}: {}", trigger, error);
        let _ = self.events.send(ShowEvent::SceneRejected {
            trigger,
            reason: error.to_string(),
        });
    }

    fn after_step(&mut self, report: StepReport) {
        let Some(transition) = report.transition else {
            return;
        };
        match transition.to {
            Target::End => self.announce_stop(),
            Target::State(state) => {
                let scene_id = self.scene_id().unwrap_or_default();
                let _ = self.events.send(ShowEvent::StateEntered {
                    scene_id,
                    from: transition.from,
                    state,
                });
            }
        }
        self.refresh_snapshot();
    }

    fn announce_stop(&self) {
        let Phase::Stopped { reason } = self.machine.phase() else {
            return;
        };
        let _ = self.events.send(ShowEvent::SceneStopped {
            scene_id: self.scene_id().unwrap_or_default(),
            reason: *reason,
        });
    }

    fn scene_id(&self) -> Option<String> {
        self.machine.scene().map(|scene: &Arc<Scene>| scene.id.clone())
    }

    fn refresh_snapshot(&self) {
        let mut snapshot = self.snapshot.write();
        snapshot.phase = self.machine.phase().clone();
        snapshot.scene_id = self.scene_id();
        snapshot.current_state = self.machine.current_state().map(str::to_string);
        snapshot.history = self.machine.history().to_vec();
        snapshot.updated_at = Utc::now();
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ShowHandle {
    pub fn room(&self) -> &str {
        &self.room
    }

    pub async fn send(&self, event: ControlEvent) -> Result<()> {
        self.control_tx
            .send(event)
            .await
            .map_err(|_| EngineError::ControllerClosed)
    }

    pub async fn start_scene(&self, trigger: SceneTrigger) -> Result<()> {
        self.send(ControlEvent::StartScene(trigger)).await
    }

    pub async fn stop_scene(&self) -> Result<()> {
        self.send(ControlEvent::StopScene).await
    }

    /// Report that local playback of `file` finished.
    pub async fn media_ended(&self, kind: ActionKind, file: impl Into<String>) -> Result<()> {
        self.send(ControlEvent::MediaEnded {
            kind,
            file: file.into(),
        })
        .await
    }

    /// Feed one inbound message into the controller.
    pub async fn deliver(&self, message: InboundMessage) -> Result<()> {
        self.send(ControlEvent::Bus(message)).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(ControlEvent::Shutdown).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShowEvent> {
        self.events.subscribe()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<FeedbackTracker> {
        &self.tracker
    }

    pub fn status(&self) -> ShowStatus {
        let snapshot = self.snapshot.read().clone();
        ShowStatus {
            room: self.room.clone(),
            phase: snapshot.phase,
            scene_id: snapshot.scene_id,
            current_state: snapshot.current_state,
            history: snapshot.history,
            devices: self.registry.summary(),
            online_devices: self.registry.list_online(),
            feedback: self.tracker.stats(),
            router: self.router.counts(),
            updated_at: snapshot.updated_at,
        }
    }

    /// Forward everything the gateway receives until either side closes.
    pub fn forward_inbound(&self, mut inbound_rx: mpsc::Receiver<InboundMessage>) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound_rx.recv().await {
                if handle.deliver(message).await.is_err() {
                    break;
                }
            }
            tracing::debug!("Inbound forwarding stopped");
        })
    }
}
