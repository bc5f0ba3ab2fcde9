//! Scene state machine.
//!
//! One [`SceneMachine`] runs at most one scene at a time. Every evaluation goes
//! through [`SceneMachine::step`], which applies rules in a fixed order:
//!
//! 1. global events, in declaration order
//! 2. timeline actions of the current state that are due
//! 3. local transitions of the current state, in declaration order
//!
//! At most one transition is applied per step. Timeline actions are not
//! transitions, so a due timeline action and a satisfied local transition can
//! both happen in the same step (the action first).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use museum_scene::{Condition, Scene, Target, Transition};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{EngineError, Result};
use crate::executor::ActionExecutor;
use crate::global::{condition_matches, GlobalEvaluator, Trigger};
use crate::timeline::Timeline;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A transition reached `END`
    End,
    /// Stopped on request
    External,
    /// The controller is shutting down
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::End => write!(f, "end"),
            StopReason::External => write!(f, "external stop"),
            StopReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    Running { state: String },
    Stopped { reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionScope {
    Global,
    Local,
}

/// A transition that was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    pub from: String,
    pub to: Target,
    pub scope: TransitionScope,
    pub condition: String,
}

/// Result of one [`SceneMachine::step`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Timeline actions executed
    pub fired: usize,
    pub transition: Option<TransitionReport>,
}

/// A state entered during the current or last run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitedState {
    pub state: String,
    pub entered_at: DateTime<Utc>,
}

pub struct SceneMachine {
    executor: ActionExecutor,
    track_feedback: bool,
    scene: Option<Arc<Scene>>,
    phase: Phase,
    timeline: Timeline,
    globals: GlobalEvaluator,
    started_at: Option<Instant>,
    entered_at: Option<Instant>,
    history: Vec<VisitedState>,
}

impl SceneMachine {
    pub fn new(executor: ActionExecutor, track_feedback: bool) -> Self {
        Self {
            executor,
            track_feedback,
            scene: None,
            phase: Phase::NotStarted,
            timeline: Timeline::new(),
            globals: GlobalEvaluator::new(),
            started_at: None,
            entered_at: None,
            history: Vec::new(),
        }
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    /// Scene of the current or last run.
    pub fn scene(&self) -> Option<&Arc<Scene>> {
        self.scene.as_ref()
    }

    pub fn current_state(&self) -> Option<&str> {
        match &self.phase {
            Phase::Running { state } => Some(state),
            _ => None,
        }
    }

    pub fn history(&self) -> &[VisitedState] {
        &self.history
    }

    /// Time spent in the current state.
    pub fn state_elapsed(&self, now: Instant) -> Option<Duration> {
        self.entered_at
            .filter(|_| self.is_running())
            .map(|entered| now.saturating_duration_since(entered))
    }

    /// Begin a run in the scene's initial state.
    pub async fn start(&mut self, scene: Arc<Scene>, now: Instant) -> Result<()> {
        if let Some(current) = self.scene.as_ref().filter(|_| self.is_running()) {
            return Err(EngineError::AlreadyRunning(current.id.clone()));
        }
        if !scene.is_runnable() {
            return Err(EngineError::NotRunnable(scene.id.clone()));
        }

        tracing::info!(
            "Starting scene '{}' (v{}) in state '{}'",
            scene.id,
            scene.version,
            scene.initial_state
        );
        self.globals.reset();
        self.history.clear();
        self.started_at = Some(now);
        self.scene = Some(Arc::clone(&scene));
        if self.track_feedback {
            self.executor.tracker().enable();
        }

        let initial = scene.initial_state.clone();
        self.enter(&scene, &initial, now).await;
        Ok(())
    }

    /// Evaluate the running scene against one trigger.
    pub async fn step(&mut self, trigger: &Trigger, now: Instant) -> StepReport {
        let mut report = StepReport::default();
        let (Some(scene), Some(started_at)) = (self.scene.clone(), self.started_at) else {
            return report;
        };
        let Some(current) = self.current_state().map(str::to_string) else {
            return report;
        };

        let scene_elapsed = now.saturating_duration_since(started_at);
        if let Some(transition) =
            self.globals
                .evaluate(&scene.global_events, trigger, scene_elapsed)
        {
            let transition = transition.clone();
            report.transition = Some(
                self.apply(&scene, &current, &transition, TransitionScope::Global, now)
                    .await,
            );
            return report;
        }

        report.fired = self.timeline.fire_due(now, &self.executor).await;

        let state_elapsed = self.state_elapsed(now).unwrap_or_default();
        let local = scene.state(&current).and_then(|state| {
            state
                .transitions
                .iter()
                .find(|transition| condition_matches(&transition.condition, trigger, state_elapsed))
                .cloned()
        });
        if let Some(transition) = local {
            report.transition = Some(
                self.apply(&scene, &current, &transition, TransitionScope::Local, now)
                    .await,
            );
        }
        report
    }

    /// Abort the run from outside.
    pub async fn stop(&mut self, reason: StopReason, now: Instant) {
        if !self.is_running() {
            return;
        }
        self.timeline.cancel(now, &self.executor).await;
        self.finish(reason);
    }

    /// Earliest instant at which a time-based rule becomes due.
    pub fn next_deadline(&self) -> Option<Instant> {
        let (Some(scene), Some(started_at), Some(entered_at)) =
            (self.scene.as_ref(), self.started_at, self.entered_at)
        else {
            return None;
        };
        let current = self.current_state()?;

        let local = scene.state(current).into_iter().flat_map(|state| {
            state
                .transitions
                .iter()
                .filter_map(move |transition| match transition.condition {
                    Condition::Timeout { delay } => entered_at.checked_add(delay),
                    Condition::Always => Some(entered_at),
                    _ => None,
                })
        });

        local
            .chain(self.timeline.next_deadline())
            .chain(self.globals.next_deadline(&scene.global_events, started_at))
            .min()
    }

    async fn apply(
        &mut self,
        scene: &Scene,
        from: &str,
        transition: &Transition,
        scope: TransitionScope,
        now: Instant,
    ) -> TransitionReport {
        tracing::info!(
            "Transition {} -> {} ({:?}: {})",
            from,
            transition.goto,
            scope,
            transition.condition
        );
        self.timeline.cancel(now, &self.executor).await;

        match &transition.goto {
            Target::End => self.finish(StopReason::End),
            Target::State(name) => self.enter(scene, name, now).await,
        }

        TransitionReport {
            from: from.to_string(),
            to: transition.goto.clone(),
            scope,
            condition: transition.condition.to_string(),
        }
    }

    async fn enter(&mut self, scene: &Scene, name: &str, now: Instant) {
        let Some(state) = scene.state(name) else {
            // Unreachable for validated scenes
            tracing::error!("Scene '{}' has no state '{}'", scene.id, name);
            self.finish(StopReason::End);
            return;
        };

        if state.description.is_empty() {
            tracing::info!("Entering state '{}'", name);
        } else {
            tracing::info!("Entering state '{}': {}", name, state.description);
        }
        self.entered_at = Some(now);
        self.phase = Phase::Running {
            state: name.to_string(),
        };
        self.history.push(VisitedState {
            state: name.to_string(),
            entered_at: Utc::now(),
        });
        self.timeline
            .enter_state(name, state, now, &self.executor)
            .await;
    }

    fn finish(&mut self, reason: StopReason) {
        if let Some(scene) = &self.scene {
            tracing::info!("Scene '{}' stopped ({})", scene.id, reason);
        }
        self.phase = Phase::Stopped { reason };
        self.entered_at = None;
        if self.track_feedback {
            self.executor.tracker().disable();
        }
    }
}
