//! Per-state action scheduling.
//!
//! Entering a state runs its on-enter actions and arms one deadline per timed
//! action, measured from the entry instant. Deadlines are not timers of their
//! own: the controller sleeps until [`Timeline::next_deadline`] and calls
//! [`Timeline::fire_due`]. Cancelling therefore cannot race a firing action.

use std::collections::VecDeque;

use museum_scene::{Action, State};
use tokio::time::Instant;

use crate::executor::ActionExecutor;

#[derive(Debug, Clone)]
struct ArmedAction {
    deadline: Instant,
    action: Action,
}

/// Timeline of the state currently being executed.
#[derive(Debug, Default)]
pub struct Timeline {
    state: Option<String>,
    armed: VecDeque<ArmedAction>,
    on_exit: Vec<Action>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run on-enter actions, then arm the timeline.
    ///
    /// Any previously active state is replaced without running its on-exit
    /// actions; call [`cancel`](Self::cancel) first for a regular transition.
    pub async fn enter_state(
        &mut self,
        name: &str,
        state: &State,
        now: Instant,
        executor: &ActionExecutor,
    ) {
        self.armed.clear();
        self.state = Some(name.to_string());
        self.on_exit = state.on_exit.clone();

        tracing::debug!(
            "Entering '{}': {} on-enter, {} timed",
            name,
            state.on_enter.len(),
            state.timeline.len()
        );
        executor.execute_all(&state.on_enter, now).await;

        // Timed actions are already sorted by offset with ties in declaration order
        self.armed = state
            .timeline
            .iter()
            .filter_map(|timed| match now.checked_add(timed.at) {
                Some(deadline) => Some(ArmedAction {
                    deadline,
                    action: timed.action.clone(),
                }),
                None => {
                    tracing::warn!(
                        "Timeline action {} at {:?} is out of range and will never fire",
                        timed.action.topic,
                        timed.at
                    );
                    None
                }
            })
            .collect();
    }

    /// Execute every armed action whose deadline is at or before `now`.
    /// Returns how many fired.
    pub async fn fire_due(&mut self, now: Instant, executor: &ActionExecutor) -> usize {
        let mut fired = 0;
        while self.armed.front().is_some_and(|armed| armed.deadline <= now) {
            let Some(armed) = self.armed.pop_front() else {
                break;
            };
            tracing::debug!(
                "Timeline action {} = {}",
                armed.action.topic,
                armed.action.message
            );
            executor.execute(&armed.action, now).await;
            fired += 1;
        }
        fired
    }

    /// Drop every armed action, then run the state's on-exit actions.
    pub async fn cancel(&mut self, now: Instant, executor: &ActionExecutor) {
        let Some(name) = self.state.take() else {
            return;
        };
        if !self.armed.is_empty() {
            tracing::debug!(
                "Cancelling {} pending timeline action(s) of '{}'",
                self.armed.len(),
                name
            );
        }
        self.armed.clear();

        let on_exit = std::mem::take(&mut self.on_exit);
        executor.execute_all(&on_exit, now).await;
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.front().map(|armed| armed.deadline)
    }

    pub fn pending(&self) -> usize {
        self.armed.len()
    }

    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use bus_gateway::MemoryBus;
    use museum_scene::TimedAction;
    use museum_state::FeedbackTracker;

    use crate::config::FeedbackChannel;
    use crate::media::LoggingMediaPlayer;

    fn executor(bus: Arc<MemoryBus>) -> ActionExecutor {
        ActionExecutor::new(
            bus,
            Arc::new(FeedbackTracker::default()),
            Arc::new(LoggingMediaPlayer::new()),
            FeedbackChannel::PerCommand,
            "room1",
        )
    }

    fn state() -> State {
        State {
            on_enter: vec![Action::mqtt("room1/light", "ON")],
            timeline: vec![
                TimedAction {
                    at: Duration::from_secs(1),
                    action: Action::mqtt("room1/fog", "ON"),
                },
                TimedAction {
                    at: Duration::from_secs(1),
                    action: Action::mqtt("room1/fan", "ON"),
                },
                TimedAction {
                    at: Duration::from_secs(3),
                    action: Action::mqtt("room1/fog", "OFF"),
                },
            ],
            on_exit: vec![Action::mqtt("room1/light", "OFF")],
            ..State::default()
        }
    }

    #[tokio::test]
    async fn test_on_enter_runs_before_timeline() {
        let bus = Arc::new(MemoryBus::new());
        let executor = executor(bus.clone());
        let mut timeline = Timeline::new();
        let t0 = Instant::now();

        timeline.enter_state("show", &state(), t0, &executor).await;
        assert_eq!(
            bus.history(),
            vec![("room1/light".to_string(), "ON".to_string())]
        );
        assert_eq!(timeline.next_deadline(), Some(t0 + Duration::from_secs(1)));

        assert_eq!(timeline.fire_due(t0 + Duration::from_millis(999), &executor).await, 0);
        assert_eq!(timeline.fire_due(t0 + Duration::from_secs(1), &executor).await, 2);

        let topics: Vec<String> = bus.history().into_iter().map(|(topic, _)| topic).collect();
        assert_eq!(topics, vec!["room1/light", "room1/fog", "room1/fan"]);
        assert_eq!(timeline.pending(), 1);
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_then_runs_on_exit() {
        let bus = Arc::new(MemoryBus::new());
        let executor = executor(bus.clone());
        let mut timeline = Timeline::new();
        let t0 = Instant::now();

        timeline.enter_state("show", &state(), t0, &executor).await;
        timeline.cancel(t0 + Duration::from_millis(500), &executor).await;
        assert_eq!(timeline.next_deadline(), None);
        assert_eq!(timeline.state(), None);

        assert_eq!(timeline.fire_due(t0 + Duration::from_secs(5), &executor).await, 0);
        assert_eq!(bus.payloads_for("room1/light"), vec!["ON", "OFF"]);
        assert!(bus.payloads_for("room1/fog").is_empty());

        // A second cancel has no state to exit
        timeline.cancel(t0 + Duration::from_secs(6), &executor).await;
        assert_eq!(bus.payloads_for("room1/light").len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_offset_is_never_armed() {
        let bus = Arc::new(MemoryBus::new());
        let executor = executor(bus.clone());
        let mut timeline = Timeline::new();
        let t0 = Instant::now();

        let mut state = state();
        state.timeline.push(TimedAction {
            at: Duration::MAX,
            action: Action::mqtt("room1/never", "ON"),
        });
        timeline.enter_state("show", &state, t0, &executor).await;
        assert_eq!(timeline.pending(), 3);
        assert_eq!(timeline.next_deadline(), Some(t0 + Duration::from_secs(1)));

        assert_eq!(timeline.fire_due(t0 + Duration::from_secs(3), &executor).await, 3);
        assert_eq!(timeline.next_deadline(), None);
        assert!(bus.payloads_for("room1/never").is_empty());
    }
}
