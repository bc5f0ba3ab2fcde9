//! Trigger matching and scene-wide transitions.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use museum_scene::{ActionKind, Condition, Transition};
use tokio::time::Instant;

/// What caused an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Time passed; only timeouts and `always` can match
    Tick,
    /// An inbound room message
    Bus { topic: String, payload: String },
    /// Local playback of `file` finished
    MediaEnded { kind: ActionKind, file: String },
}

impl Trigger {
    pub fn bus(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Trigger::Bus {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    pub fn audio_ended(file: impl Into<String>) -> Self {
        Trigger::MediaEnded {
            kind: ActionKind::Audio,
            file: file.into(),
        }
    }

    pub fn video_ended(file: impl Into<String>) -> Self {
        Trigger::MediaEnded {
            kind: ActionKind::Video,
            file: file.into(),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Tick => write!(f, "tick"),
            Trigger::Bus { topic, payload } => write!(f, "{topic} = {payload}"),
            Trigger::MediaEnded { kind, file } => write!(f, "{kind} ended: {file}"),
        }
    }
}

/// Whether `condition` holds for `trigger` after `elapsed` in the current scope.
pub fn condition_matches(condition: &Condition, trigger: &Trigger, elapsed: Duration) -> bool {
    match (condition, trigger) {
        (Condition::Always, _) => true,
        (Condition::Timeout { delay }, _) => elapsed >= *delay,
        (Condition::BusMessage { topic, message }, Trigger::Bus { topic: t, payload }) => {
            topic == t && message == payload.trim()
        }
        (
            Condition::AudioEnd { target },
            Trigger::MediaEnded {
                kind: ActionKind::Audio,
                file,
            },
        ) => target == file,
        (
            Condition::VideoEnd { target },
            Trigger::MediaEnded {
                kind: ActionKind::Video,
                file,
            },
        ) => target == file,
        _ => false,
    }
}

/// Evaluates a scene's global events.
///
/// Time-based global events (`timeout`, `always`) fire at most once per run;
/// message and media events may fire whenever they match.
#[derive(Debug, Default)]
pub struct GlobalEvaluator {
    fired: HashSet<usize>,
}

impl GlobalEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget one-shot history at the start of a run.
    pub fn reset(&mut self) {
        self.fired.clear();
    }

    /// First global event, in declaration order, satisfied by `trigger`.
    pub fn evaluate<'a>(
        &mut self,
        events: &'a [Transition],
        trigger: &Trigger,
        scene_elapsed: Duration,
    ) -> Option<&'a Transition> {
        let (index, transition) = events.iter().enumerate().find(|(index, transition)| {
            !self.fired.contains(index)
                && condition_matches(&transition.condition, trigger, scene_elapsed)
        })?;

        if is_one_shot(&transition.condition) {
            self.fired.insert(index);
        }
        Some(transition)
    }

    /// Earliest instant a time-based global event becomes due.
    pub fn next_deadline(&self, events: &[Transition], started_at: Instant) -> Option<Instant> {
        events
            .iter()
            .enumerate()
            .filter(|(index, _)| !self.fired.contains(index))
            .filter_map(|(_, transition)| match transition.condition {
                Condition::Timeout { delay } => started_at.checked_add(delay),
                Condition::Always => Some(started_at),
                _ => None,
            })
            .min()
    }
}

fn is_one_shot(condition: &Condition) -> bool {
    matches!(condition, Condition::Timeout { .. } | Condition::Always)
}

#[cfg(test)]
mod tests {
    use super::*;
    use museum_scene::Target;
    use rstest::rstest;

    fn transition(condition: Condition, goto: Target) -> Transition {
        Transition { condition, goto }
    }

    fn emergency() -> Condition {
        Condition::BusMessage {
            topic: "room1/emergency".to_string(),
            message: "STOP".to_string(),
        }
    }

    #[rstest]
    #[case(emergency(), Trigger::bus("room1/emergency", "STOP"), true)]
    #[case(emergency(), Trigger::bus("room1/emergency", " STOP\n"), true)]
    #[case(emergency(), Trigger::bus("room1/emergency", "stop"), false)]
    #[case(emergency(), Trigger::bus("room1/other", "STOP"), false)]
    #[case(emergency(), Trigger::Tick, false)]
    #[case(Condition::AudioEnd { target: "welcome.mp3".into() }, Trigger::audio_ended("welcome.mp3"), true)]
    #[case(Condition::AudioEnd { target: "welcome.mp3".into() }, Trigger::video_ended("welcome.mp3"), false)]
    #[case(Condition::VideoEnd { target: "intro.mp4".into() }, Trigger::video_ended("intro.mp4"), true)]
    #[case(Condition::Always, Trigger::Tick, true)]
    fn test_condition_matching(
        #[case] condition: Condition,
        #[case] trigger: Trigger,
        #[case] expected: bool,
    ) {
        assert_eq!(
            condition_matches(&condition, &trigger, Duration::ZERO),
            expected
        );
    }

    #[test]
    fn test_timeout_is_inclusive() {
        let condition = Condition::Timeout {
            delay: Duration::from_secs(10),
        };
        assert!(!condition_matches(&condition, &Trigger::Tick, Duration::from_millis(9999)));
        assert!(condition_matches(&condition, &Trigger::Tick, Duration::from_secs(10)));
        // Time also counts on message triggers
        assert!(condition_matches(
            &condition,
            &Trigger::bus("room1/x", "y"),
            Duration::from_secs(11)
        ));
    }

    #[test]
    fn test_declaration_order_and_one_shot_timeouts() {
        let events = vec![
            transition(
                Condition::Timeout {
                    delay: Duration::from_secs(60),
                },
                Target::State("hint".to_string()),
            ),
            transition(emergency(), Target::End),
        ];
        let mut evaluator = GlobalEvaluator::new();
        let start = Instant::now();

        assert_eq!(
            evaluator.next_deadline(&events, start),
            Some(start + Duration::from_secs(60))
        );
        let fired = evaluator
            .evaluate(&events, &Trigger::Tick, Duration::from_secs(60))
            .unwrap();
        assert_eq!(fired.goto, Target::State("hint".to_string()));

        // Already fired: the timeout stays quiet and no longer has a deadline
        assert!(evaluator
            .evaluate(&events, &Trigger::Tick, Duration::from_secs(61))
            .is_none());
        assert_eq!(evaluator.next_deadline(&events, start), None);

        let stop = evaluator
            .evaluate(
                &events,
                &Trigger::bus("room1/emergency", "STOP"),
                Duration::from_secs(70),
            )
            .unwrap();
        assert!(stop.goto.is_end());

        evaluator.reset();
        assert!(evaluator.next_deadline(&events, start).is_some());
    }

    #[test]
    fn test_unreachable_timeout_has_no_deadline() {
        let events = vec![transition(
            Condition::Timeout {
                delay: Duration::MAX,
            },
            Target::End,
        )];
        let evaluator = GlobalEvaluator::new();
        assert_eq!(evaluator.next_deadline(&events, Instant::now()), None);
    }
}
