//! Validated scene model.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Sentinel `goto` value that terminates the run.
pub const END_STATE: &str = "END";

/// A fully loaded, validated scene.
///
/// Immutable for the lifetime of a run. Every [`Target::State`] reachable from
/// `states` or `global_events` names a key of `states`.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub id: String,
    pub description: String,
    pub version: String,
    /// Empty only for a degenerate scene without states
    pub initial_state: String,
    pub states: BTreeMap<String, State>,
    pub global_events: Vec<Transition>,
}

impl Scene {
    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    /// The state a run starts in, if any.
    pub fn initial(&self) -> Option<&State> {
        self.states.get(&self.initial_state)
    }

    /// Whether the scene can be started at all.
    pub fn is_runnable(&self) -> bool {
        self.initial().is_some()
    }

    /// Every transition target in the scene, local ones first.
    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.states
            .values()
            .flat_map(|state| state.transitions.iter())
            .chain(self.global_events.iter())
            .map(|transition| &transition.goto)
    }

    /// File names referenced by local media actions, deduplicated and sorted.
    ///
    /// Media players use this to preload effects before the run starts.
    pub fn media_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self
            .states
            .values()
            .flat_map(|state| state.all_actions())
            .filter(|action| action.kind.is_local_media())
            .filter_map(|action| action.media_file().map(str::to_string))
            .collect();
        files.sort();
        files.dedup();
        files
    }
}

/// One node of the scene graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub description: String,
    pub on_enter: Vec<Action>,
    /// Sorted by offset; ties keep declaration order
    pub timeline: Vec<TimedAction>,
    pub on_exit: Vec<Action>,
    pub transitions: Vec<Transition>,
}

impl State {
    /// All actions of the state in execution order (enter, timeline, exit).
    pub fn all_actions(&self) -> impl Iterator<Item = &Action> {
        self.on_enter
            .iter()
            .chain(self.timeline.iter().map(|timed| &timed.action))
            .chain(self.on_exit.iter())
    }
}

/// Where an action is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    /// Published to a field device over the bus
    Mqtt,
    /// Local audio playback command
    Audio,
    /// Local video playback command
    Video,
}

impl ActionKind {
    /// Local media commands are resolved on this node and never produce bus feedback.
    pub fn is_local_media(self) -> bool {
        matches!(self, ActionKind::Audio | ActionKind::Video)
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "mqtt" => Some(ActionKind::Mqtt),
            "audio" => Some(ActionKind::Audio),
            "video" => Some(ActionKind::Video),
            _ => None,
        }
    }

    /// Kind implied by a topic when the document does not say.
    pub fn infer_from_topic(topic: &str) -> Self {
        if topic.ends_with("/audio") {
            ActionKind::Audio
        } else if topic.ends_with("/video") {
            ActionKind::Video
        } else {
            ActionKind::Mqtt
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Mqtt => write!(f, "mqtt"),
            ActionKind::Audio => write!(f, "audio"),
            ActionKind::Video => write!(f, "video"),
        }
    }
}

/// An opaque command. Identity is its position in the owning list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub kind: ActionKind,
    /// Empty for local media actions written without a topic
    pub topic: String,
    pub message: String,
}

impl Action {
    /// A bus command.
    pub fn mqtt(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ActionKind::Mqtt,
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// File name carried by a `PLAY:<file>...` / `PLAY_VIDEO:<file>` command.
    pub fn media_file(&self) -> Option<&str> {
        let rest = self
            .message
            .strip_prefix("PLAY_VIDEO:")
            .or_else(|| self.message.strip_prefix("PLAY:"))?;
        let file = rest.split(':').next()?.trim();
        (!file.is_empty()).then_some(file)
    }
}

/// An action scheduled at an offset from state entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TimedAction {
    pub at: Duration,
    pub action: Action,
}

/// Destination of a transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    State(String),
    /// Terminates the run
    End,
}

impl Target {
    pub(crate) fn parse(goto: &str) -> Self {
        if goto == END_STATE {
            Target::End
        } else {
            Target::State(goto.to_string())
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Target::End)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::State(name) => write!(f, "{name}"),
            Target::End => write!(f, "{END_STATE}"),
        }
    }
}

/// Condition half of a transition. One variant per transition type.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Elapsed time since state entry (scene start for global events)
    Timeout { delay: Duration },
    /// Exact topic and payload match on an inbound bus message.
    /// `buttonPress` entries are normalised into this variant.
    BusMessage { topic: String, message: String },
    /// Completion of the named audio file
    AudioEnd { target: String },
    /// Completion of the named video file
    VideoEnd { target: String },
    /// Satisfied on the first evaluation
    Always,
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Timeout { delay } => write!(f, "timeout({:.3}s)", delay.as_secs_f64()),
            Condition::BusMessage { topic, message } => write!(f, "mqtt({topic}={message})"),
            Condition::AudioEnd { target } => write!(f, "audioEnd({target})"),
            Condition::VideoEnd { target } => write!(f, "videoEnd({target})"),
            Condition::Always => write!(f, "always"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub condition: Condition,
    pub goto: Target,
}
