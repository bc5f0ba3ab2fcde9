//! Conversion of wire documents into validated scenes.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, SceneError};
use crate::model::{Action, ActionKind, Condition, Scene, State, Target, TimedAction, Transition};
use crate::raw::{RawAction, RawScene, RawState, RawTimedEntry, RawTransition};

impl Scene {
    /// Parse and validate a scene from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let raw: RawScene = serde_json::from_str(json)?;
        Self::from_raw(raw)
    }

    /// Parse and validate a scene from JSON bytes.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let raw: RawScene = serde_json::from_slice(bytes)?;
        Self::from_raw(raw)
    }

    /// Read, parse and validate a scene file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SceneError::NotFound(path.to_path_buf()));
        }
        let bytes = std::fs::read(path).map_err(|source| SceneError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let scene = Self::from_json_slice(&bytes)?;
        tracing::info!(
            "Scene loaded: {} ({} states, {} global events) from {}",
            scene.id,
            scene.states.len(),
            scene.global_events.len(),
            path.display()
        );
        Ok(scene)
    }

    /// Check the reference invariants of the scene.
    ///
    /// Loading already guarantees these; the check is public so callers that
    /// build scenes by hand can apply the same rules.
    pub fn validate(&self) -> Result<()> {
        if !self.states.is_empty() && !self.states.contains_key(&self.initial_state) {
            if self.initial_state.is_empty() {
                return Err(SceneError::MissingInitialState);
            }
            return Err(SceneError::UnknownInitialState(self.initial_state.clone()));
        }

        for (name, state) in &self.states {
            for (index, transition) in state.transitions.iter().enumerate() {
                if let Target::State(goto) = &transition.goto {
                    if !self.states.contains_key(goto) {
                        return Err(SceneError::UnknownTarget {
                            state: name.clone(),
                            index,
                            goto: goto.clone(),
                        });
                    }
                }
            }
        }

        for (index, transition) in self.global_events.iter().enumerate() {
            if let Target::State(goto) = &transition.goto {
                if !self.states.contains_key(goto) {
                    return Err(SceneError::UnknownGlobalTarget {
                        index,
                        goto: goto.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    fn from_raw(raw: RawScene) -> Result<Self> {
        let mut states = BTreeMap::new();
        for (name, raw_state) in raw.states {
            let state = convert_state(&name, raw_state)?;
            states.insert(name, state);
        }

        let global_events = raw
            .global_events
            .into_iter()
            .enumerate()
            .map(|(index, transition)| {
                convert_transition(&format!("global event #{index}"), transition)
            })
            .collect::<Result<Vec<_>>>()?;

        let initial_state = match raw.initial_state {
            Some(initial) => initial,
            None if states.is_empty() => String::new(),
            None => return Err(SceneError::MissingInitialState),
        };

        let scene = Scene {
            id: raw.scene_id.unwrap_or_else(|| "unknown".to_string()),
            description: raw.description,
            version: raw.version,
            initial_state,
            states,
            global_events,
        };

        scene.validate()?;
        Ok(scene)
    }
}

fn convert_state(name: &str, raw: RawState) -> Result<State> {
    let on_enter = convert_actions(&format!("state '{name}' onEnter"), raw.on_enter)?;
    let on_exit = convert_actions(&format!("state '{name}' onExit"), raw.on_exit)?;

    let mut timeline = Vec::new();
    for (index, entry) in raw.timeline.into_iter().enumerate() {
        let location = format!("state '{name}' timeline #{index}");
        timeline.extend(convert_timed_entry(&location, entry)?);
    }
    // Stable sort keeps declaration order for equal offsets
    timeline.sort_by(|a, b| a.at.cmp(&b.at));

    let transitions = raw
        .transitions
        .into_iter()
        .enumerate()
        .map(|(index, transition)| {
            convert_transition(&format!("state '{name}' transition #{index}"), transition)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(State {
        description: raw.description,
        on_enter,
        timeline,
        on_exit,
        transitions,
    })
}

fn convert_timed_entry(location: &str, entry: RawTimedEntry) -> Result<Vec<TimedAction>> {
    let at = seconds(location, entry.at)?;
    let actions = match entry.actions {
        Some(group) => convert_actions(location, group)?,
        None => vec![convert_action(location, entry.single)?],
    };
    Ok(actions
        .into_iter()
        .map(|action| TimedAction { at, action })
        .collect())
}

fn convert_actions(location: &str, raw: Vec<RawAction>) -> Result<Vec<Action>> {
    raw.into_iter()
        .enumerate()
        .map(|(index, action)| convert_action(&format!("{location} #{index}"), action))
        .collect()
}

fn convert_action(location: &str, raw: RawAction) -> Result<Action> {
    let invalid = |reason: &str| SceneError::InvalidAction {
        location: location.to_string(),
        reason: reason.to_string(),
    };

    let topic = raw.topic.unwrap_or_default().trim().to_string();
    let kind = match raw.action.as_deref() {
        Some(kind) => ActionKind::parse(kind)
            .ok_or_else(|| invalid(&format!("unknown action type '{kind}'")))?,
        None => ActionKind::infer_from_topic(&topic),
    };

    let message = raw
        .message
        .map(|payload| payload.into_text().trim().to_string())
        .filter(|message| !message.is_empty())
        .ok_or_else(|| invalid("missing message"))?;

    if kind == ActionKind::Mqtt && topic.is_empty() {
        return Err(invalid("mqtt action requires a topic"));
    }
    if topic.contains('+') || topic.contains('#') {
        return Err(invalid("wildcards are not allowed in command topics"));
    }

    Ok(Action {
        kind,
        topic,
        message,
    })
}

fn convert_transition(location: &str, raw: RawTransition) -> Result<Transition> {
    let goto = Target::parse(raw.goto());
    let condition = match raw {
        RawTransition::Timeout { delay, .. } => Condition::Timeout {
            delay: seconds(location, delay)?,
        },
        RawTransition::MqttMessage { topic, message, .. }
        | RawTransition::ButtonPress { topic, message, .. } => Condition::BusMessage {
            topic,
            message: message.into_text(),
        },
        RawTransition::AudioEnd { target, .. } => Condition::AudioEnd { target },
        RawTransition::VideoEnd { target, .. } => Condition::VideoEnd { target },
        RawTransition::Always { .. } => Condition::Always,
    };
    Ok(Transition { condition, goto })
}

/// Longest accepted timeline offset or timeout delay.
pub const MAX_OFFSET: Duration = Duration::from_secs(365 * 24 * 60 * 60);

fn seconds(location: &str, value: f64) -> Result<Duration> {
    let invalid = || SceneError::InvalidTiming {
        location: location.to_string(),
        value,
    };
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    let duration = Duration::try_from_secs_f64(value).map_err(|_| invalid())?;
    if duration > MAX_OFFSET {
        return Err(invalid());
    }
    Ok(duration)
}
