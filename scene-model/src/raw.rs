//! Wire-level scene document as produced by the editor.
//!
//! These types accept everything the editor has ever emitted; conversion into
//! the validated model happens in `loader`.

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawScene {
    #[serde(default)]
    pub scene_id: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub initial_state: Option<String>,
    #[serde(default)]
    pub states: BTreeMap<String, RawState>,
    #[serde(default)]
    pub global_events: Vec<RawTransition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawState {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub on_enter: Vec<RawAction>,
    #[serde(default)]
    pub timeline: Vec<RawTimedEntry>,
    #[serde(default)]
    pub on_exit: Vec<RawAction>,
    #[serde(default)]
    pub transitions: Vec<RawTransition>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RawAction {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub message: Option<RawPayload>,
    /// Accepted for compatibility; commands are never published retained.
    #[serde(default)]
    #[allow(dead_code)]
    pub retain: Option<bool>,
}

/// Timeline entry: either one action inline or a group under `actions`.
#[derive(Debug, Deserialize)]
pub(crate) struct RawTimedEntry {
    pub at: f64,
    #[serde(default)]
    pub actions: Option<Vec<RawAction>>,
    #[serde(flatten)]
    pub single: RawAction,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum RawTransition {
    Timeout {
        delay: f64,
        goto: String,
    },
    MqttMessage {
        topic: String,
        message: RawPayload,
        goto: String,
    },
    ButtonPress {
        topic: String,
        message: RawPayload,
        goto: String,
    },
    AudioEnd {
        target: String,
        goto: String,
    },
    VideoEnd {
        target: String,
        goto: String,
    },
    Always {
        goto: String,
    },
}

impl RawTransition {
    pub fn goto(&self) -> &str {
        match self {
            RawTransition::Timeout { goto, .. }
            | RawTransition::MqttMessage { goto, .. }
            | RawTransition::ButtonPress { goto, .. }
            | RawTransition::AudioEnd { goto, .. }
            | RawTransition::VideoEnd { goto, .. }
            | RawTransition::Always { goto } => goto,
        }
    }
}

/// Message payloads may be written as strings, numbers or booleans.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawPayload {
    Text(String),
    Number(serde_json::Number),
    Bool(bool),
}

impl RawPayload {
    pub fn into_text(self) -> String {
        match self {
            RawPayload::Text(text) => text,
            RawPayload::Number(number) => number.to_string(),
            RawPayload::Bool(flag) => flag.to_string(),
        }
    }
}
