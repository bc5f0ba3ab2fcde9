//! Local media seam.
//!
//! Audio and video actions are executed on the controller host. The engine
//! parses them into [`MediaCommand`]s and hands them to a [`MediaPlayer`].
//! Players report finished playback as [`MediaFinished`] on the sender the
//! controller registers with [`MediaPlayer::set_completion_sender`].

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use museum_scene::ActionKind;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{EngineError, Result};

/// A parsed local media command.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaCommand {
    /// `PLAY:<file>[:<volume>]`, `PLAY_VIDEO:<file>` or a bare file name
    Play { file: String, volume: Option<f32> },
    /// `STOP` / `STOP_VIDEO`
    StopAll,
    /// `STOP:<file>`
    Stop { file: String },
    Pause,
    Resume,
    /// `VOLUME:<0.0-1.0>`
    Volume(f32),
    /// `SEEK:<seconds>` (video only)
    Seek(f64),
}

impl MediaCommand {
    /// Parse an action message for the given media kind.
    pub fn parse(kind: ActionKind, message: &str) -> Result<Self> {
        let message = message.trim();
        let invalid = || EngineError::InvalidMediaCommand {
            kind: kind.to_string(),
            command: message.to_string(),
        };
        if message.is_empty() {
            return Err(invalid());
        }

        let command = match kind {
            ActionKind::Audio => {
                if let Some(rest) = message.strip_prefix("PLAY:") {
                    let mut parts = rest.split(':');
                    let file = parts.next().unwrap_or_default().trim();
                    let volume = match parts.next() {
                        Some(volume) => Some(parse_volume(volume).ok_or_else(invalid)?),
                        None => None,
                    };
                    if file.is_empty() {
                        return Err(invalid());
                    }
                    MediaCommand::Play {
                        file: file.to_string(),
                        volume,
                    }
                } else if message.eq_ignore_ascii_case("STOP") {
                    MediaCommand::StopAll
                } else if let Some(file) = message.strip_prefix("STOP:") {
                    MediaCommand::Stop {
                        file: file.trim().to_string(),
                    }
                } else if message == "PAUSE" {
                    MediaCommand::Pause
                } else if message == "RESUME" {
                    MediaCommand::Resume
                } else if let Some(volume) = message.strip_prefix("VOLUME:") {
                    MediaCommand::Volume(parse_volume(volume).ok_or_else(invalid)?)
                } else {
                    MediaCommand::Play {
                        file: message.to_string(),
                        volume: None,
                    }
                }
            }
            ActionKind::Video => {
                if let Some(file) = message.strip_prefix("PLAY_VIDEO:") {
                    let file = file.trim();
                    if file.is_empty() {
                        return Err(invalid());
                    }
                    MediaCommand::Play {
                        file: file.to_string(),
                        volume: None,
                    }
                } else if message == "STOP_VIDEO" {
                    MediaCommand::StopAll
                } else if message == "PAUSE" {
                    MediaCommand::Pause
                } else if message == "RESUME" {
                    MediaCommand::Resume
                } else if let Some(seconds) = message.strip_prefix("SEEK:") {
                    let seconds: f64 = seconds.trim().parse().map_err(|_| invalid())?;
                    if !seconds.is_finite() || seconds < 0.0 {
                        return Err(invalid());
                    }
                    MediaCommand::Seek(seconds)
                } else {
                    MediaCommand::Play {
                        file: message.to_string(),
                        volume: None,
                    }
                }
            }
            ActionKind::Mqtt => return Err(invalid()),
        };
        Ok(command)
    }
}

fn parse_volume(value: &str) -> Option<f32> {
    let volume: f32 = value.trim().parse().ok()?;
    volume.is_finite().then(|| volume.clamp(0.0, 1.0))
}

impl fmt::Display for MediaCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaCommand::Play { file, volume: Some(volume) } => write!(f, "play {file} @ {volume:.2}"),
            MediaCommand::Play { file, volume: None } => write!(f, "play {file}"),
            MediaCommand::StopAll => write!(f, "stop all"),
            MediaCommand::Stop { file } => write!(f, "stop {file}"),
            MediaCommand::Pause => write!(f, "pause"),
            MediaCommand::Resume => write!(f, "resume"),
            MediaCommand::Volume(volume) => write!(f, "volume {volume:.2}"),
            MediaCommand::Seek(seconds) => write!(f, "seek {seconds:.1}s"),
        }
    }
}

/// Playback of a file ran to its end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFinished {
    pub kind: ActionKind,
    pub file: String,
}

pub type CompletionSender = mpsc::UnboundedSender<MediaFinished>;

/// Playback backend for local audio and video.
#[async_trait]
pub trait MediaPlayer: Send + Sync {
    async fn execute(&self, kind: ActionKind, command: MediaCommand) -> Result<()>;

    /// Called with every file a scene references before it starts.
    async fn preload(&self, _files: &[String]) -> Result<()> {
        Ok(())
    }

    /// Where to report finished playback. Called once when the controller is built.
    fn set_completion_sender(&self, _completions: CompletionSender) {}
}

/// Player that only logs and remembers what it was asked to do.
///
/// With a playback duration set, every `Play` reports completion after that
/// long unless it is stopped or replaced first. Pausing does not hold the
/// clock. Used for dry runs without media hardware and in tests.
#[derive(Default)]
pub struct LoggingMediaPlayer {
    history: Mutex<Vec<(ActionKind, MediaCommand)>>,
    preloaded: Mutex<Vec<String>>,
    playback: Option<Duration>,
    completions: Mutex<Option<CompletionSender>>,
    playing: Mutex<HashMap<(ActionKind, String), JoinHandle<()>>>,
}

impl LoggingMediaPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report every playback as finished `duration` after it starts.
    pub fn with_playback_duration(mut self, duration: Duration) -> Self {
        self.playback = Some(duration);
        self
    }

    fn start_playback(&self, kind: ActionKind, file: &str) {
        let (Some(duration), Some(completions)) = (self.playback, self.completions.lock().clone())
        else {
            return;
        };

        let mut playing = self.playing.lock();
        if kind == ActionKind::Video {
            // One video surface: a new video replaces the current one
            stop_matching(&mut playing, |(k, _)| *k == ActionKind::Video);
        } else if let Some(previous) = playing.remove(&(kind, file.to_string())) {
            previous.abort();
        }

        let finished = MediaFinished {
            kind,
            file: file.to_string(),
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            tracing::debug!("[{}] {} finished", finished.kind, finished.file);
            let _ = completions.send(finished);
        });
        playing.insert((kind, file.to_string()), task);
    }

    fn stop_playback(&self, kind: ActionKind, file: Option<&str>) {
        let mut playing = self.playing.lock();
        stop_matching(&mut playing, |(k, f)| {
            *k == kind && file.map_or(true, |file| file == f)
        });
    }

    pub fn history(&self) -> Vec<(ActionKind, MediaCommand)> {
        self.history.lock().clone()
    }

    pub fn preloaded(&self) -> Vec<String> {
        self.preloaded.lock().clone()
    }
}

#[async_trait]
impl MediaPlayer for LoggingMediaPlayer {
    async fn execute(&self, kind: ActionKind, command: MediaCommand) -> Result<()> {
        tracing::info!("[{}] {}", kind, command);
        match &command {
            MediaCommand::Play { file, .. } => self.start_playback(kind, file),
            MediaCommand::Stop { file } => self.stop_playback(kind, Some(file)),
            MediaCommand::StopAll => self.stop_playback(kind, None),
            _ => {}
        }
        self.history.lock().push((kind, command));
        Ok(())
    }

    async fn preload(&self, files: &[String]) -> Result<()> {
        tracing::debug!("Preloading {} media file(s)", files.len());
        self.preloaded.lock().extend_from_slice(files);
        Ok(())
    }

    fn set_completion_sender(&self, completions: CompletionSender) {
        *self.completions.lock() = Some(completions);
    }
}

impl Drop for LoggingMediaPlayer {
    fn drop(&mut self) {
        for (_, task) in self.playing.lock().drain() {
            task.abort();
        }
    }
}

fn stop_matching(
    playing: &mut HashMap<(ActionKind, String), JoinHandle<()>>,
    matches: impl Fn(&(ActionKind, String)) -> bool,
) {
    playing.retain(|key, task| {
        if matches(key) {
            task.abort();
            false
        } else {
            true
        }
    });
}
