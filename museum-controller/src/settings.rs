//! Command line and settings file handling.
//!
//! Every option can come from the command line, the environment or a JSON
//! settings file, in that order of precedence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use bus_gateway::GatewayConfig;
use clap::{Parser, ValueEnum};
use museum_state::{RegistryConfig, TrackerConfig};
use serde::Deserialize;
use show_engine::{EngineConfig, FeedbackChannel, LoggingMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelArg {
    /// Devices acknowledge on `<topic>/feedback`
    PerCommand,
    /// Devices acknowledge on `<room>/status`
    RoomStatus,
}

impl From<ChannelArg> for FeedbackChannel {
    fn from(value: ChannelArg) -> Self {
        match value {
            ChannelArg::PerCommand => FeedbackChannel::PerCommand,
            ChannelArg::RoomStatus => FeedbackChannel::RoomStatus,
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
#[command(author, version, about = "Show controller for one museum room", long_about = None)]
pub struct Args {
    #[arg(long, env = "MUSEUM_CONFIG", help = "JSON settings file")]
    pub config: Option<PathBuf>,

    #[arg(long, env = "MUSEUM_BROKER_HOST", help = "MQTT broker host [default: localhost]")]
    pub broker_host: Option<String>,

    #[arg(long, env = "MUSEUM_BROKER_PORT", help = "MQTT broker port [default: 1883]")]
    pub broker_port: Option<u16>,

    #[arg(long, env = "MUSEUM_CLIENT_ID", help = "MQTT client id [default: museum-<room>]")]
    pub client_id: Option<String>,

    #[arg(long, env = "MUSEUM_ROOM", help = "Room served by this controller [default: room1]")]
    pub room: Option<String>,

    #[arg(long, env = "MUSEUM_SCENES_DIR", help = "Directory holding <room>/<scene>.json [default: scenes]")]
    pub scenes_dir: Option<PathBuf>,

    #[arg(long, env = "MUSEUM_DEFAULT_SCENE", help = "Scene started by <room>/scene START [default: intro]")]
    pub default_scene: Option<String>,

    #[arg(long, env = "MUSEUM_FEEDBACK_TIMEOUT_MS", help = "Device acknowledgement timeout in milliseconds [default: 1000]")]
    pub feedback_timeout_ms: Option<u64>,

    #[arg(long, value_enum, env = "MUSEUM_FEEDBACK_CHANNEL", help = "Where devices acknowledge commands [default: per-command]")]
    pub feedback_channel: Option<ChannelArg>,

    #[arg(long, help = "Do not track device acknowledgements")]
    pub no_feedback: bool,

    #[arg(long, env = "MUSEUM_DEVICE_STALE_SECS", help = "Seconds of silence before a device is offline [default: 180]")]
    pub device_stale_secs: Option<u64>,

    #[arg(long, env = "MUSEUM_MAX_RECONNECTS", help = "Consecutive broker failures before exiting [default: 10]")]
    pub max_reconnects: Option<u32>,

    #[arg(long, env = "MUSEUM_MEDIA_DURATION_MS", help = "Simulated playback length before audio/video end events, 0 disables [default: 5000]")]
    pub media_duration_ms: Option<u64>,

    #[arg(long, help = "Start the default scene immediately")]
    pub start: bool,

    #[arg(long, help = "Run against an in-memory bus instead of the broker")]
    pub dry_run: bool,

    #[arg(long, help = "Print the room's scenes and exit")]
    pub list_scenes: bool,

    #[arg(long, env = "MUSEUM_LOG_MODE", help = "silent, development, debug or json [default: development]")]
    pub log_mode: Option<String>,
}

/// Contents of a `--config` file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileSettings {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub client_id: Option<String>,
    pub room: Option<String>,
    pub scenes_dir: Option<PathBuf>,
    pub default_scene: Option<String>,
    pub feedback_timeout_ms: Option<u64>,
    pub feedback_channel: Option<ChannelArg>,
    pub feedback_tracking: Option<bool>,
    pub device_stale_secs: Option<u64>,
    pub max_reconnects: Option<u32>,
    pub media_duration_ms: Option<u64>,
    pub log_mode: Option<String>,
}

impl FileSettings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Invalid settings file {}", path.display()))
    }
}

/// Fully resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub gateway: GatewayConfig,
    pub engine: EngineConfig,
    pub scenes_dir: PathBuf,
    pub default_scene: String,
    /// `None` when playback never reports completion
    pub media_playback: Option<Duration>,
    pub log_mode: LoggingMode,
    pub start: bool,
    pub dry_run: bool,
    pub list_scenes: bool,
}

impl Settings {
    /// Merge command line (and environment) values over the settings file.
    pub fn resolve(args: Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => FileSettings::load(path)?,
            None => FileSettings::default(),
        };
        Self::merge(args, file)
    }

    pub fn merge(args: Args, file: FileSettings) -> anyhow::Result<Self> {
        let room = args
            .room
            .or(file.room)
            .unwrap_or_else(|| "room1".to_string());

        let mut gateway = GatewayConfig::new()
            .with_room(room.clone())
            .with_client_id(
                args.client_id
                    .or(file.client_id)
                    .unwrap_or_else(|| format!("museum-{room}")),
            );
        gateway.host = args.broker_host.or(file.broker_host).unwrap_or(gateway.host);
        gateway.port = args.broker_port.or(file.broker_port).unwrap_or(gateway.port);
        if let Some(failures) = args.max_reconnects.or(file.max_reconnects) {
            gateway = gateway.with_max_consecutive_failures(failures);
        }
        gateway.validate().context("Invalid broker settings")?;

        let mut tracker = TrackerConfig::new();
        if let Some(ms) = args.feedback_timeout_ms.or(file.feedback_timeout_ms) {
            let timeout = Duration::from_millis(ms);
            let sweep = tracker.sweep_interval.min(timeout);
            tracker = tracker.with_timeout(timeout).with_sweep_interval(sweep);
        }
        let mut registry = RegistryConfig::new();
        if let Some(secs) = args.device_stale_secs.or(file.device_stale_secs) {
            registry = registry.with_stale_after(Duration::from_secs(secs));
        }

        let feedback_tracking = !args.no_feedback && file.feedback_tracking.unwrap_or(true);
        let channel = args
            .feedback_channel
            .or(file.feedback_channel)
            .map(FeedbackChannel::from)
            .unwrap_or_default();

        let engine = EngineConfig::new()
            .with_room(room)
            .with_feedback_tracking(feedback_tracking)
            .with_feedback_channel(channel)
            .with_tracker(tracker)
            .with_registry(registry);
        engine.validate().context("Invalid engine settings")?;

        let log_mode = match args.log_mode.or(file.log_mode) {
            Some(mode) => mode.parse().context("Invalid log mode")?,
            None => LoggingMode::Development,
        };

        let default_scene = args
            .default_scene
            .or(file.default_scene)
            .unwrap_or_else(|| "intro".to_string());
        if default_scene.trim().is_empty() {
            bail!("Default scene name must not be empty");
        }

        let media_playback = match args.media_duration_ms.or(file.media_duration_ms) {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(Duration::from_secs(5)),
        };

        Ok(Self {
            gateway,
            engine,
            scenes_dir: args
                .scenes_dir
                .or(file.scenes_dir)
                .unwrap_or_else(|| PathBuf::from("scenes")),
            default_scene,
            media_playback,
            log_mode,
            start: args.start,
            dry_run: args.dry_run,
            list_scenes: args.list_scenes,
        })
    }
}
