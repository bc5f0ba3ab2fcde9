//! # show-engine
//!
//! Runs one room's scenes: a state machine over a loaded [`Scene`], a
//! per-state timeline, scene-wide events and the routing of everything the
//! bus delivers.
//!
//! ## Architecture
//!
//! 1. **Routing**: every inbound message passes through the [`MessageRouter`],
//!    which feeds device presence to the registry, acknowledgements to the
//!    feedback tracker and everything room-scoped to the state machine
//! 2. **Evaluation**: the [`SceneMachine`] checks global events, then due
//!    timeline actions, then local transitions, applying at most one
//!    transition per step
//! 3. **Execution**: actions go through the [`ActionExecutor`], which registers
//!    feedback expectations before publishing and hands audio/video to the
//!    [`MediaPlayer`], which reports finished playback back to the loop
//!
//! [`ShowController::run`] owns the machine and evaluates it from a single
//! task. Everything else talks to it through a [`ShowHandle`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bus_gateway::MemoryBus;
//! use museum_scene::SceneLibrary;
//! use show_engine::{EngineConfig, LoggingMediaPlayer, SceneTrigger, ShowController};
//!
//! let library = SceneLibrary::new("scenes", "room1", "intro");
//! let (controller, handle) = ShowController::new(
//!     EngineConfig::default(),
//!     library,
//!     Arc::new(MemoryBus::new()),
//!     Arc::new(LoggingMediaPlayer::new()),
//! )?;
//! let task = tokio::spawn(controller.run());
//!
//! handle.start_scene(SceneTrigger::Default).await?;
//! println!("{:?}", handle.status().current_state);
//! handle.shutdown().await?;
//! task.await??;
//! ```
//!
//! [`Scene`]: museum_scene::Scene

pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod global;
pub mod logging;
pub mod machine;
pub mod media;
pub mod router;
pub mod timeline;

pub use config::{EngineConfig, FeedbackChannel};
pub use controller::{ControlEvent, ShowController, ShowEvent, ShowHandle, ShowStatus};
pub use error::{EngineError, Result};
pub use executor::{ActionExecutor, ActionOutcome};
pub use global::{condition_matches, GlobalEvaluator, Trigger};
pub use logging::{init_logging, init_logging_from_env, LoggingError, LoggingMode};
pub use machine::{
    Phase, SceneMachine, StepReport, StopReason, TransitionReport, TransitionScope, VisitedState,
};
pub use media::{CompletionSender, LoggingMediaPlayer, MediaCommand, MediaFinished, MediaPlayer};
pub use router::{MessageRouter, Route, RouterCounts, SceneEvent, SceneTrigger};
pub use timeline::Timeline;
