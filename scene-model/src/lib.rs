//! # museum-scene
//!
//! Data model for declarative show scenes: states with enter/exit actions, a
//! timeline of offset actions, and transitions that move the show between
//! states (or end it).
//!
//! Scenes are authored as JSON by an external editor. Loading performs two
//! passes: the structure is parsed into lenient wire types, then converted and
//! validated into the strongly typed model exposed here. A scene that loads
//! successfully has no dangling `goto` references and no malformed actions.
//!
//! ```rust,ignore
//! use museum_scene::{Scene, SceneLibrary};
//!
//! let library = SceneLibrary::new("/opt/museum/scenes", "room1", "intro.json");
//! let scene: Scene = library.load_default()?;
//! println!("{} has {} states", scene.id, scene.states.len());
//! ```

mod error;
mod loader;
mod model;
mod raw;

pub mod library;

pub use error::{Result, SceneError};
pub use library::SceneLibrary;
pub use loader::MAX_OFFSET;
pub use model::{
    Action, ActionKind, Condition, Scene, State, Target, TimedAction, Transition, END_STATE,
};
