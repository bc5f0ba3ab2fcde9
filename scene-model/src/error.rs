//! Error types for scene loading and validation.

use std::path::PathBuf;

/// Errors that reject a scene definition.
///
/// All of these are fatal for the load attempt only; the caller decides
/// whether to keep running with a previously loaded scene.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// The scene file could not be read
    #[error("Failed to read scene file {path}: {source}")]
    Io {
        /// Path that was being read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The scene file does not exist
    #[error("Scene file not found: {0}")]
    NotFound(PathBuf),

    /// The document is not valid JSON or does not match the scene structure
    #[error("Invalid scene document: {0}")]
    Parse(#[from] serde_json::Error),

    /// `initialState` is missing while states are declared
    #[error("Scene declares states but no initialState")]
    MissingInitialState,

    /// `initialState` names a state that is not declared
    #[error("Initial state '{0}' is not defined")]
    UnknownInitialState(String),

    /// A state transition points at an undeclared state
    #[error("State '{state}': transition #{index} targets unknown state '{goto}'")]
    UnknownTarget {
        state: String,
        index: usize,
        goto: String,
    },

    /// A global event points at an undeclared state
    #[error("Global event #{index} targets unknown state '{goto}'")]
    UnknownGlobalTarget { index: usize, goto: String },

    /// An action is missing a topic or message, or names an unknown kind
    #[error("Invalid action at {location}: {reason}")]
    InvalidAction { location: String, reason: String },

    /// A time offset or delay is negative, not finite, or longer than a year
    #[error("Invalid timing at {location}: {value}")]
    InvalidTiming { location: String, value: f64 },

    /// A requested scene name cannot be mapped to a file safely
    #[error("Invalid scene name: '{0}'")]
    InvalidName(String),
}

/// Convenience type alias for scene results.
pub type Result<T> = std::result::Result<T, SceneError>;
