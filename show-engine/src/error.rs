//! Error types for the show engine.

use museum_scene::SceneError;

/// Errors that can occur while running shows.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// A scene could not be loaded
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),

    /// The scene has no states to run
    #[error("Scene '{0}' has no runnable initial state")]
    NotRunnable(String),

    /// A run is already in progress
    #[error("Scene '{0}' is already running")]
    AlreadyRunning(String),

    /// A local media command could not be understood
    #[error("Invalid {kind} command '{command}'")]
    InvalidMediaCommand { kind: String, command: String },

    /// The media backend failed to execute a command
    #[error("Media player error: {0}")]
    Media(String),

    /// The controller loop is no longer running
    #[error("Show controller is not running")]
    ControllerClosed,

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A background task did not stop cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

/// Convenience type alias for engine results.
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<museum_state::StateError> for EngineError {
    fn from(error: museum_state::StateError) -> Self {
        match error {
            museum_state::StateError::Configuration(message) => EngineError::Configuration(message),
            museum_state::StateError::Shutdown(message) => EngineError::Shutdown(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = EngineError::InvalidMediaCommand {
            kind: "audio".to_string(),
            command: "VOLUME:loud".to_string(),
        };
        assert_eq!(error.to_string(), "Invalid audio command 'VOLUME:loud'");

        let error = EngineError::from(SceneError::InvalidName("../x".to_string()));
        assert_eq!(error.to_string(), "Scene error: Invalid scene name: '../x'");
    }
}
