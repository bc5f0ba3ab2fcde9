//! Error types for the state crate.

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A background task did not stop cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

pub type Result<T> = std::result::Result<T, StateError>;
