use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoxError>;

#[derive(Error, Debug)]
pub enum VoxError {
    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Wake word error: {0}")]
    WakeWord(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Display error: {0}")]
    Display(String),

    #[error("Thing error: {0}")]
    Thing(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cleanup timed out after {0:?}")]
    CleanupTimeout(std::time::Duration),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
