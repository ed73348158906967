use thiserror::Error;
use tokio::task::JoinError;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler exited with status {0}")]
    CompileFailed(i32),

    #[error("GDB error ({command}): {msg}")]
    Mi { command: String, msg: String },

    #[error("GDB timeout")]
    GdbTimeout,

    #[error("GDB busy")]
    GdbBusy,

    #[error("GDB quit")]
    GdbQuit,

    #[error("malformed MI record: {0}")]
    MalformedRecord(String),

    #[error("no source mapping for {0}")]
    MissingMapping(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("parse int error: {0}")]
    ParseIntError(#[from] std::num::ParseIntError),

    #[error("parse JSON error: {0}")]
    ParseJsonError(#[from] serde_json::error::Error),

    #[error("{0}")]
    AnyhowError(#[from] anyhow::Error),

    #[error("task join error: {0}")]
    JoinError(#[from] JoinError),
}

/// Application result type
pub type AppResult<T> = Result<T, AppError>;
