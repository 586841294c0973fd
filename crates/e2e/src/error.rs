//! Error types for acceptance testing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("{0} not found in PATH")]
    ToolNotFound(String),

    #[error("provider binary not found at {0}, run cargo build first")]
    ProviderNotBuilt(String),

    #[error("`{command}` exited with {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
