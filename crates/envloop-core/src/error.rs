//! Error types for envloop-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] envloop_config::ConfigError),

    #[error("Infrastructure error: {0}")]
    Infra(#[from] envloop_adapter::InfraError),

    #[error("Language model error: {0}")]
    Llm(String),

    #[error("Verification output could not be parsed: {0}")]
    Parse(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Orchestrator exit code for a fatal error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoreError::Cancelled => 4,
            CoreError::InvariantViolation(_) => 5,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
