//! Error types for container adapters
//!
//! Infrastructure failures only. A command exiting nonzero is a normal
//! `ExecResult`, never an error.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InfraError {
    #[error("Failed to connect to container runtime: {0}")]
    ConnectionError(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Image not found: {0}")]
    ImageNotFound(String),

    #[error("Build failed: {0}")]
    BuildError(String),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("Container has not been started")]
    NotStarted,

    #[error("exec timeout must be at least 1 second")]
    InvalidTimeout,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<bollard::errors::Error> for InfraError {
    fn from(e: bollard::errors::Error) -> Self {
        InfraError::RuntimeError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, InfraError>;
