use thiserror::Error;

use crate::types::{RunStatus, upstream::UpstreamError};

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: RunStatus, to: RunStatus },

    #[error("Upstream failure: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Job expired: {0}")]
    Expired(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Whether a job that failed with this error should be handed back to the
    /// queue for another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Upstream(err) => err.retryable(),
            OrchestratorError::NotFound(_)
            | OrchestratorError::InvalidStateTransition { .. }
            | OrchestratorError::Serialization(_)
            | OrchestratorError::InvalidPayload(_)
            | OrchestratorError::Config(_) => false,
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
