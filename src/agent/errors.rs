//! Error types for turn execution.

use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::CheckpointError;

/// Agent error type.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Loading or persisting a checkpoint failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    /// HTTP client error from Rig.
    #[error("http client error: {0}")]
    HttpClient(#[from] rig::http_client::Error),
    /// Completion error.
    #[error("completion error: {0}")]
    Completion(#[from] rig::completion::CompletionError),
    /// The model did not answer in time.
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    /// Nothing to send to the model.
    #[error("conversation has no user-visible messages")]
    EmptyConversation,
}

/// Convenience result alias for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;
