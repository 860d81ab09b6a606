//! Conversation graph: one chat node, one edge to the end.
//!
//! Each invocation loads the thread's latest checkpoint, merges the inbound
//! messages, checkpoints them, runs the chat node and checkpoints again.

use std::sync::Arc;

use tracing::{info, warn};

use crate::agent::errors::{AgentError, AgentResult};
use crate::agent::executor::TurnExecutor;
use crate::agent::tools::ToolDescriptor;
use crate::checkpoint::{
    ChatMessage, ChatRole, Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointStore,
    ConversationState, ThreadId,
};

/// Result of one graph invocation.
#[derive(Clone, Debug)]
pub struct TurnOutcome {
    /// Checkpoint written after the chat node ran.
    pub checkpoint: Checkpoint,
    /// Message produced by the chat node.
    pub response: ChatMessage,
}

/// Compiled conversation graph bound to a checkpoint store.
#[derive(Clone)]
pub struct ConversationGraph {
    store: Arc<dyn CheckpointStore>,
    executor: TurnExecutor,
}

impl ConversationGraph {
    /// Bind an executor to a persistence backend.
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, executor: TurnExecutor) -> Self {
        Self { store, executor }
    }

    /// Run one turn on `thread_id`.
    ///
    /// # Errors
    /// Returns an error if a checkpoint cannot be read or written, if there is
    /// nothing to answer, or if the chat node fails. Nothing is written when
    /// there is nothing to answer; the inbound messages are already persisted
    /// when the chat node fails.
    pub async fn invoke(
        &self,
        thread_id: ThreadId,
        input: Vec<ChatMessage>,
        tools: Vec<ToolDescriptor>,
    ) -> AgentResult<TurnOutcome> {
        let previous = self.store.latest(thread_id.clone()).await?;
        let step = previous.as_ref().map_or(0, |checkpoint| checkpoint.metadata.step);
        let mut state = previous.map(|checkpoint| checkpoint.state).unwrap_or_default();
        state.merge(input);
        if state.messages.iter().all(|message| message.role == ChatRole::System) {
            return Err(AgentError::EmptyConversation);
        }

        let input_checkpoint = self
            .store
            .put(
                thread_id.clone(),
                CheckpointMetadata {
                    source: CheckpointSource::Input,
                    step,
                },
                state.clone(),
            )
            .await?;

        let response = match self.executor.execute(&state.messages, tools).await {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    thread_id = %thread_id,
                    seq = input_checkpoint.seq,
                    error = %err,
                    "Chat node failed; inbound messages kept"
                );
                return Err(err);
            }
        };

        state.merge([response.clone()]);
        let checkpoint = self
            .store
            .put(
                thread_id.clone(),
                CheckpointMetadata {
                    source: CheckpointSource::Loop,
                    step: step + 1,
                },
                state,
            )
            .await?;

        info!(
            thread_id = %thread_id,
            seq = checkpoint.seq,
            step = checkpoint.metadata.step,
            "Turn persisted"
        );
        Ok(TurnOutcome {
            checkpoint,
            response,
        })
    }

    /// Current conversation state of a thread (empty for unknown threads).
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn state(&self, thread_id: ThreadId) -> AgentResult<ConversationState> {
        Ok(self
            .store
            .latest(thread_id)
            .await?
            .map(|checkpoint| checkpoint.state)
            .unwrap_or_default())
    }

    /// Checkpoint history of a thread, newest first.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn history(&self, thread_id: ThreadId, limit: usize) -> AgentResult<Vec<Checkpoint>> {
        Ok(self.store.list(thread_id, limit).await?)
    }
}
