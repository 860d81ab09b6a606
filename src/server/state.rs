//! Application state shared across all request handlers.

use std::sync::Arc;

use crate::agent::ConversationGraph;
use crate::checkpoint::SyncedCheckpointer;

/// Shared application state.
pub struct AppState {
    /// Compiled conversation graph.
    pub graph: ConversationGraph,
    /// Persistence facade, kept for sync status and shutdown.
    pub checkpointer: Arc<SyncedCheckpointer>,
    /// Path of the streaming agent endpoint.
    pub agent_path: String,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(
        graph: ConversationGraph,
        checkpointer: Arc<SyncedCheckpointer>,
        agent_path: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            graph,
            checkpointer,
            agent_path: agent_path.into(),
        })
    }
}
