//! Conversation engine.
//!
//! - `model`: chat model seam and the OpenRouter client
//! - `executor`: single-turn execution with the Kira prompt
//! - `graph`: checkpointed turn sequencing
//! - `tools`: frontend tool descriptors

pub mod errors;
pub mod executor;
pub mod graph;
pub mod model;
pub mod tools;

pub use errors::{AgentError, AgentResult};
pub use executor::{SYSTEM_PROMPT, TurnExecutor};
pub use graph::{ConversationGraph, TurnOutcome};
pub use model::{ChatModel, ModelFuture, OpenRouterChatModel};
pub use tools::ToolDescriptor;
