//! Single-turn execution against the chat model.

use std::sync::Arc;

use tracing::info;

use crate::agent::errors::{AgentError, AgentResult};
use crate::agent::model::ChatModel;
use crate::agent::tools::ToolDescriptor;
use crate::checkpoint::{ChatMessage, ChatRole};

/// System prompt prepended to every turn.
pub const SYSTEM_PROMPT: &str = "You are Kira, an intelligent and efficient calendar assistant.

Your capabilities:
- Help users schedule events and manage their calendar
- Add, update, and delete calendar events
- Manage tasks in the user's inbox
- Provide smart scheduling suggestions
- Answer questions about the user's schedule

Guidelines:
- Be concise and friendly
- Always confirm actions before executing them
- Suggest optimal time slots when scheduling
- Respect the user's working hours (6 AM - 10 PM by default)
- Check for conflicts before adding events";

/// Runs one conversation turn: system prompt plus history in, one
/// assistant message out.
#[derive(Clone)]
pub struct TurnExecutor {
    model: Arc<dyn ChatModel>,
    system_prompt: String,
}

impl TurnExecutor {
    /// Create an executor with the default Kira prompt.
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    /// Override the system prompt.
    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// System prompt in use.
    #[must_use]
    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// Produce the next message for `history`, binding `tools` for this call only.
    ///
    /// # Errors
    /// Returns an error if the history has no non-system message or the
    /// model call fails.
    pub async fn execute(
        &self,
        history: &[ChatMessage],
        tools: Vec<ToolDescriptor>,
    ) -> AgentResult<ChatMessage> {
        if history.iter().all(|message| message.role == ChatRole::System) {
            return Err(AgentError::EmptyConversation);
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(history.iter().cloned());

        let response = self.model.complete(messages, tools).await?;
        info!(
            tool_calls = response.tool_calls.len(),
            chars = response.content.len(),
            "Turn executed"
        );
        Ok(response)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::fakes::ScriptedModel;
    use super::*;

    fn tool(name: &str) -> ToolDescriptor {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    #[tokio::test]
    async fn test_execute_prepends_system_prompt_and_passes_tools() {
        let model = ScriptedModel::replying(vec![Ok(ChatMessage::assistant("Done."))]);
        let executor = TurnExecutor::new(model.clone());

        let history = vec![ChatMessage::user("Schedule gym at 7")];
        let reply = executor
            .execute(&history, vec![tool("addEvent")])
            .await
            .unwrap();
        assert_eq!(reply.content, "Done.");

        let requests = model.requests.lock().unwrap();
        let (messages, tools) = &requests[0];
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, ChatRole::System);
        assert!(messages[0].content.starts_with("You are Kira"));
        assert_eq!(messages[1].content, "Schedule gym at 7");
        assert_eq!(tools[0].name, "addEvent");
    }

    #[tokio::test]
    async fn test_execute_rejects_empty_history() {
        let model = ScriptedModel::replying(Vec::new());
        let executor = TurnExecutor::new(model.clone()).with_system_prompt("Test prompt");
        assert_eq!(executor.system_prompt(), "Test prompt");

        let err = executor.execute(&[], Vec::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::EmptyConversation));
        assert!(model.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_model_errors_are_not_retried() {
        let model = ScriptedModel::replying(vec![Err(AgentError::Timeout(Duration::from_secs(1)))]);
        let executor = TurnExecutor::new(model.clone());

        let err = executor
            .execute(&[ChatMessage::user("hi")], Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert_eq!(model.requests.lock().unwrap().len(), 1);
    }
}
