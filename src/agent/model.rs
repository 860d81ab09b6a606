//! Language-model client seam and the OpenRouter implementation.

use std::future::Future;
use std::pin::Pin;

use reqwest::Client as ReqwestClient;
use rig::OneOrMany;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, ToolDefinition};
use rig::message::{AssistantContent, Message, ToolResultContent, UserContent};
use rig::providers::openrouter;
use tracing::{debug, warn};

use crate::agent::errors::{AgentError, AgentResult};
use crate::agent::tools::ToolDescriptor;
use crate::checkpoint::{ChatMessage, ChatRole, ToolCall};
use crate::config::ModelConfig;

/// Boxed future type for model calls.
pub type ModelFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A chat model able to answer a role-tagged message sequence.
pub trait ChatModel: Send + Sync {
    /// Produce exactly one assistant message, optionally carrying tool calls.
    ///
    /// # Errors
    /// Returns an error if the model call fails.
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDescriptor>,
    ) -> ModelFuture<'_, AgentResult<ChatMessage>>;
}

/// OpenRouter chat model via Rig.
pub struct OpenRouterChatModel {
    model: openrouter::CompletionModel,
    temperature: f64,
    timeout: std::time::Duration,
}

impl OpenRouterChatModel {
    /// Create a new model client.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ModelConfig) -> AgentResult<Self> {
        let api_key = config.api_key.clone().unwrap_or_else(|| {
            warn!("OPENROUTER_API_KEY is not set; model calls will be rejected");
            String::new()
        });
        let client = openrouter::Client::<ReqwestClient>::builder()
            .api_key(api_key.as_str())
            .base_url(&config.base_url)
            .build()
            .map_err(AgentError::from)?;
        let model = client.completion_model(config.model.clone());

        Ok(Self {
            model,
            temperature: config.temperature,
            timeout: config.timeout,
        })
    }
}

impl ChatModel for OpenRouterChatModel {
    fn complete(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDescriptor>,
    ) -> ModelFuture<'_, AgentResult<ChatMessage>> {
        Box::pin(async move {
            let (preamble, mut history) = split_preamble(&messages);
            let prompt = history.pop().ok_or(AgentError::EmptyConversation)?;
            let definitions: Vec<ToolDefinition> = tools.into_iter().map(Into::into).collect();

            debug!(
                history = history.len(),
                tools = definitions.len(),
                "Calling language model"
            );

            let request = self
                .model
                .completion_request(prompt)
                .preamble(preamble)
                .messages(history)
                .tools(definitions)
                .temperature(self.temperature)
                .build();

            let response = tokio::time::timeout(self.timeout, self.model.completion(request))
                .await
                .map_err(|_| AgentError::Timeout(self.timeout))??;

            Ok(into_chat_message(&response.choice))
        })
    }
}

/// Collapse system messages into a preamble and convert the rest.
fn split_preamble(messages: &[ChatMessage]) -> (String, Vec<Message>) {
    let mut preamble = Vec::new();
    let mut history = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            ChatRole::System => preamble.push(message.content.as_str()),
            ChatRole::User => history.push(Message::user(message.content.clone())),
            ChatRole::Assistant => {
                let mut parts = Vec::new();
                if !message.content.is_empty() {
                    parts.push(AssistantContent::text(message.content.clone()));
                }
                for call in &message.tool_calls {
                    parts.push(AssistantContent::tool_call(
                        call.id.clone(),
                        call.name.clone(),
                        call.arguments.clone(),
                    ));
                }
                // An assistant message with neither text nor calls carries nothing.
                if let Ok(content) = OneOrMany::many(parts) {
                    history.push(Message::Assistant { id: None, content });
                }
            }
            ChatRole::Tool => {
                let call_id = message.tool_call_id.clone().unwrap_or_default();
                history.push(Message::User {
                    content: OneOrMany::one(UserContent::tool_result(
                        call_id,
                        OneOrMany::one(ToolResultContent::text(message.content.clone())),
                    )),
                });
            }
        }
    }
    (preamble.join("\n\n"), history)
}

fn into_chat_message(choice: &OneOrMany<AssistantContent>) -> ChatMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for content in choice.iter() {
        match content {
            AssistantContent::Text(part) => text.push_str(&part.text),
            AssistantContent::ToolCall(call) => tool_calls.push(ToolCall {
                id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            }),
            _ => {}
        }
    }
    ChatMessage::assistant(text).with_tool_calls(tool_calls)
}
