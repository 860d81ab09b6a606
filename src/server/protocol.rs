//! AG-UI wire types for the streaming agent endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::ToolDescriptor;
use crate::checkpoint::{ChatMessage, ChatRole, ToolCall};

/// Body of a run request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAgentInput {
    /// Conversation thread; a fresh one is created when missing.
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Client-chosen run id; generated when missing.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Messages known to the client.
    #[serde(default)]
    pub messages: Vec<WireMessage>,
    /// Frontend tools available for this run.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// A message as exchanged with the frontend.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Message id.
    #[serde(default)]
    pub id: String,
    /// Author role (`developer` is accepted as `system`).
    pub role: String,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls of an assistant message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<WireToolCall>,
    /// Call answered by a tool message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// A tool call in OpenAI function-call shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Call id.
    pub id: String,
    /// Always `function`.
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    /// Function name and JSON-encoded arguments.
    pub function: WireFunction,
}

/// Function part of a tool call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireFunction {
    /// Tool name.
    pub name: String,
    /// JSON-encoded arguments.
    #[serde(default)]
    pub arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl WireMessage {
    /// Convert into a stored message. Unknown roles are rejected.
    ///
    /// # Errors
    /// Returns the offending role string.
    pub fn into_chat_message(self) -> Result<ChatMessage, String> {
        let role: ChatRole = self.role.parse()?;
        let tool_calls = self
            .tool_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            })
            .collect();
        Ok(ChatMessage {
            id: self.id,
            role,
            content: self.content.unwrap_or_default(),
            tool_calls,
            tool_call_id: self.tool_call_id,
        })
    }
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            id: message.id.clone(),
            role: message.role.as_str().to_string(),
            content: Some(message.content.clone()),
            tool_calls: message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: function_type(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: encode_arguments(&call.arguments),
                    },
                })
                .collect(),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn encode_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

/// Server-sent run event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEvent {
    /// Run accepted.
    #[serde(rename_all = "camelCase")]
    RunStarted {
        /// Thread the run belongs to.
        thread_id: String,
        /// Run id.
        run_id: String,
    },
    /// Assistant text begins.
    #[serde(rename_all = "camelCase")]
    TextMessageStart {
        /// Message id.
        message_id: String,
        /// Always `assistant`.
        role: String,
    },
    /// Assistant text chunk.
    #[serde(rename_all = "camelCase")]
    TextMessageContent {
        /// Message id.
        message_id: String,
        /// Text chunk.
        delta: String,
    },
    /// Assistant text complete.
    #[serde(rename_all = "camelCase")]
    TextMessageEnd {
        /// Message id.
        message_id: String,
    },
    /// Tool call begins.
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        /// Call id.
        tool_call_id: String,
        /// Frontend tool to run.
        tool_call_name: String,
        /// Assistant message carrying the call.
        parent_message_id: String,
    },
    /// Tool call arguments chunk.
    #[serde(rename_all = "camelCase")]
    ToolCallArgs {
        /// Call id.
        tool_call_id: String,
        /// JSON-encoded arguments.
        delta: String,
    },
    /// Tool call complete.
    #[serde(rename_all = "camelCase")]
    ToolCallEnd {
        /// Call id.
        tool_call_id: String,
    },
    /// Run complete.
    #[serde(rename_all = "camelCase")]
    RunFinished {
        /// Thread the run belongs to.
        thread_id: String,
        /// Run id.
        run_id: String,
    },
    /// Run failed.
    RunError {
        /// Error description.
        message: String,
    },
}

/// Events describing one assistant response, in emission order.
#[must_use]
pub fn response_events(response: &ChatMessage) -> Vec<RunEvent> {
    let mut events = Vec::new();
    if !response.content.is_empty() {
        events.push(RunEvent::TextMessageStart {
            message_id: response.id.clone(),
            role: ChatRole::Assistant.as_str().to_string(),
        });
        events.push(RunEvent::TextMessageContent {
            message_id: response.id.clone(),
            delta: response.content.clone(),
        });
        events.push(RunEvent::TextMessageEnd {
            message_id: response.id.clone(),
        });
    }
    for call in &response.tool_calls {
        events.push(RunEvent::ToolCallStart {
            tool_call_id: call.id.clone(),
            tool_call_name: call.name.clone(),
            parent_message_id: response.id.clone(),
        });
        events.push(RunEvent::ToolCallArgs {
            tool_call_id: call.id.clone(),
            delta: encode_arguments(&call.arguments),
        });
        events.push(RunEvent::ToolCallEnd {
            tool_call_id: call.id.clone(),
        });
    }
    events
}
