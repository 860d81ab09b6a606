//! Frontend-supplied tool descriptors.
//!
//! Tools are executed by the frontend. The backend only advertises them to
//! the model and relays the resulting tool calls.

use rig::completion::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A tool the frontend can execute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, as the model will call it.
    pub name: String,
    /// What the tool does.
    #[serde(default)]
    pub description: String,
    /// JSON schema of the arguments.
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    json!({ "type": "object", "properties": {} })
}

impl From<ToolDescriptor> for ToolDefinition {
    fn from(tool: ToolDescriptor) -> Self {
        Self {
            name: tool.name,
            description: tool.description,
            parameters: tool.parameters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parameters_default_to_empty_object() {
        let tool: ToolDescriptor =
            serde_json::from_str(r#"{"name":"addTask","description":"Add a task"}"#).unwrap();
        assert_eq!(tool.parameters["type"], "object");

        let definition = ToolDefinition::from(tool);
        assert_eq!(definition.name, "addTask");
        assert_eq!(definition.description, "Add a task");
    }
}
