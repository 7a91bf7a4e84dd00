//! Wire models shared by the relay server and its clients.
//!
//! Field names follow the JSON bodies exchanged over `/api/*`, which use
//! camelCase keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Placeholder reported to the assistant when a tool returned nothing.
pub const EMPTY_TOOL_OUTPUT: &str = "done";

// === Conversation ===

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Prefix used when a transcript is flattened into plain text.
    #[must_use]
    pub fn transcript_prefix(self) -> &'static str {
        match self {
            Role::System => "System: ",
            Role::User => "User: ",
            Role::Assistant => "Assistant: ",
        }
    }
}

/// A single conversation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

// === Tool calls ===

/// Function part of a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, exactly as produced by the assistant.
    #[serde(default)]
    pub arguments: String,
}

/// A tool invocation requested by the assistant.
///
/// Serialized in the assistant service's own shape
/// (`{"id","type":"function","function":{"name","arguments"}}`) so clients
/// can route on `type` and `function.name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallDescriptor {
    pub id: String,
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: String,
    pub function: FunctionCall,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

impl ToolCallDescriptor {
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            call_type: default_tool_call_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    #[must_use]
    pub fn arguments(&self) -> &str {
        &self.function.arguments
    }

    #[must_use]
    pub fn is_function(&self) -> bool {
        self.call_type == "function"
    }
}

/// Output of one tool call, ready to be submitted to the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    #[serde(rename = "tool_call_id")]
    pub tool_call_id: String,
    pub output: String,
}

/// Flatten a tool result reported by a client into the text the assistant
/// receives. Structured values are JSON-encoded; empty results become
/// [`EMPTY_TOOL_OUTPUT`].
#[must_use]
pub fn tool_output_text(output: &Value) -> String {
    match output {
        Value::Null => EMPTY_TOOL_OUTPUT.to_string(),
        Value::String(text) if text.is_empty() => EMPTY_TOOL_OUTPUT.to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| EMPTY_TOOL_OUTPUT.to_string()),
    }
}

// === HTTP bodies ===

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub use_tool: bool,
    /// Room the session is attached to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Client clock in epoch milliseconds, covered by `sign`.
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    pub assistant_id: String,
    #[serde(default)]
    pub sign: String,
}

impl GenerateRequest {
    /// Content of the last message, the part of the body the signature covers.
    #[must_use]
    pub fn last_message_content(&self) -> &str {
        self.messages
            .last()
            .map(|message| message.content.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyCallRequest {
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub tool_call_id: Option<String>,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub user_message: String,
    #[serde(default)]
    pub chat_log: String,
    #[serde(default)]
    pub current_model: String,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomActionRequest {
    pub room_id: String,
    pub description: String,
    #[serde(default)]
    pub reaction_expected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

/// Error payload carried by every non-2xx relay response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_call_descriptor_defaults_type_and_arguments() {
        let call: ToolCallDescriptor =
            serde_json::from_str(r#"{"id":"tc1","function":{"name":"foo"}}"#).unwrap();
        assert_eq!(call.id, "tc1");
        assert_eq!(call.function_name(), "foo");
        assert_eq!(call.arguments(), "");
        assert!(call.is_function());
    }

    #[test]
    fn tool_output_text_flattens_values() {
        assert_eq!(tool_output_text(&json!("clicked")), "clicked");
        assert_eq!(tool_output_text(&json!("")), EMPTY_TOOL_OUTPUT);
        assert_eq!(tool_output_text(&Value::Null), EMPTY_TOOL_OUTPUT);
        assert_eq!(tool_output_text(&json!({"ok": true})), r#"{"ok":true}"#);
        assert_eq!(tool_output_text(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn generate_request_uses_camel_case_keys() {
        let req: GenerateRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "time": 1700000000000i64,
            "assistantId": "asst_1",
            "sign": "abc",
        }))
        .unwrap();
        assert_eq!(req.assistant_id, "asst_1");
        assert_eq!(req.last_message_content(), "hi");
        assert!(req.pass.is_none());
    }
}
