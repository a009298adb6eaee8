//! Chat-turn primitives shared by the reasoning graph and the wire payloads.
//!
//! A conversation thread is an ordered list of [`ChatMessage`]s. The same
//! representation is used in three places: the per-thread checkpoint, the
//! `messages` list a [`ModelClient`](crate::quadracode::model::ModelClient)
//! consumes, and the serialized `payload.messages` field that carries turns
//! between runtimes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::ToolCall;

/// Role of a chat turn.
///
/// Serializes as `"system"`, `"human"`, `"ai"`, or `"tool"`; the `"user"` and
/// `"assistant"` aliases are accepted on deserialization so histories written
/// by other stacks decode cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Priming/framing turn injected by the driver node.
    System,
    /// A turn authored by a user or an upstream runtime.
    #[serde(alias = "user")]
    Human,
    /// A model response; may carry structured tool calls.
    #[serde(alias = "assistant")]
    Ai,
    /// The result of a single tool invocation.
    Tool,
}

/// One turn in a conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who authored the turn.
    pub role: Role,
    /// The turn body.
    #[serde(default)]
    pub content: String,
    /// Tool calls requested by an assistant turn; empty for all other roles.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool name; set on tool turns only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Correlates a tool turn back to the assistant call that requested it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Build a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    /// Build a human turn.
    pub fn human(content: impl Into<String>) -> Self {
        Self::plain(Role::Human, content)
    }

    /// Build an assistant turn without tool calls.
    pub fn ai(content: impl Into<String>) -> Self {
        Self::plain(Role::Ai, content)
    }

    /// Build an assistant turn that requests tool invocations.
    pub fn ai_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Ai,
            content: content.into(),
            tool_calls,
            name: None,
            tool_call_id: None,
        }
    }

    /// Build a tool-result turn correlated to a prior assistant call.
    pub fn tool(
        name: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            name: Some(name.into()),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            name: None,
            tool_call_id: None,
        }
    }
}

/// Serialize a turn list into JSON values for a `payload.messages` field.
pub fn messages_to_values(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        .collect()
}

/// Decode a `payload.messages` list back into turns.
///
/// Strict: any entry that fails to decode rejects the whole list, so that
/// callers can fall back to an empty history rather than splice a partial one.
pub fn messages_from_values(values: &[Value]) -> Result<Vec<ChatMessage>, serde_json::Error> {
    values
        .iter()
        .map(|v| serde_json::from_value::<ChatMessage>(v.clone()))
        .collect()
}

/// Content of the last turn, or the empty string for an empty list.
pub fn last_message_content(messages: &[ChatMessage]) -> String {
    messages
        .last()
        .map(|m| m.content.clone())
        .unwrap_or_default()
}
