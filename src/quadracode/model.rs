//! Provider-agnostic model seam for the reasoning graph's driver node.
//!
//! The core never talks to a concrete LLM. The driver node is handed an
//! [`Arc<dyn ModelClient>`] and invokes it with the framed message list plus
//! the tool definitions of the bound tool set; whatever comes back is
//! appended to the thread as an assistant turn. Deployments implement
//! [`ModelClient`] over their provider of choice; tests script it.
//!
//! All implementations must be thread-safe (`Send + Sync`) so the runtime can
//! share them between the poll task and in-flight graph invocations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;

use super::chat::{ChatMessage, Role};

/// A single tool call requested by the model in an assistant turn.
///
/// The model assigns an opaque [`id`](ToolCall::id) to each call so the tool
/// node can correlate the result back in a follow-up tool turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Model-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the bound [`ToolDefinition`]s.
    pub name: String,
    /// JSON arguments supplied by the model for this call.
    #[serde(default)]
    pub args: Value,
}

/// Schema of one tool as advertised to the model alongside a chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: Value,
}

/// Errors surfaced by a model call.
///
/// The graph never propagates these: either kind becomes an assistant error
/// turn on the thread and the invocation ends.
#[derive(Debug)]
pub enum ModelError {
    /// The call did not complete within its deadline.
    Timeout(String),
    /// The provider rejected or failed the call.
    Provider(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::Timeout(msg) => write!(f, "model call timed out: {}", msg),
            ModelError::Provider(msg) => write!(f, "model call failed: {}", msg),
        }
    }
}

impl Error for ModelError {}

/// Interface between the driver node and a concrete reasoning model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one model round over the framed message list.
    ///
    /// `tools` carries the definitions of every tool bound to the graph; an
    /// implementation that supports native function calling forwards them and
    /// returns assistant turns whose [`ChatMessage::tool_calls`] are
    /// populated. Implementations without tool support may ignore the
    /// parameter and always return plain assistant turns.
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatMessage, ModelError>;

    /// Identifier of the underlying model (e.g. `"claude-sonnet-4"`).
    fn model_name(&self) -> &str;
}

/// Deterministic stand-in model that echoes the last non-system turn.
///
/// This is what `src/main.rs` binds when no real provider client has been
/// wired in, keeping a freshly deployed runtime responsive end-to-end. It
/// never requests tools.
pub struct EchoModel;

impl EchoModel {
    /// Create the echo model.
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for EchoModel {
    async fn send_message(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatMessage, ModelError> {
        let content = messages
            .iter()
            .rev()
            .find(|m| m.role != Role::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatMessage::ai(content))
    }

    fn model_name(&self) -> &str {
        "echo"
    }
}
