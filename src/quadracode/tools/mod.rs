//! Tool seam for the reasoning graph's tool node.
//!
//! The core does not interpret tool semantics. A collaborator supplies a list
//! of [`RuntimeTool`]s when building the graph; the tool node looks calls up
//! by name, invokes them, and appends the result (or an error marker) as a
//! tool turn. A call that names an unknown tool produces the turn
//! `error: unknown tool <name>` and control returns to the driver.
//!
//! The [`local`] submodule ships a small built-in set so an out-of-the-box
//! agent profile has a working tool node.

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt;

use super::model::ToolDefinition;

pub mod local;

pub use local::{local_tools, GetTime, GetWeather, Wait};

/// Errors a tool may surface from [`RuntimeTool::invoke`].
///
/// Either variant is folded into the tool turn as `error: <cause>`; tool
/// failures never abort a graph invocation.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// The provided JSON arguments failed validation.
    InvalidParameters(String),
    /// The tool ran and failed.
    ExecutionFailed(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::InvalidParameters(msg) => write!(f, "invalid parameters: {}", msg),
            ToolError::ExecutionFailed(msg) => write!(f, "tool execution failed: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// A tool invokable from the reasoning graph.
#[async_trait]
pub trait RuntimeTool: Send + Sync {
    /// The schema advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Execute with the model-supplied JSON arguments.
    async fn invoke(&self, args: Value) -> Result<String, ToolError>;
}
