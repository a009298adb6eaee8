//! Built-in local tools.
//!
//! A minimal working set bound by default in `src/main.rs`: a playful
//! weather report, a UTC clock, and an async sleep. Deployments replace or
//! extend the list through the graph builder.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{RuntimeTool, ToolError};
use crate::quadracode::model::ToolDefinition;

/// Longest sleep `wait` will accept, in seconds.
const MAX_WAIT_SECS: u64 = 300;

/// Returns a playful weather summary for the requested city.
pub struct GetWeather;

#[async_trait]
impl RuntimeTool for GetWeather {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_weather".to_string(),
            description: "Return a playful weather summary for the requested city.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "city": {"type": "string", "description": "City to report on"}
                },
                "required": ["city"]
            }),
        }
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let city = args
            .get("city")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ToolError::InvalidParameters("city is required".to_string()))?;
        Ok(format!("It's always sunny in {}!", city))
    }
}

/// Returns the current UTC time.
pub struct GetTime;

#[async_trait]
impl RuntimeTool for GetTime {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "get_time".to_string(),
            description: "Return the current UTC time.".to_string(),
            parameters_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn invoke(&self, _args: Value) -> Result<String, ToolError> {
        Ok(Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string())
    }
}

/// Sleeps for `duration` seconds and reports completion.
pub struct Wait;

#[async_trait]
impl RuntimeTool for Wait {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "wait".to_string(),
            description: "Sleep for `duration` seconds and report completion.".to_string(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "duration": {"type": "integer", "description": "Seconds to sleep"}
                },
                "required": ["duration"]
            }),
        }
    }

    async fn invoke(&self, args: Value) -> Result<String, ToolError> {
        let duration = args
            .get("duration")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ToolError::InvalidParameters("duration must be a non-negative integer".to_string())
            })?;
        if duration > MAX_WAIT_SECS {
            return Err(ToolError::InvalidParameters(format!(
                "duration capped at {} seconds",
                MAX_WAIT_SECS
            )));
        }
        tokio::time::sleep(Duration::from_secs(duration)).await;
        Ok(format!("slept {}", duration))
    }
}

/// The default local tool set.
pub fn local_tools() -> Vec<Arc<dyn RuntimeTool>> {
    vec![Arc::new(GetWeather), Arc::new(GetTime), Arc::new(Wait)]
}
