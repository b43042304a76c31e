//! Tool call context, schema, and result types shared by [`crate::tools::Tool`]
//! and [`crate::tool_registry::ToolRegistry`].

mod context;

pub use context::ToolCallContext;

use serde::{Deserialize, Serialize};

/// Declarative capabilities attached to a [`ToolSpec`], consulted by the
/// Agent Loop Plugin's `EXECUTE_TOOLS` handler to decide parallel vs.
/// sequential execution and by callers that need confirmation gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ToolCapabilities {
    #[serde(default)]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub parallel_safe: bool,
}

/// Declarative description of a tool: name, description, JSON parameter
/// schema, and capabilities. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub capabilities: ToolCapabilities,
}

/// Text content returned by a successful tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallContent {
    pub text: String,
}

/// Error from a tool call or tool source lookup.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolSourceError {
    #[error("invalid tool input: {0}")]
    InvalidInput(String),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("tool transport error: {0}")]
    Transport(String),
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("tool timed out")]
    Timeout,
    #[error("tool call cancelled")]
    Cancelled,
}

impl From<ToolSourceError> for crate::error::AgentError {
    fn from(e: ToolSourceError) -> Self {
        match e {
            ToolSourceError::NotFound(name) => crate::error::AgentError::ToolNotFound(name),
            ToolSourceError::Cancelled => crate::error::AgentError::Cancelled,
            ToolSourceError::Timeout => crate::error::AgentError::ToolTimeout {
                tool_name: String::new(),
            },
            other => crate::error::AgentError::ToolExecutionError {
                tool_name: String::new(),
                inner: other.to_string(),
            },
        }
    }
}

/// A source of one or more tools, aggregatable behind [`crate::tool_registry::ToolRegistry`].
///
/// Kept as a narrow interface contract: production tool implementations
/// (file I/O, shell, browser automation, MCP, ...) are external collaborators
/// consumed through this trait, not shipped by this crate.
#[async_trait::async_trait]
pub trait ToolSource: Send + Sync {
    fn specs(&self) -> Vec<ToolSpec>;

    async fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: Option<&ToolCallContext>,
    ) -> Result<ToolCallContent, ToolSourceError>;
}
