//! Context passed into tool calls for the current request.
//!
//! Used by tools that need access to the current conversation (e.g. a
//! short-term-memory tool's `get_recent_messages`). The Agent Loop Plugin
//! builds one of these before each `EXECUTE_TOOLS` dispatch.

use crate::message::Message;

/// Per-request context available to tools during execution.
///
/// Tool implementations that don't need conversation context ignore this
/// (it's an `Option<&ToolCallContext>` parameter on [`crate::tools::Tool::call`]).
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    /// Recent messages in the current conversation.
    pub recent_messages: Vec<Message>,

    /// The conversation this tool call belongs to.
    pub thread_id: Option<String>,

    /// Optional user id for multi-tenant or store-namespace use.
    pub user_id: Option<String>,
}

impl ToolCallContext {
    /// Creates a new context with the given messages; `thread_id`/`user_id` unset.
    pub fn new(recent_messages: Vec<Message>) -> Self {
        Self {
            recent_messages,
            thread_id: None,
            user_id: None,
        }
    }
}
