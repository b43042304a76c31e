//! Conversation message type: a single turn in a conversation's history.
//!
//! A [`Message`] carries a role, optional text content, and an optional ordered
//! list of tool calls (for `role=assistant`) or a single tool-call binding (for
//! `role=tool`). This is the on-disk and in-memory unit the [`crate::history_store`]
//! and [`crate::agent_loop`] operate on.

use serde::{Deserialize, Serialize};

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One requested tool invocation attached to an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique within the request that produced it; binds a later `role=tool`
    /// message's `tool_call_id` back to this call.
    pub call_id: String,
    pub tool_name: String,
    /// Opaque structured argument blob, as returned by the LLM.
    pub arguments: serde_json::Value,
}

/// One turn in a conversation.
///
/// Invariants (enforced by callers, not this type): a `role=tool` message's
/// `tool_call_id` must reference a `call_id` present in some earlier assistant
/// message's `tool_calls`; an assistant message has non-empty `content`,
/// non-empty `tool_calls`, or both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default = "now_millis")]
    pub timestamp: i64,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn assistant_with_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
            timestamp: now_millis(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            timestamp: now_millis(),
        }
    }

    pub fn is_valid_assistant(&self) -> bool {
        if self.role != Role::Assistant {
            return true;
        }
        let has_content = self.content.as_deref().is_some_and(|c| !c.is_empty());
        let has_tool_calls = self.tool_calls.as_ref().is_some_and(|t| !t.is_empty());
        has_content || has_tool_calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: constructing each role helper sets the expected role and content.
    #[test]
    fn role_helpers_set_expected_fields() {
        assert_eq!(Message::system("sys").role, Role::System);
        assert_eq!(Message::user("hi").content.as_deref(), Some("hi"));
        assert_eq!(Message::assistant("hey").role, Role::Assistant);
    }

    /// **Scenario**: a tool message always carries the call id it answers.
    #[test]
    fn tool_result_carries_call_id() {
        let m = Message::tool_result("call-1", "42");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call-1"));
    }

    /// **Scenario**: an assistant message with neither content nor tool calls is invalid.
    #[test]
    fn assistant_requires_content_or_tool_calls() {
        let empty = Message {
            role: Role::Assistant,
            content: None,
            tool_calls: None,
            tool_call_id: None,
            timestamp: 0,
        };
        assert!(!empty.is_valid_assistant());

        let with_tool_calls = Message::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "now".into(),
                arguments: serde_json::json!({}),
            }],
        );
        assert!(with_tool_calls.is_valid_assistant());
    }

    /// Non-assistant messages are never subject to the content-or-tool-calls rule.
    #[test]
    fn non_assistant_always_valid() {
        let m = Message {
            role: Role::User,
            content: None,
            tool_calls: None,
            tool_call_id: None,
            timestamp: 0,
        };
        assert!(m.is_valid_assistant());
    }
}
