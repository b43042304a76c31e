//! Per-request isolated state carrier (C6).
//!
//! Constructed at the top of the pipeline and owned exclusively by the task
//! driving it; never shared between concurrent requests. Cancellation is a
//! tree: `cancel` is a child of whatever cancellation sources the caller
//! wires in (conversation lock wait, process shutdown, explicit interrupt),
//! via [`tokio_util::sync::CancellationToken::child_token`].

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AgentError;
use crate::progress::ProgressEvent;

/// Requested shape of the final assistant response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseFormat {
    Text,
    Json,
}

/// Caller-supplied knobs for one request, distinct from the process-wide
/// [`crate::engine_config::EngineConfig`] (these vary per call).
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub stream: bool,
    pub model_override: Option<String>,
    pub response_format: Option<ResponseFormat>,
    pub max_turns: Option<u32>,
    pub dry_run: bool,
    /// True when the caller already ran the loop once and is asking for a
    /// remediation pass (skips triage).
    pub is_retry: bool,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Ephemeral per-request state. Valid only between creation and the moment
/// `final_response` is set or cancellation fires.
pub struct RequestContext {
    pub id: Uuid,
    pub conversation_name: String,
    pub user_input: String,
    pub cancel: CancellationToken,
    pub stream: bool,
    /// Forwards incremental output to an external observer; `None` when not streaming.
    pub chunk_sink: Option<Box<dyn Fn(String) + Send + Sync>>,
    pub model_override: Option<String>,
    pub response_format: Option<ResponseFormat>,
    pub is_retry: bool,
    pub retry_count: u32,
    pub max_turns: u32,
    pub dry_run: bool,
    pub started_at: i64,
    pub final_response: Option<String>,
    pub turn_number: u32,
    pub tool_call_count: u32,
    pub errors: Vec<AgentError>,
    /// Well-known keys documented alongside each handler (e.g.
    /// `triage_decision`, `cancellation_marker`).
    pub scratch: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new(
        conversation_name: impl Into<String>,
        user_input: impl Into<String>,
        options: RequestOptions,
        parent_cancel: Option<&CancellationToken>,
        default_max_turns: u32,
    ) -> Self {
        let cancel = match parent_cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        Self {
            id: Uuid::new_v4(),
            conversation_name: conversation_name.into(),
            user_input: user_input.into(),
            cancel,
            stream: options.stream,
            chunk_sink: None,
            model_override: options.model_override,
            response_format: options.response_format,
            is_retry: options.is_retry,
            retry_count: 0,
            max_turns: options.max_turns.unwrap_or(default_max_turns),
            dry_run: options.dry_run,
            started_at: now_millis(),
            final_response: None,
            turn_number: 0,
            tool_call_count: 0,
            errors: Vec::new(),
            scratch: HashMap::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finalized(&self) -> bool {
        self.final_response.is_some()
    }

    /// Checkpoint to call before starting a new turn, before an LLM call,
    /// between tool calls, and while streaming.
    pub fn check_cancelled(&self) -> Result<(), AgentError> {
        if self.cancel.is_cancelled() {
            Err(AgentError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn emit_chunk(&self, delta: impl Into<String>) {
        if let Some(sink) = &self.chunk_sink {
            sink(delta.into());
        }
    }
}

/// Converts a terminal [`RequestContext`] into the `request:*` progress
/// event that reflects its outcome, for callers that don't need the
/// finer per-turn events.
pub fn terminal_progress_event(ctx: &RequestContext) -> ProgressEvent {
    let request_id = ctx.id.to_string();
    if ctx.is_cancelled() {
        ProgressEvent::RequestCancelled { request_id }
    } else if let Some(err) = ctx.errors.iter().find(|e| !e.is_soft_terminal()) {
        ProgressEvent::RequestFailed {
            request_id,
            reason: err.to_string(),
        }
    } else {
        ProgressEvent::RequestCompleted { request_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: a fresh context is neither cancelled nor finalized, and carries the
    /// caller's max_turns override.
    #[test]
    fn new_context_starts_clean() {
        let ctx = RequestContext::new(
            "chat",
            "hello",
            RequestOptions {
                max_turns: Some(5),
                ..Default::default()
            },
            None,
            20,
        );
        assert!(!ctx.is_cancelled());
        assert!(!ctx.is_finalized());
        assert_eq!(ctx.max_turns, 5);
        assert_eq!(ctx.turn_number, 0);
    }

    /// **Scenario**: omitting max_turns falls back to the engine default.
    #[test]
    fn missing_max_turns_uses_default() {
        let ctx = RequestContext::new("chat", "hi", RequestOptions::default(), None, 20);
        assert_eq!(ctx.max_turns, 20);
    }

    /// **Scenario**: cancelling a parent token cancels the child context's token too.
    #[test]
    fn cancellation_propagates_from_parent() {
        let parent = CancellationToken::new();
        let ctx = RequestContext::new("chat", "hi", RequestOptions::default(), Some(&parent), 20);
        assert!(!ctx.is_cancelled());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }

    /// **Scenario**: a cancelled request's terminal event is request:cancelled, not
    /// request:completed, even if no error was recorded.
    #[test]
    fn terminal_event_prefers_cancellation_over_completion() {
        let mut ctx = RequestContext::new("chat", "hi", RequestOptions::default(), None, 20);
        ctx.cancel.cancel();
        assert!(matches!(
            terminal_progress_event(&ctx),
            ProgressEvent::RequestCancelled { .. }
        ));
    }

    /// **Scenario**: a soft-terminal error (turn limit) still reports request:completed.
    #[test]
    fn soft_terminal_error_reports_completed() {
        let mut ctx = RequestContext::new("chat", "hi", RequestOptions::default(), None, 20);
        ctx.errors.push(AgentError::TurnLimitExceeded);
        assert!(matches!(
            terminal_progress_event(&ctx),
            ProgressEvent::RequestCompleted { .. }
        ));
    }

    /// **Scenario**: a hard error (auth failure) reports request:failed with its reason.
    #[test]
    fn hard_error_reports_failed() {
        let mut ctx = RequestContext::new("chat", "hi", RequestOptions::default(), None, 20);
        ctx.errors.push(AgentError::LlmAuthError {
            provider: "openai".into(),
            detail: "missing key".into(),
        });
        assert!(matches!(
            terminal_progress_event(&ctx),
            ProgressEvent::RequestFailed { .. }
        ));
    }
}
