//! Crate-wide error taxonomy.
//!
//! [`AgentError`] is the single error type returned by every fallible public
//! operation in the engine. Component-local error types (e.g.
//! [`crate::checkpoint_store::CheckpointError`]) convert into it via `#[from]`
//! where the component is consumed directly by the engine.

use thiserror::Error;

/// Discrete, enumerated error kinds. See the crate's error handling design:
/// errors are caught at exactly two layers (inside a handler, for local
/// recovery; at the top of the request pipeline, for termination) — never
/// with a catch-all in between.
#[derive(Debug, Error, Clone)]
pub enum AgentError {
    /// Cooperative cancellation. Never logged as an error.
    #[error("cancelled")]
    Cancelled,

    #[error("conversation already exists: {0}")]
    ConversationExists(String),

    #[error("conversation not found: {0}")]
    ConversationMissing(String),

    #[error("conversation busy (in-flight request): {0}")]
    ConversationBusy(String),

    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("tool '{tool_name}' execution error: {inner}")]
    ToolExecutionError { tool_name: String, inner: String },

    #[error("tool '{tool_name}' timed out")]
    ToolTimeout { tool_name: String },

    #[error("llm auth error (provider={provider}): {detail}")]
    LlmAuthError { provider: String, detail: String },

    #[error("llm rate limited{}", retry_after_ms.map(|m| format!(", retry after {m}ms")).unwrap_or_default())]
    LlmRateLimited { retry_after_ms: Option<u64> },

    #[error("llm context window exceeded")]
    LlmContextWindowExceeded,

    #[error("llm transient error: {0}")]
    LlmTransient(String),

    #[error("llm permanent error: {0}")]
    LlmPermanent(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("turn limit exceeded")]
    TurnLimitExceeded,

    /// Catch-all for component errors that do not yet have a dedicated kind
    /// (e.g. serialization failures surfaced from a store). Kept narrow and
    /// never used for control flow.
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Whether an `LLM.*` error kind is retryable by the adapter itself
    /// (bounded count, exponential backoff) before escalating to the caller.
    pub fn is_llm_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::LlmRateLimited { .. } | AgentError::LlmTransient(_)
        )
    }

    /// Whether this error is a soft/terminal-but-not-failed condition: the
    /// request still produces a terminal assistant message rather than a
    /// `request:failed` event.
    pub fn is_soft_terminal(&self) -> bool {
        matches!(self, AgentError::TurnLimitExceeded | AgentError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// **Scenario**: rate-limited error includes the retry-after hint in its message when present.
    #[test]
    fn rate_limited_display_includes_retry_after_when_present() {
        let with_retry = AgentError::LlmRateLimited {
            retry_after_ms: Some(1500),
        };
        assert!(with_retry.to_string().contains("1500"));

        let without_retry = AgentError::LlmRateLimited {
            retry_after_ms: None,
        };
        assert!(!without_retry.to_string().contains("retry after"));
    }

    /// **Scenario**: only transient/rate-limited LLM errors are adapter-retryable.
    #[test]
    fn only_transient_and_rate_limited_are_llm_retryable() {
        assert!(AgentError::LlmTransient("timeout".into()).is_llm_retryable());
        assert!(AgentError::LlmRateLimited { retry_after_ms: None }.is_llm_retryable());
        assert!(!AgentError::LlmPermanent("bad request".into()).is_llm_retryable());
        assert!(!AgentError::LlmAuthError {
            provider: "openai".into(),
            detail: "missing key".into()
        }
        .is_llm_retryable());
    }

    /// **Scenario**: turn-limit and cancellation are soft terminals, not hard failures.
    #[test]
    fn turn_limit_and_cancelled_are_soft_terminal() {
        assert!(AgentError::TurnLimitExceeded.is_soft_terminal());
        assert!(AgentError::Cancelled.is_soft_terminal());
        assert!(!AgentError::ToolNotFound("x".into()).is_soft_terminal());
    }
}
