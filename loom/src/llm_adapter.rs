//! Provider-agnostic LLM request/stream interface (C5).
//!
//! This trait is the Agent Loop Plugin's seam — a request carries the full message list and
//! available tool schemas, a response carries optional tool calls, and the
//! error taxonomy is the discrete set of `AgentError::Llm*` variants rather
//! than a boxed/opaque error.
//!
//! [`RetryingAdapter`] wraps any [`LlmAdapter`] to retry `LlmTransient` and
//! `LlmRateLimited` with bounded exponential backoff — retrying transient and
//! rate-limited failures is the adapter's responsibility, not the caller's.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::AgentError;
use crate::message::Message;
use crate::request_context::ResponseFormat;
use crate::tool_source::ToolSpec;

/// One incremental delta from [`LlmAdapter::call_stream`].
#[derive(Debug, Clone)]
pub enum StreamChunk {
    ContentDelta(String),
    ToolCallOpen { call_id: String, tool_name: String },
    ToolCallArgDelta { call_id: String, delta: String },
    ToolCallClose { call_id: String },
}

/// A non-streaming or stream-assembled LLM call request.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub available_tools: Vec<ToolSpec>,
    pub model: String,
    pub response_format: Option<ResponseFormat>,
    pub temperature: Option<f32>,
}

/// The assembled response to an [`LlmRequest`].
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<crate::message::ToolCall>,
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone, Default)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Provider-agnostic surface. Implementations surface a discrete
/// `AgentError::Llm*` kind, never opaque text.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse, AgentError>;

    /// Incremental variant: `on_chunk` is invoked per delta; the returned
    /// value is the fully assembled response. Default implementation calls
    /// `call` and forwards its content as a single delta (no incremental
    /// tool-call events) for adapters that don't support true streaming.
    async fn call_stream(
        &self,
        req: &LlmRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<LlmResponse, AgentError> {
        let response = self.call(req).await?;
        if !response.content.is_empty() {
            on_chunk(StreamChunk::ContentDelta(response.content.clone()));
        }
        for call in &response.tool_calls {
            on_chunk(StreamChunk::ToolCallOpen {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
            });
            on_chunk(StreamChunk::ToolCallArgDelta {
                call_id: call.call_id.clone(),
                delta: call.arguments.to_string(),
            });
            on_chunk(StreamChunk::ToolCallClose {
                call_id: call.call_id.clone(),
            });
        }
        Ok(response)
    }
}

/// Reference, no-network [`LlmAdapter`]: always answers with the last user
/// message prefixed by [`MockLlmAdapter::prefix`], never requests a tool
/// call. Useful as a default adapter for running the engine without a real
/// provider configured (e.g. the `cli` binary with no API key set).
pub struct MockLlmAdapter {
    prefix: String,
}

impl MockLlmAdapter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for MockLlmAdapter {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl LlmAdapter for MockLlmAdapter {
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse, AgentError> {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::User)
            .and_then(|m| m.content.clone())
            .unwrap_or_default();
        Ok(LlmResponse {
            content: format!("[{}] {last_user}", self.prefix),
            tool_calls: vec![],
            usage: None,
        })
    }
}

/// Wraps an inner [`LlmAdapter`], retrying `LlmTransient`/`LlmRateLimited`
/// errors up to `max_attempts` times with exponential backoff before
/// escalating (`LlmTransient` → `LlmPermanent`).
pub struct RetryingAdapter<A> {
    inner: A,
    max_attempts: u32,
    base_delay: std::time::Duration,
}

impl<A: LlmAdapter> RetryingAdapter<A> {
    pub fn new(inner: A, max_attempts: u32, base_delay: std::time::Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.base_delay * 2u32.saturating_pow(attempt);
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl<A: LlmAdapter + Send + Sync> LlmAdapter for RetryingAdapter<A> {
    async fn call(&self, req: &LlmRequest) -> Result<LlmResponse, AgentError> {
        let mut attempt = 0;
        loop {
            match self.inner.call(req).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_llm_retryable() && attempt + 1 < self.max_attempts => {
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(AgentError::LlmTransient(detail)) => {
                    return Err(AgentError::LlmPermanent(format!(
                        "exhausted {} retries: {detail}",
                        self.max_attempts
                    )))
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn call_stream(
        &self,
        req: &LlmRequest,
        on_chunk: &(dyn Fn(StreamChunk) + Send + Sync),
    ) -> Result<LlmResponse, AgentError> {
        let mut attempt = 0;
        loop {
            match self.inner.call_stream(req, on_chunk).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_llm_retryable() && attempt + 1 < self.max_attempts => {
                    self.backoff(attempt).await;
                    attempt += 1;
                }
                Err(AgentError::LlmTransient(detail)) => {
                    return Err(AgentError::LlmPermanent(format!(
                        "exhausted {} retries: {detail}",
                        self.max_attempts
                    )))
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Bounded timeout wrapper: surfaces `LlmTransient` on elapse, per the
/// timeout policy of treating an elapsed call as a cancelled-with-error result.
pub async fn call_with_timeout<A: LlmAdapter + ?Sized>(
    adapter: &A,
    req: &LlmRequest,
    timeout: std::time::Duration,
) -> Result<LlmResponse, AgentError> {
    match tokio::time::timeout(timeout, adapter.call(req)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(AgentError::LlmTransient("llm call timed out".to_string())),
    }
}

/// **Scenario**: the mock adapter echoes the last user message under its configured prefix.
#[cfg(test)]
mod mock_adapter_tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn echoes_last_user_message_with_prefix() {
        let adapter = MockLlmAdapter::new("demo");
        let req = LlmRequest {
            messages: vec![Message::system("sys"), Message::user("hi there")],
            available_tools: vec![],
            model: "mock".to_string(),
            response_format: None,
            temperature: None,
        };
        let response = adapter.call(&req).await.unwrap();
        assert_eq!(response.content, "[demo] hi there");
        assert!(response.tool_calls.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn req() -> LlmRequest {
        LlmRequest {
            messages: vec![],
            available_tools: vec![],
            model: "mock".to_string(),
            response_format: None,
            temperature: None,
        }
    }

    struct FlakyAdapter {
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    #[async_trait]
    impl LlmAdapter for FlakyAdapter {
        async fn call(&self, _req: &LlmRequest) -> Result<LlmResponse, AgentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(AgentError::LlmTransient("temporary blip".to_string()))
            } else {
                Ok(LlmResponse {
                    content: "ok".to_string(),
                    ..Default::default()
                })
            }
        }
    }

    /// **Scenario**: a transient error that clears within the retry budget eventually succeeds.
    #[tokio::test]
    async fn retries_transient_error_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let adapter = RetryingAdapter::new(
            FlakyAdapter {
                calls: calls.clone(),
                fail_times: 2,
            },
            5,
            std::time::Duration::from_millis(1),
        );
        let response = adapter.call(&req()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    /// **Scenario**: exhausting the retry budget escalates LlmTransient to LlmPermanent.
    #[tokio::test]
    async fn exhausted_retries_escalate_to_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let adapter = RetryingAdapter::new(
            FlakyAdapter {
                calls: calls.clone(),
                fail_times: 100,
            },
            3,
            std::time::Duration::from_millis(1),
        );
        let err = adapter.call(&req()).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmPermanent(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct AuthFailAdapter;

    #[async_trait]
    impl LlmAdapter for AuthFailAdapter {
        async fn call(&self, _req: &LlmRequest) -> Result<LlmResponse, AgentError> {
            Err(AgentError::LlmAuthError {
                provider: "mock".to_string(),
                detail: "bad key".to_string(),
            })
        }
    }

    /// **Scenario**: a non-retryable error (auth) is not retried at all.
    #[tokio::test]
    async fn non_retryable_error_passes_through_immediately() {
        let adapter = RetryingAdapter::new(AuthFailAdapter, 5, std::time::Duration::from_millis(1));
        let err = adapter.call(&req()).await.unwrap_err();
        assert!(matches!(err, AgentError::LlmAuthError { .. }));
    }

    struct SlowAdapter;

    #[async_trait]
    impl LlmAdapter for SlowAdapter {
        async fn call(&self, _req: &LlmRequest) -> Result<LlmResponse, AgentError> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(LlmResponse::default())
        }
    }

    /// **Scenario**: a call exceeding its timeout surfaces as LlmTransient.
    #[tokio::test]
    async fn call_with_timeout_surfaces_transient_on_elapse() {
        let err = call_with_timeout(&SlowAdapter, &req(), std::time::Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::LlmTransient(_)));
    }
}
