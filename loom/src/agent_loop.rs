//! Agent Loop Plugin (C8) — the heart of the system.
//!
//! Installs the actor-critic handler table onto an [`crate::eventic::EngineBuilder`]:
//! `AGENT_START → [TRIAGE_DECIDE] → ACTOR_CRITIC_LOOP ⇄ EXECUTE_TOOLS ⇄
//! CRITIC_EVALUATE_TOOLS → EVALUATE_TEXT_RESPONSE → FINALIZE`. Each handler
//! is a small `struct` implementing [`crate::eventic::Handler`]; state that
//! must survive across handlers within one request (the triage decision, the
//! retry preamble, the most recently produced tool calls) lives in
//! `ctx.scratch` under the well-known keys documented on each handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::AgentError;
use crate::eventic::{EngineBuilder, EventKind, EventOutcome, Handler, Plugin, Services};
use crate::history_store::HistoryStore;
use crate::llm_adapter::{LlmRequest, StreamChunk};
use crate::message::{Message, Role, ToolCall};
use crate::progress::ProgressEvent;
use crate::request_context::{terminal_progress_event, RequestContext, ResponseFormat};

/// Reserved output budget subtracted from `history_token_budget` when
/// assembling the prompt, so the model has room to respond.
const OUTPUT_RESERVE_TOKENS: usize = 512;

/// Maximum tool-exec retry remediation passes before giving up
/// (`CRITIC_EVALUATE_TOOLS` "retry with corrective guidance"); not itself a
/// configuration surface, since it bounds a soft-failure loop rather than a
/// resource.
const MAX_TOOL_RETRY_PASSES: u32 = 2;

/// Scratch keys written/read across handlers within one request.
mod scratch_keys {
    pub const RETRY_PREAMBLE: &str = "retry_preamble";
    pub const TOOL_RETRY_COUNT: &str = "tool_retry_count";
    pub const EXPLICIT_LOOP_REQUESTED: &str = "explicit_loop_requested";
    pub const CANCELLATION_MARKER: &str = "cancellation_marker";
}

fn scratch_bool(ctx: &RequestContext, key: &str) -> bool {
    ctx.scratch
        .get(key)
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn scratch_u32(ctx: &RequestContext, key: &str) -> u32 {
    ctx.scratch
        .get(key)
        .and_then(|v| v.as_u64())
        .map(|n| n as u32)
        .unwrap_or(0)
}

/// Installs the Agent Loop Plugin's handlers. `model` names the default
/// model the loop requests unless `ctx.model_override` is set.
pub struct AgentLoopPlugin {
    pub model: String,
}

impl Plugin for AgentLoopPlugin {
    fn install(self: Box<Self>, builder: &mut EngineBuilder) {
        let model = self.model.clone();
        builder
            .on(EventKind::AgentStart, Arc::new(AgentStartHandler))
            .on(EventKind::TriageDecide, Arc::new(TriageDecideHandler { model: model.clone() }))
            .on(
                EventKind::ActorCriticLoop,
                Arc::new(ActorCriticLoopHandler { model: model.clone() }),
            )
            .on(EventKind::ExecuteTools, Arc::new(ExecuteToolsHandler))
            .on(EventKind::CriticEvaluateTools, Arc::new(CriticEvaluateToolsHandler))
            .on(EventKind::EvaluateTextResponse, Arc::new(EvaluateTextResponseHandler))
            .on(EventKind::Finalize, Arc::new(FinalizeHandler));
    }
}

/// `AGENT_START`: attach metadata, append the user message, decide whether
/// triage runs. Triage runs only when `ctx.is_retry=false` and the caller did
/// not set `scratch["explicit_loop_requested"]=true`.
struct AgentStartHandler;

#[async_trait]
impl Handler for AgentStartHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        ctx.check_cancelled()?;
        tracing::debug!(request_id = %ctx.id, conversation = %ctx.conversation_name, "request started");
        services
            .progress
            .publish(ProgressEvent::RequestStarted {
                request_id: ctx.id.to_string(),
                conversation: ctx.conversation_name.clone(),
            })
            .await;
        history.append(Message::user(ctx.user_input.clone()));

        let explicit_loop = scratch_bool(ctx, scratch_keys::EXPLICIT_LOOP_REQUESTED);
        if services.config.triage_enabled && !ctx.is_retry && !explicit_loop {
            Ok(EventOutcome::Next(EventKind::TriageDecide))
        } else {
            Ok(EventOutcome::Next(EventKind::ActorCriticLoop))
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct TriageResponse {
    decision: String,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    clarification: Option<String>,
}

/// `TRIAGE_DECIDE`: a cheap, bounded LLM call classifying the request as
/// `COMPLETED` / `MISSING_INFO` / `READY`.
struct TriageDecideHandler {
    model: String,
}

#[async_trait]
impl Handler for TriageDecideHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        ctx.check_cancelled()?;
        let req = LlmRequest {
            messages: vec![
                Message::system(
                    "Classify this request. Respond with strict JSON: \
                     {\"decision\": \"COMPLETED\"|\"MISSING_INFO\"|\"READY\", \
                     \"rationale\": string?, \"clarification\": string?}. \
                     COMPLETED if you can answer directly without tools; \
                     MISSING_INFO if the request lacks information needed to proceed; \
                     READY otherwise.",
                ),
                Message::user(ctx.user_input.clone()),
            ],
            available_tools: vec![],
            model: ctx.model_override.clone().unwrap_or_else(|| self.model.clone()),
            response_format: Some(ResponseFormat::Json),
            temperature: Some(0.0),
        };
        let response = services.llm.call(&req).await?;
        let triage: TriageResponse = serde_json::from_str(response.content.trim())
            .unwrap_or(TriageResponse {
                decision: "READY".to_string(),
                rationale: None,
                clarification: None,
            });

        match triage.decision.as_str() {
            "COMPLETED" => {
                let content = triage.rationale.unwrap_or(response.content);
                history.append(Message::assistant(content.clone()));
                ctx.final_response = Some(content);
                Ok(EventOutcome::Next(EventKind::Finalize))
            }
            "MISSING_INFO" => {
                let question = triage
                    .clarification
                    .unwrap_or_else(|| "Could you provide more detail?".to_string());
                history.append(Message::assistant(question.clone()));
                ctx.final_response = Some(question);
                Ok(EventOutcome::Next(EventKind::Finalize))
            }
            _ => Ok(EventOutcome::Next(EventKind::ActorCriticLoop)),
        }
    }
}

/// `ACTOR_CRITIC_LOOP`: one turn. Builds `[system] + history.messages(budget)`,
/// optionally prefixed by a retry preamble, calls the LLM, and branches on
/// whether the response carries tool calls. Exceeding `max_turns` is a soft
/// failure routed straight to `FINALIZE`.
struct ActorCriticLoopHandler {
    model: String,
}

#[async_trait]
impl Handler for ActorCriticLoopHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        ctx.check_cancelled()?;
        ctx.turn_number += 1;
        if ctx.turn_number > ctx.max_turns {
            tracing::warn!(request_id = %ctx.id, max_turns = ctx.max_turns, "turn limit exceeded");
            ctx.errors.push(AgentError::TurnLimitExceeded);
            history.append(Message::assistant("[turn limit reached]"));
            ctx.final_response = Some("[turn limit reached]".to_string());
            return Ok(EventOutcome::Next(EventKind::Finalize));
        }

        let budget = services
            .config
            .history_token_budget
            .saturating_sub(OUTPUT_RESERVE_TOKENS);
        let mut messages = history.messages(budget);
        if let Some(preamble) = ctx.scratch.get(scratch_keys::RETRY_PREAMBLE).and_then(|v| v.as_str()) {
            messages.insert(0, Message::system(preamble.to_string()));
        }

        let req = LlmRequest {
            messages,
            available_tools: services.tools.available(),
            model: ctx.model_override.clone().unwrap_or_else(|| self.model.clone()),
            response_format: ctx.response_format.clone(),
            temperature: None,
        };

        let response = if ctx.stream {
            let ctx_ref: &RequestContext = ctx;
            let on_chunk = |chunk: StreamChunk| {
                if let StreamChunk::ContentDelta(delta) = chunk {
                    ctx_ref.emit_chunk(delta);
                }
            };
            services.llm.call_stream(&req, &on_chunk).await?
        } else {
            services.llm.call(&req).await?
        };

        let assistant_message = Message::assistant_with_tool_calls(
            if response.content.is_empty() {
                None
            } else {
                Some(response.content.clone())
            },
            response.tool_calls.clone(),
        );
        history.append(assistant_message);

        if response.tool_calls.is_empty() {
            Ok(EventOutcome::Next(EventKind::EvaluateTextResponse))
        } else {
            Ok(EventOutcome::Next(EventKind::ExecuteTools))
        }
    }
}

/// Status of one executed tool call, mirroring the `ToolCall` entity.
#[derive(Debug, Clone, PartialEq)]
enum ToolCallStatus {
    Ok,
    Error,
    Cancelled,
}

/// `EXECUTE_TOOLS`: partitions the last assistant message's tool calls into
/// parallel-safe and sequential groups, runs them, and appends results to
/// history in declared `call_id` order regardless of completion order.
struct ExecuteToolsHandler;

#[async_trait]
impl Handler for ExecuteToolsHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        let tool_calls = history
            .all_messages()
            .last()
            .and_then(|m| m.tool_calls.clone())
            .unwrap_or_default();

        let mut parallel_calls = Vec::new();
        let mut sequential_calls = Vec::new();
        for call in tool_calls {
            if services.tools.is_parallel_safe(&call.tool_name) {
                parallel_calls.push(call);
            } else {
                sequential_calls.push(call);
            }
        }

        let mut results: HashMap<String, (ToolCallStatus, String)> = HashMap::new();
        let timeout = Duration::from_millis(services.config.tool_call_timeout_ms);

        // Sequential group runs first, in declaration order, honoring cancellation.
        for call in &sequential_calls {
            if ctx.is_cancelled() {
                results.insert(call.call_id.clone(), (ToolCallStatus::Cancelled, String::new()));
                continue;
            }
            let outcome = services
                .tools
                .invoke(&call.tool_name, call.arguments.clone(), None, &ctx.cancel, timeout)
                .await;
            results.insert(call.call_id.clone(), classify_result(outcome));
        }

        // Parallel-safe group runs concurrently, bounded by the configured worker pool.
        if !parallel_calls.is_empty() {
            let worker_limit = services.config.parallel_tool_workers.max(1);
            let mut in_flight = FuturesUnordered::new();
            let mut queue = parallel_calls.into_iter();

            for call in (&mut queue).take(worker_limit) {
                in_flight.push(run_tool_call(services, ctx, call, timeout));
            }
            while let Some((call_id, outcome)) = in_flight.next().await {
                results.insert(call_id, outcome);
                if let Some(call) = queue.next() {
                    in_flight.push(run_tool_call(services, ctx, call, timeout));
                }
            }
        }

        // Append in the assistant message's original declared order.
        let declared_order = history
            .all_messages()
            .last()
            .and_then(|m| m.tool_calls.clone())
            .unwrap_or_default();
        for call in &declared_order {
            let (status, text) = results
                .remove(&call.call_id)
                .unwrap_or((ToolCallStatus::Cancelled, String::new()));
            let status_label = match status {
                ToolCallStatus::Ok => "ok",
                ToolCallStatus::Error => "error",
                ToolCallStatus::Cancelled => "cancelled",
            };
            history.append(Message::tool_result(call.call_id.clone(), text));
            services
                .progress
                .publish(ProgressEvent::RequestToolResult {
                    request_id: ctx.id.to_string(),
                    call_id: call.call_id.clone(),
                    status: status_label.to_string(),
                })
                .await;
        }

        if ctx.is_cancelled() {
            ctx.scratch.insert(
                scratch_keys::CANCELLATION_MARKER.to_string(),
                serde_json::json!(true),
            );
            history.append(Message::assistant("[cancelled]"));
            return Ok(EventOutcome::Next(EventKind::Finalize));
        }

        Ok(EventOutcome::Next(EventKind::CriticEvaluateTools))
    }
}

fn classify_result(outcome: Result<crate::tool_source::ToolCallContent, AgentError>) -> (ToolCallStatus, String) {
    match outcome {
        Ok(content) => (ToolCallStatus::Ok, content.text),
        Err(AgentError::Cancelled) => (ToolCallStatus::Cancelled, String::new()),
        Err(err) => (ToolCallStatus::Error, err.to_string()),
    }
}

async fn run_tool_call(
    services: &Services,
    ctx: &RequestContext,
    call: ToolCall,
    timeout: Duration,
) -> (String, (ToolCallStatus, String)) {
    if ctx.is_cancelled() {
        return (call.call_id, (ToolCallStatus::Cancelled, String::new()));
    }
    let outcome = services
        .tools
        .invoke(&call.tool_name, call.arguments.clone(), None, &ctx.cancel, timeout)
        .await;
    (call.call_id, classify_result(outcome))
}

/// `CRITIC_EVALUATE_TOOLS`: decides whether the tool results justify another
/// turn, a remediation retry, or a fatal finalize (cancellation).
struct CriticEvaluateToolsHandler;

#[async_trait]
impl Handler for CriticEvaluateToolsHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        _services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        if scratch_bool(ctx, scratch_keys::CANCELLATION_MARKER) {
            return Ok(EventOutcome::Next(EventKind::Finalize));
        }

        let recent_tool_results: Vec<&Message> = history
            .all_messages()
            .iter()
            .rev()
            .take_while(|m| m.role == Role::Tool)
            .collect();
        let any_error = recent_tool_results
            .iter()
            .any(|m| m.content.as_deref().is_some_and(|c| c.contains("execution error") || c.contains("timed out")));

        let retry_count = scratch_u32(ctx, scratch_keys::TOOL_RETRY_COUNT);
        if any_error && retry_count < MAX_TOOL_RETRY_PASSES {
            ctx.scratch.insert(
                scratch_keys::TOOL_RETRY_COUNT.to_string(),
                serde_json::json!(retry_count + 1),
            );
            ctx.scratch.insert(
                scratch_keys::RETRY_PREAMBLE.to_string(),
                serde_json::json!(
                    "The previous tool call failed. Correct your arguments or choose a \
                     different approach before trying again."
                ),
            );
            ctx.retry_count += 1;
        } else {
            ctx.scratch.remove(scratch_keys::RETRY_PREAMBLE);
        }
        Ok(EventOutcome::Next(EventKind::ActorCriticLoop))
    }
}

/// `EVALUATE_TEXT_RESPONSE`: sanity-checks the final text (non-empty, and
/// valid JSON when `response_format=Json` was requested).
struct EvaluateTextResponseHandler;

#[async_trait]
impl Handler for EvaluateTextResponseHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        _services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        let content = history
            .all_messages()
            .last()
            .and_then(|m| m.content.clone())
            .unwrap_or_default();

        let well_formed = !content.is_empty()
            && match ctx.response_format {
                Some(ResponseFormat::Json) => serde_json::from_str::<serde_json::Value>(&content).is_ok(),
                _ => true,
            };

        if well_formed {
            ctx.final_response = Some(content);
            return Ok(EventOutcome::Next(EventKind::Finalize));
        }

        if ctx.retry_count < MAX_TOOL_RETRY_PASSES {
            ctx.retry_count += 1;
            ctx.scratch.insert(
                scratch_keys::RETRY_PREAMBLE.to_string(),
                serde_json::json!(
                    "Your previous response was empty or did not match the requested format. \
                     Produce a complete, correctly formatted response."
                ),
            );
            Ok(EventOutcome::Next(EventKind::ActorCriticLoop))
        } else {
            ctx.final_response = Some(content);
            Ok(EventOutcome::Next(EventKind::Finalize))
        }
    }
}

/// `FINALIZE`: persists history, flushes the stream, and emits the request's
/// terminal progress event. Always produces either a terminal assistant
/// message or a `request:failed` event — never both.
struct FinalizeHandler;

#[async_trait]
impl Handler for FinalizeHandler {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<EventOutcome, AgentError> {
        if !ctx.dry_run {
            history.persist().map_err(AgentError::from)?;
        }
        if ctx.final_response.is_none() && !ctx.is_cancelled() {
            ctx.final_response = history.all_messages().last().and_then(|m| m.content.clone());
        }
        let terminal = terminal_progress_event(ctx);
        match &terminal {
            ProgressEvent::RequestCancelled { .. } => {
                tracing::warn!(request_id = %ctx.id, "request cancelled");
            }
            ProgressEvent::RequestFailed { reason, .. } => {
                tracing::error!(request_id = %ctx.id, reason = %reason, "request failed");
            }
            _ => {
                tracing::debug!(request_id = %ctx.id, "request completed");
            }
        }
        services.progress.publish(terminal).await;
        Ok(EventOutcome::Terminal)
    }
}
