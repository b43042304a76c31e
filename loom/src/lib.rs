//! # Loom
//!
//! An agent orchestration core: an event-dispatched actor-critic engine that
//! drives an LLM assistant through multi-turn tool-use loops, with per-
//! conversation history management and a durable background-task/checkpoint
//! subsystem.
//!
//! ## Design principles
//!
//! - **Event-dispatched, not promise-chained**: handlers are registered
//!   against named events and decide their own successor at dispatch time —
//!   see [`eventic`].
//! - **One conversation, one writer**: the [`conversation_registry`] gives
//!   each named conversation a fair, serializing lock; different
//!   conversations run fully in parallel.
//! - **Durable background work**: [`task_manager`] and
//!   [`task_checkpoint_manager`] spawn and checkpoint long-running sub-agent
//!   tasks so they survive a process restart.
//! - **Abstract provider seams**: LLM calls ([`llm_adapter`]) and tool
//!   execution ([`tool_registry`], [`tools::Tool`]) are consumed through
//!   traits — this crate ships the interface and the dispatch/registry
//!   logic around it, not concrete providers or tool implementations.
//!
//! ## Main modules
//!
//! - [`engine`]: [`engine::EngineFacade`] — process-lifetime owner of
//!   everything below; the single `submit_request(conversationName,
//!   userInput, options)` entrypoint.
//! - [`eventic`]: the dispatch core ([`eventic::Engine`],
//!   [`eventic::EngineBuilder`], [`eventic::Handler`], [`eventic::EventKind`],
//!   [`eventic::Services`]).
//! - [`agent_loop`]: [`agent_loop::AgentLoopPlugin`] — installs the
//!   triage/actor-critic/finalize handler table.
//! - [`agent_loop_controller`]: [`agent_loop_controller::AgentLoopController`]
//!   — autonomous-mode play/pause/stop/blocked state machine.
//! - [`conversation_registry`]: [`conversation_registry::ConversationRegistry`]
//!   — named, serialized conversations.
//! - [`history_store`]: [`history_store::HistoryStore`] — per-conversation
//!   message history, token-budgeted truncation, and named snapshots.
//! - [`request_context`]: [`request_context::RequestContext`] — per-request
//!   isolated state.
//! - [`llm_adapter`]: [`llm_adapter::LlmAdapter`],
//!   [`llm_adapter::RetryingAdapter`] — provider-agnostic LLM seam.
//! - [`tool_registry`]: [`tool_registry::ToolRegistry`] — tool dispatch with
//!   parallel-safety partitioning.
//! - [`tools`]: [`tools::Tool`] — the single-tool trait implementations
//!   register against.
//! - [`tool_source`]: [`tool_source::ToolSpec`], [`tool_source::ToolSource`],
//!   [`tool_source::ToolCallContext`] — tool schema and call-context types.
//! - [`task_manager`]: [`task_manager::TaskManager`] — background-task
//!   admission, queueing, lifecycle events.
//! - [`task_checkpoint_manager`]: [`task_checkpoint_manager::TaskCheckpointManager`]
//!   — periodic checkpointing and crash recovery.
//! - [`checkpoint_store`]: [`checkpoint_store::CheckpointStore`] — the WAL
//!   checkpoint store.
//! - [`progress`]: [`progress::ProgressSink`], [`progress::ProgressEvent`] —
//!   bounded pub-sub progress events, bridged to the `stream-event` crate's
//!   wire protocol via [`progress::ProgressEvent::to_protocol_event`].
//! - [`engine_config`]: [`engine_config::EngineConfig`] — layered
//!   env/`.env`/XDG configuration.
//! - [`message`]: [`Message`] (system/user/assistant/tool) and [`message::ToolCall`].
//! - [`error`]: [`AgentError`] — the crate's discrete error taxonomy.

pub mod agent_loop;
pub mod agent_loop_controller;
pub mod checkpoint_store;
pub mod conversation_registry;
pub mod engine;
pub mod engine_config;
pub mod error;
pub mod eventic;
pub mod history_store;
pub mod llm_adapter;
pub mod message;
pub mod progress;
pub mod request_context;
pub mod task_checkpoint_manager;
pub mod task_manager;
pub mod tool_registry;
pub mod tool_source;
pub mod tools;

pub use agent_loop::AgentLoopPlugin;
pub use engine::{EngineFacade, EngineFacadeConfig};
pub use engine_config::EngineConfig;
pub use error::AgentError;
pub use message::Message;

// Names left reachable only via their fully-qualified module path: several
// collide across modules (`task_manager::TaskStatus`,
// `checkpoint_store::CheckpointError`, `llm_adapter::LlmResponse`/`LlmUsage`,
// `message::ToolCall`, `tool_source::ToolCallContent` vs. `AgentLoopPlugin`'s
// own internal `ToolCallContent` usage) so this crate re-exports only the
// small set of names above at the root.
