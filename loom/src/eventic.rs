//! Event-dispatched handler registry (C7) — the Eventic engine.
//!
//! Open, name-keyed dispatch instead of a precompiled edge map: a handler
//! decides its own successor event at runtime rather than the engine
//! resolving a static edge, since handlers are free to dispatch further
//! events, forming a call tree.
//!
//! Plugins register handlers at construction time only; [`EngineBuilder::build`]
//! freezes the table — there is no hot-registration hazard because nothing
//! can register after that point.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AgentError;
use crate::history_store::HistoryStore;
use crate::request_context::RequestContext;

/// One of the named events a handler may be registered against. The Eventic
/// engine itself assigns no meaning to these beyond dispatch — the Agent
/// Loop Plugin (C8) is what gives them actor-critic semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStart,
    TriageDecide,
    ActorCriticLoop,
    ExecuteTools,
    CriticEvaluateTools,
    EvaluateTextResponse,
    Finalize,
}

/// What a handler wants dispatched next.
pub enum EventOutcome {
    /// Dispatch another event immediately.
    Next(EventKind),
    /// This was the terminal handler; dispatch stops.
    Terminal,
}

/// A capability bundle passed explicitly to every handler invocation, scoped
/// to the dispatch call — no handler holds a long-lived reference to it,
/// replacing a facade-with-many-fields design with an explicit, scoped bundle.
pub struct Services {
    pub tools: Arc<crate::tool_registry::ToolRegistry>,
    pub llm: Arc<dyn crate::llm_adapter::LlmAdapter>,
    pub progress: crate::progress::ProgressSink,
    pub config: Arc<crate::engine_config::EngineConfig>,
}

/// A handler bound to one [`EventKind`]. Implementors read/write `ctx` and
/// the active conversation's `history`, using `services` for tool/LLM access.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<EventOutcome, AgentError>;
}

/// Registers one or more handlers and exposes engine capabilities. Installed
/// at construction via [`EngineBuilder::use_plugin`].
pub trait Plugin {
    fn install(self: Box<Self>, builder: &mut EngineBuilder);
}

/// Builds an [`Engine`] by registering handlers, directly or via plugins.
#[derive(Default)]
pub struct EngineBuilder {
    handlers: HashMap<EventKind, Arc<dyn Handler>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `event`. At most one handler per event name;
    /// a later call for the same event replaces the earlier one.
    pub fn on(&mut self, event: EventKind, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(event, handler);
        self
    }

    pub fn use_plugin(&mut self, plugin: impl Plugin + 'static) -> &mut Self {
        Box::new(plugin).install(self);
        self
    }

    /// Freezes the handler table into a dispatchable [`Engine`].
    pub fn build(self) -> Engine {
        Engine {
            handlers: self.handlers,
        }
    }
}

/// A single-process event-dispatch core holding no global mutable state:
/// many `dispatch` calls may be in flight concurrently provided they operate
/// on disjoint [`RequestContext`]s.
pub struct Engine {
    handlers: HashMap<EventKind, Arc<dyn Handler>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Invokes the handler registered for `start`, then follows
    /// `EventOutcome::Next` links until a handler returns `Terminal`.
    /// Cancellation on `ctx` aborts dispatch at the next loop iteration
    /// (the next cancellation checkpoint).
    pub async fn dispatch(
        &self,
        start: EventKind,
        ctx: &mut RequestContext,
        history: &mut HistoryStore,
        services: &Services,
    ) -> Result<(), AgentError> {
        let mut current = start;
        loop {
            if let Err(err) = ctx.check_cancelled() {
                tracing::warn!(request_id = %ctx.id, event = ?current, "dispatch aborted by cancellation");
                return Err(err);
            }
            tracing::debug!(request_id = %ctx.id, event = ?current, "dispatching event");
            let handler = self
                .handlers
                .get(&current)
                .ok_or_else(|| AgentError::Other(format!("no handler registered for {current:?}")))?
                .clone();
            match handler.handle(ctx, history, services).await? {
                EventOutcome::Next(next) => current = next,
                EventOutcome::Terminal => return Ok(()),
            }
        }
    }
}
