//! Structured event fan-out to external observers.
//!
//! A process-wide, multi-subscriber sink: every connected observer gets its own
//! bounded `mpsc` channel fed by [`ProgressSink::publish`]. Non-critical
//! events (`task:progress`, `task:output`) are dropped on overflow; lifecycle
//! events (`*:completed`, `*:failed`, `*:cancelled`) are never dropped.
//!
//! [`ProgressEvent::to_protocol_event`] converts an event into the
//! `stream-event` crate's wire shape for observers connected over the
//! streaming transport; callers feed that into [`stream_event::to_json`]
//! with a per-connection [`stream_event::EnvelopeState`] to get the final
//! envelope-tagged JSON line.

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

/// One structured event published to observers.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", content = "data")]
pub enum ProgressEvent {
    RequestStarted { request_id: String, conversation: String },
    RequestStreamChunk { request_id: String, delta: String },
    RequestToolCallOpen { request_id: String, call_id: String, tool_name: String },
    RequestToolCallArgDelta { request_id: String, call_id: String, delta: String },
    RequestToolCallClose { request_id: String, call_id: String },
    RequestToolResult { request_id: String, call_id: String, status: String },
    RequestCompleted { request_id: String },
    RequestFailed { request_id: String, reason: String },
    RequestCancelled { request_id: String },

    TaskSpawned { task_id: String },
    TaskProgress { task_id: String, message: String },
    TaskOutput { task_id: String, line: String },
    TaskCompleted { task_id: String },
    TaskFailed { task_id: String, reason: String },
    TaskCancelled { task_id: String },
    WorkspaceTaskSpawned { task_id: String, origin_conversation: Option<String>, working_dir: String },
    WorkspaceTaskCompleted { task_id: String, origin_conversation: Option<String>, working_dir: String },
    WorkspaceTaskFailed { task_id: String, origin_conversation: Option<String>, working_dir: String, reason: String },
    WorkspaceTaskCancelled { task_id: String, origin_conversation: Option<String>, working_dir: String },

    ControllerStateChanged { from: String, to: String },
    ControllerBlocked { question: String },
    ControllerAnswerAccepted,
}

impl ProgressEvent {
    /// Lifecycle/completion events are never dropped on a full subscriber
    /// buffer; `*:progress`/`*:output` may be.
    fn is_critical(&self) -> bool {
        !matches!(
            self,
            ProgressEvent::TaskProgress { .. }
                | ProgressEvent::TaskOutput { .. }
                | ProgressEvent::RequestStreamChunk { .. }
        )
    }

    /// Converts this event into the wire-level [`stream_event::ProtocolEvent`]
    /// a remote observer receives — the transport counterpart named in the
    /// streaming/transport protocol section.
    pub fn to_protocol_event(&self) -> stream_event::ProtocolEvent {
        use stream_event::ProtocolEvent as P;
        match self.clone() {
            ProgressEvent::RequestStarted { request_id, conversation } => {
                P::RequestStarted { request_id, conversation }
            }
            ProgressEvent::RequestStreamChunk { request_id, delta } => {
                P::RequestStreamChunk { request_id, delta }
            }
            ProgressEvent::RequestToolCallOpen { request_id, call_id, tool_name } => {
                P::RequestToolCallOpen { request_id, call_id, tool_name }
            }
            ProgressEvent::RequestToolCallArgDelta { request_id, call_id, delta } => {
                P::RequestToolCallArgDelta { request_id, call_id, delta }
            }
            ProgressEvent::RequestToolCallClose { request_id, call_id } => {
                P::RequestToolCallClose { request_id, call_id }
            }
            ProgressEvent::RequestToolResult { request_id, call_id, status } => {
                P::RequestToolResult { request_id, call_id, status }
            }
            ProgressEvent::RequestCompleted { request_id } => P::RequestCompleted { request_id },
            ProgressEvent::RequestFailed { request_id, reason } => {
                P::RequestFailed { request_id, reason }
            }
            ProgressEvent::RequestCancelled { request_id } => P::RequestCancelled { request_id },
            ProgressEvent::TaskSpawned { task_id } => P::TaskSpawned { task_id },
            ProgressEvent::TaskProgress { task_id, message } => P::TaskProgress { task_id, message },
            ProgressEvent::TaskOutput { task_id, line } => P::TaskOutput { task_id, line },
            ProgressEvent::TaskCompleted { task_id } => P::TaskCompleted { task_id },
            ProgressEvent::TaskFailed { task_id, reason } => P::TaskFailed { task_id, reason },
            ProgressEvent::TaskCancelled { task_id } => P::TaskCancelled { task_id },
            ProgressEvent::WorkspaceTaskSpawned { task_id, origin_conversation, working_dir } => {
                P::WorkspaceTaskSpawned { task_id, origin_conversation, working_dir }
            }
            ProgressEvent::WorkspaceTaskCompleted { task_id, origin_conversation, working_dir } => {
                P::WorkspaceTaskCompleted { task_id, origin_conversation, working_dir }
            }
            ProgressEvent::WorkspaceTaskFailed { task_id, origin_conversation, working_dir, reason } => {
                P::WorkspaceTaskFailed { task_id, origin_conversation, working_dir, reason }
            }
            ProgressEvent::WorkspaceTaskCancelled { task_id, origin_conversation, working_dir } => {
                P::WorkspaceTaskCancelled { task_id, origin_conversation, working_dir }
            }
            ProgressEvent::ControllerStateChanged { from, to } => P::ControllerStateChanged { from, to },
            ProgressEvent::ControllerBlocked { question } => P::ControllerBlocked { question },
            ProgressEvent::ControllerAnswerAccepted => P::ControllerAnswerAccepted,
        }
    }
}

struct Subscriber {
    tx: mpsc::Sender<ProgressEvent>,
}

/// Multi-producer, multi-consumer fan-out sink with a bounded per-subscriber
/// buffer and a documented drop policy for non-critical events.
#[derive(Clone, Default)]
pub struct ProgressSink {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new observer with a bounded buffer of `capacity` events.
    pub async fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.write().await.push(Subscriber { tx });
        rx
    }

    /// Publishes `event` to every subscriber. Critical (lifecycle) events
    /// block briefly to guarantee delivery; non-critical events use
    /// `try_send` and are silently dropped if the subscriber's buffer is full.
    pub async fn publish(&self, event: ProgressEvent) {
        let subscribers = self.subscribers.read().await;
        for sub in subscribers.iter() {
            if event.is_critical() {
                let _ = sub.tx.send(event.clone()).await;
            } else {
                let _ = sub.tx.try_send(event.clone());
            }
        }
    }

    /// Drops subscribers whose receiver has been dropped.
    pub async fn prune_closed(&self) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|s| !s.tx.is_closed());
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
