//! Protocol-level event types (protocol_spec §4: type + payload).
//!
//! Wire shape for the engine's request/task/controller event kinds; the
//! bridge in `loom::progress` converts its internal `ProgressEvent` into one
//! of these before handing it to [`crate::envelope::to_json`].

use serde::Serialize;
use serde_json::Value;

/// Protocol event: wire shape for one stream event (type + payload).
/// Matches protocol_spec §4.2; envelope (session_id, node_id, event_id) is applied separately.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolEvent {
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
    WorkspaceTaskSpawned {
        task_id: String,
        origin_conversation: Option<String>,
        working_dir: String,
    },
    WorkspaceTaskCompleted {
        task_id: String,
        origin_conversation: Option<String>,
        working_dir: String,
    },
    WorkspaceTaskFailed {
        task_id: String,
        origin_conversation: Option<String>,
        working_dir: String,
        reason: String,
    },
    WorkspaceTaskCancelled {
        task_id: String,
        origin_conversation: Option<String>,
        working_dir: String,
    },

    ControllerStateChanged { from: String, to: String },
    ControllerBlocked { question: String },
    ControllerAnswerAccepted,
}

impl ProtocolEvent {
    /// Serializes this event to a JSON object (type + payload only; no envelope).
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
