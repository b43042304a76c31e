//! Periodic task checkpointing and crash-recovery requeue (C10).
//!
//! Sits between the [`crate::checkpoint_store::CheckpointStore`] (durability)
//! and the [`crate::task_manager::TaskManager`] (in-process lifecycle):
//! serializes a running task's state on an interval, and on startup turns
//! [`CheckpointStore::recover`]'s manifest back into live, running tasks —
//! re-queued at the **head** of the Task Manager's dispatch queue, since a
//! recovered task already has priority over freshly-submitted work.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::checkpoint_store::{CheckpointRecord, CheckpointStore};
use crate::engine_config::EngineConfig;
use crate::error::AgentError;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::task_manager::{BackgroundTask, TaskManager, TaskStatus, TaskType};

/// How many trailing output lines ride along in a checkpoint's opaque state,
/// for diagnostic purposes only — recovery does not require them.
const CHECKPOINT_OUTPUT_TAIL: usize = 20;

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "queued",
        TaskStatus::Running => "running",
        TaskStatus::Succeeded => "succeeded",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Recovering => "recovering",
    }
}

fn task_type_str(task_type: TaskType) -> &'static str {
    match task_type {
        TaskType::OneShot => "oneShot",
        TaskType::Workspace => "workspace",
    }
}

/// Reconstructs enough of a [`BackgroundTask`] from a checkpoint's opaque
/// `state` blob to requeue it. Returns `None` if the blob is missing fields
/// a recovered task cannot do without — the caller treats that as
/// unrecoverable, same as a missing working directory.
fn reconstruct_task(task_id: &str, state: &serde_json::Value) -> Option<BackgroundTask> {
    let description = state.get("description")?.as_str()?.to_string();
    let query = state.get("query")?.as_str()?.to_string();
    let working_dir = state.get("workingDir")?.as_str()?.to_string();
    let task_type = match state.get("taskType")?.as_str()? {
        "workspace" => TaskType::Workspace,
        _ => TaskType::OneShot,
    };
    let origin_conversation = state
        .get("originConversation")
        .and_then(|v| v.as_str())
        .map(String::from);

    Some(BackgroundTask {
        id: task_id.to_string(),
        description,
        query,
        status: TaskStatus::Recovering,
        task_type,
        working_dir: PathBuf::from(working_dir),
        origin_conversation,
        created_at: state.get("createdAt").and_then(|v| v.as_i64()).unwrap_or(0),
        started_at: None,
        completed_at: None,
        last_checkpoint_at: None,
        output_log: VecDeque::new(),
        last_error: None,
        initial_scratch: None,
    })
}

/// Drives periodic snapshots and startup crash recovery for background tasks.
pub struct TaskCheckpointManager {
    store: Arc<CheckpointStore>,
    tasks: Arc<TaskManager>,
    progress: ProgressSink,
    config: Arc<EngineConfig>,
}

impl TaskCheckpointManager {
    pub fn new(
        store: Arc<CheckpointStore>,
        tasks: Arc<TaskManager>,
        progress: ProgressSink,
        config: Arc<EngineConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            tasks,
            progress,
            config,
        })
    }

    /// Spawns a background ticker that calls [`Self::snapshot`] on
    /// `config.checkpoint_interval_ms` while the task remains running, then
    /// exits on its own once the task leaves the running/recovering states.
    pub fn enable(self: &Arc<Self>, task_id: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(this.config.checkpoint_interval_ms));
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(task) = this.tasks.status(&task_id).await else {
                    return;
                };
                if !matches!(task.status, TaskStatus::Running | TaskStatus::Recovering) {
                    return;
                }
                let _ = this.snapshot(&task_id).await;
            }
        });
    }

    /// Serializes the task's current state (opaque to the checkpoint store)
    /// and appends it to the WAL.
    pub async fn snapshot(&self, task_id: &str) -> Result<String, AgentError> {
        let task = self
            .tasks
            .status(task_id)
            .await
            .ok_or_else(|| AgentError::Other(format!("unknown task: {task_id}")))?;

        let output_tail: Vec<&String> = task
            .output_log
            .iter()
            .rev()
            .take(CHECKPOINT_OUTPUT_TAIL)
            .collect();
        let state = serde_json::json!({
            "status": status_str(task.status),
            "description": task.description,
            "query": task.query,
            "taskType": task_type_str(task.task_type),
            "workingDir": task.working_dir.display().to_string(),
            "originConversation": task.origin_conversation,
            "createdAt": task.created_at,
            "outputTail": output_tail,
        });

        let record = CheckpointRecord {
            task_id: task_id.to_string(),
            sequence_number: 0,
            state,
            created_at: 0,
            parent_checkpoint_id: None,
        };
        let checkpoint_id = self.store.append(record).await?;
        self.tasks.mark_checkpointed(task_id).await;
        tracing::debug!(task_id, checkpoint_id = %checkpoint_id, "task checkpoint written");

        match self
            .store
            .compact(task_id, self.config.checkpoint_retention)
            .await
        {
            Ok(removed) if removed > 0 => {
                tracing::debug!(task_id, removed, "compacted stale checkpoint records");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(task_id, error = %err, "checkpoint compaction failed");
            }
        }

        Ok(checkpoint_id)
    }

    /// Consults the checkpoint store for tasks left `running` by a process
    /// that never reached a terminal state, and turns each into a requeued
    /// [`crate::task_manager::TaskManager`] entry (or an immediate `failed`
    /// if it can no longer be resumed). Returns the ids successfully requeued.
    pub async fn startup_recover(&self) -> Result<Vec<String>, AgentError> {
        let manifest = self.store.recover()?;
        let mut recovered = Vec::new();

        for task_id in manifest.task_ids {
            let Some(record) = self.store.latest_for_task(&task_id).await? else {
                continue;
            };

            let Some(task) = reconstruct_task(&task_id, &record.state) else {
                self.mark_unrecoverable_stub(&task_id).await;
                continue;
            };

            if !task.working_dir.as_os_str().is_empty() && !task.working_dir.exists() {
                self.tasks.mark_unrecoverable(task).await;
                continue;
            }

            self.tasks.requeue_recovered(task, record.state).await;
            recovered.push(task_id);
        }

        Ok(recovered)
    }

    async fn mark_unrecoverable_stub(&self, task_id: &str) {
        let stub = BackgroundTask {
            id: task_id.to_string(),
            description: "recovered task (undeserializable checkpoint)".to_string(),
            query: String::new(),
            status: TaskStatus::Failed,
            task_type: TaskType::OneShot,
            working_dir: PathBuf::new(),
            origin_conversation: None,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
            last_checkpoint_at: None,
            output_log: VecDeque::new(),
            last_error: None,
            initial_scratch: None,
        };
        self.tasks.mark_unrecoverable(stub).await;
    }

    pub fn progress(&self) -> &ProgressSink {
        &self.progress
    }
}
