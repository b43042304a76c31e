//! Background task spawning, concurrency admission, and lifecycle events (C9).
//!
//! Grounded on [`crate::checkpoint_store::CheckpointStore`]'s durability
//! posture (a task's on-disk record is the source of truth, this type is
//! just the in-process index) and [`crate::conversation_registry::ConversationRegistry`]'s
//! per-name `Arc<RwLock<HashMap<...>>>` shape. Execution itself is delegated
//! to an injected [`TaskRunner`] — this module owns admission, queueing, and
//! event emission, not what "running a task" means (that's the concern of
//! the crate's top-level engine facade, which instantiates a child engine
//! per task).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine_config::EngineConfig;
use crate::error::AgentError;
use crate::progress::{ProgressEvent, ProgressSink};

/// Bounded ring size for a task's captured output log.
const OUTPUT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    OneShot,
    Workspace,
}

/// Caller-supplied parameters for [`TaskManager::spawn`].
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub description: String,
    pub query: String,
    pub task_type: TaskType,
    pub working_dir: PathBuf,
    pub origin_conversation: Option<String>,
    /// `mkdir -p working_dir` before spawning if it doesn't exist.
    pub create_if_missing: bool,
    /// Drops an empty marker file so the new directory is recognizably a
    /// freshly-initialized workspace task root; this crate does not shell
    /// out to a real VCS.
    pub init_vcs_marker: bool,
}

/// A background task's full state.
#[derive(Debug, Clone)]
pub struct BackgroundTask {
    pub id: String,
    pub description: String,
    pub query: String,
    pub status: TaskStatus,
    pub task_type: TaskType,
    pub working_dir: PathBuf,
    pub origin_conversation: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_checkpoint_at: Option<i64>,
    pub output_log: VecDeque<String>,
    pub last_error: Option<String>,
    /// Set by crash recovery: the checkpointed state a recovered task's
    /// child engine should resume from.
    pub initial_scratch: Option<serde_json::Value>,
}

impl BackgroundTask {
    fn workspace_event_fields(&self) -> (Option<String>, String) {
        (self.origin_conversation.clone(), self.working_dir.display().to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
}

/// Runs one task's query to completion. Implemented by the top-level engine
/// facade, which instantiates a child engine rooted at `task.working_dir`.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(
        &self,
        task: &BackgroundTask,
        initial_scratch: Option<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<String, AgentError>;
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

struct Handle {
    task: RwLock<BackgroundTask>,
    cancel: CancellationToken,
}

/// Spawns/tracks background tasks with a bounded-concurrency dispatcher.
///
/// Admission uses a counting [`Semaphore`] sized to `maxConcurrentTasks`; a
/// single dispatcher loop (spawned once, for the manager's lifetime) pops
/// task ids off an internal FIFO queue and, once a permit is available, hands
/// execution to the [`TaskRunner`] on its own `tokio::spawn`ed task.
pub struct TaskManager {
    entries: RwLock<HashMap<String, Arc<Handle>>>,
    queue: Mutex<VecDeque<String>>,
    queue_notify: Notify,
    admission: Arc<Semaphore>,
    progress: ProgressSink,
    config: Arc<EngineConfig>,
    runner: Arc<dyn TaskRunner>,
}

impl TaskManager {
    pub fn new(config: Arc<EngineConfig>, progress: ProgressSink, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        let manager = Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            queue_notify: Notify::new(),
            admission: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            progress,
            config,
            runner,
        });
        tokio::spawn(Self::dispatch_loop(Arc::clone(&manager)));
        manager
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            let next_id = {
                let mut queue = self.queue.lock().await;
                queue.pop_front()
            };
            let Some(task_id) = next_id else {
                self.queue_notify.notified().await;
                continue;
            };

            let Ok(permit) = Arc::clone(&self.admission).acquire_owned().await else {
                continue;
            };

            let manager = Arc::clone(&self);
            tokio::spawn(async move {
                manager.run_one(task_id).await;
                drop(permit);
            });
        }
    }

    async fn run_one(&self, task_id: String) {
        let Some(handle) = self.entries.read().await.get(&task_id).cloned() else {
            return;
        };

        let (initial_scratch, task_snapshot) = {
            let mut task = handle.task.write().await;
            task.status = TaskStatus::Running;
            task.started_at = Some(now_millis());
            (task.initial_scratch.take(), task.clone())
        };
        tracing::debug!(task_id = %task_id, "task running");

        let (origin, working_dir) = task_snapshot.workspace_event_fields();
        self.progress
            .publish(ProgressEvent::TaskProgress {
                task_id: task_id.clone(),
                message: "running".to_string(),
            })
            .await;
        if task_snapshot.task_type == TaskType::Workspace {
            self.progress
                .publish(ProgressEvent::WorkspaceTaskSpawned {
                    task_id: task_id.clone(),
                    origin_conversation: origin.clone(),
                    working_dir: working_dir.clone(),
                })
                .await;
        }

        let result = self
            .runner
            .run(&task_snapshot, initial_scratch, handle.cancel.clone())
            .await;

        let mut task = handle.task.write().await;
        task.completed_at = Some(now_millis());
        match result {
            Ok(output) => {
                task.status = if handle.cancel.is_cancelled() {
                    TaskStatus::Cancelled
                } else {
                    TaskStatus::Succeeded
                };
                push_output(&mut task.output_log, output);
            }
            Err(AgentError::Cancelled) => {
                task.status = TaskStatus::Cancelled;
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                tracing::error!(task_id = %task_id, error = %err, "task aborted");
                task.last_error = Some(err.to_string());
            }
        }
        let status = task.status;
        drop(task);
        tracing::debug!(task_id = %task_id, status = ?status, "task reached terminal state");

        match status {
            TaskStatus::Succeeded => {
                self.progress.publish(ProgressEvent::TaskCompleted { task_id: task_id.clone() }).await;
                if task_snapshot.task_type == TaskType::Workspace {
                    self.progress
                        .publish(ProgressEvent::WorkspaceTaskCompleted {
                            task_id,
                            origin_conversation: origin,
                            working_dir,
                        })
                        .await;
                }
            }
            TaskStatus::Failed => {
                let reason = handle
                    .task
                    .read()
                    .await
                    .last_error
                    .clone()
                    .unwrap_or_default();
                self.progress
                    .publish(ProgressEvent::TaskFailed {
                        task_id: task_id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                if task_snapshot.task_type == TaskType::Workspace {
                    self.progress
                        .publish(ProgressEvent::WorkspaceTaskFailed {
                            task_id,
                            origin_conversation: origin,
                            working_dir,
                            reason,
                        })
                        .await;
                }
            }
            TaskStatus::Cancelled => {
                self.progress.publish(ProgressEvent::TaskCancelled { task_id: task_id.clone() }).await;
                if task_snapshot.task_type == TaskType::Workspace {
                    self.progress
                        .publish(ProgressEvent::WorkspaceTaskCancelled {
                            task_id,
                            origin_conversation: origin,
                            working_dir,
                        })
                        .await;
                }
            }
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::Recovering => unreachable!(),
        }
    }

    /// Creates a task record and enqueues it; returns immediately. Admission
    /// is enforced by the dispatcher's semaphore, not here.
    pub async fn spawn(&self, spec: TaskSpec) -> Result<String, AgentError> {
        if spec.task_type == TaskType::Workspace && spec.create_if_missing {
            std::fs::create_dir_all(&spec.working_dir)
                .map_err(|e| AgentError::StorageUnavailable(e.to_string()))?;
            if spec.init_vcs_marker {
                std::fs::write(spec.working_dir.join(".workspace-task"), b"")
                    .map_err(|e| AgentError::StorageUnavailable(e.to_string()))?;
            }
        }

        let id = Uuid::new_v4().to_string();
        let task = BackgroundTask {
            id: id.clone(),
            description: spec.description,
            query: spec.query,
            status: TaskStatus::Queued,
            task_type: spec.task_type,
            working_dir: spec.working_dir,
            origin_conversation: spec.origin_conversation,
            created_at: now_millis(),
            started_at: None,
            completed_at: None,
            last_checkpoint_at: None,
            output_log: VecDeque::new(),
            last_error: None,
            initial_scratch: None,
        };

        self.entries.write().await.insert(
            id.clone(),
            Arc::new(Handle {
                task: RwLock::new(task),
                cancel: CancellationToken::new(),
            }),
        );
        self.queue.lock().await.push_back(id.clone());
        self.queue_notify.notify_one();
        self.progress.publish(ProgressEvent::TaskSpawned { task_id: id.clone() }).await;
        tracing::debug!(task_id = %id, "task spawned");
        Ok(id)
    }

    /// Reinserts a recovered task at the **head** of the queue with
    /// `status=Recovering` and its checkpointed state as `initial_scratch`.
    /// Used exclusively by [`crate::task_checkpoint_manager::TaskCheckpointManager::startup_recover`].
    pub async fn requeue_recovered(&self, mut task: BackgroundTask, initial_scratch: serde_json::Value) {
        task.status = TaskStatus::Recovering;
        task.initial_scratch = Some(initial_scratch);
        let id = task.id.clone();
        self.entries.write().await.insert(
            id.clone(),
            Arc::new(Handle {
                task: RwLock::new(task),
                cancel: CancellationToken::new(),
            }),
        );
        self.progress
            .publish(ProgressEvent::TaskProgress {
                task_id: id.clone(),
                message: "recovering".to_string(),
            })
            .await;
        self.queue.lock().await.push_front(id);
        self.queue_notify.notify_one();
    }

    /// Records that a task's state was durably checkpointed just now.
    pub async fn mark_checkpointed(&self, task_id: &str) {
        if let Some(handle) = self.entries.read().await.get(task_id).cloned() {
            handle.task.write().await.last_checkpoint_at = Some(now_millis());
        }
    }

    /// Marks a task `failed` with `reason="unrecoverable"` without queueing
    /// it for execution — used when recovery determines the task's working
    /// directory or checkpointed state can no longer be resumed.
    pub async fn mark_unrecoverable(&self, mut task: BackgroundTask) {
        task.status = TaskStatus::Failed;
        task.last_error = Some("unrecoverable".to_string());
        task.completed_at = Some(now_millis());
        let id = task.id.clone();
        self.entries.write().await.insert(
            id.clone(),
            Arc::new(Handle {
                task: RwLock::new(task),
                cancel: CancellationToken::new(),
            }),
        );
        self.progress
            .publish(ProgressEvent::TaskFailed {
                task_id: id,
                reason: "unrecoverable".to_string(),
            })
            .await;
    }

    pub async fn status(&self, task_id: &str) -> Option<BackgroundTask> {
        let handle = self.entries.read().await.get(task_id).cloned()?;
        Some(handle.task.read().await.clone())
    }

    /// Sets status to `cancelled` and fires the task's abort handle. Already
    /// terminal tasks are left untouched (cancellation is idempotent).
    pub async fn cancel(&self, task_id: &str) -> Result<(), AgentError> {
        let handle = self
            .entries
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| AgentError::Other(format!("unknown task: {task_id}")))?;
        handle.cancel.cancel();
        let mut task = handle.task.write().await;
        if matches!(task.status, TaskStatus::Queued | TaskStatus::Running | TaskStatus::Recovering) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(now_millis());
            tracing::warn!(task_id, "task cancelled by caller");
        }
        Ok(())
    }

    /// Tail of the captured output log after `since` lines have been consumed.
    pub async fn output(&self, task_id: &str, since: usize) -> Result<Vec<String>, AgentError> {
        let handle = self
            .entries
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| AgentError::Other(format!("unknown task: {task_id}")))?;
        let task = handle.task.read().await;
        Ok(task.output_log.iter().skip(since).cloned().collect())
    }

    pub async fn list(&self, filter: &TaskFilter) -> Vec<BackgroundTask> {
        self.prune_expired().await;
        let entries = self.entries.read().await;
        let mut out = Vec::new();
        for handle in entries.values() {
            let task = handle.task.read().await;
            if filter.status.is_some_and(|s| s != task.status) {
                continue;
            }
            if filter.task_type.is_some_and(|t| t != task.task_type) {
                continue;
            }
            out.push(task.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Drops completed/failed/cancelled tasks whose `completed_at` is older
    /// than `config.output_retention_seconds`.
    async fn prune_expired(&self) {
        let cutoff = now_millis() - (self.config.output_retention_seconds as i64 * 1000);
        let mut entries = self.entries.write().await;
        let mut expired = Vec::new();
        for (id, handle) in entries.iter() {
            let task = handle.task.read().await;
            let is_terminal = matches!(
                task.status,
                TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
            );
            if is_terminal && task.completed_at.is_some_and(|t| t < cutoff) {
                expired.push(id.clone());
            }
        }
        for id in expired {
            entries.remove(&id);
        }
    }
}

fn push_output(log: &mut VecDeque<String>, line: String) {
    for segment in line.lines() {
        if log.len() >= OUTPUT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(segment.to_string());
    }
}
