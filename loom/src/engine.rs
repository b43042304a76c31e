//! Top-level engine facade: ties every orchestration component into a single
//! request-submission entrypoint.
//!
//! Reshaped around a long-lived `Arc<EngineFacade>` instead of a one-shot
//! "build everything and run it" function: this engine is a process-lifetime
//! object serving many requests and background tasks, not a single
//! invocation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::AgentLoopPlugin;
use crate::agent_loop_controller::{AgentLoopController, BriefingSource, RequestSubmitter};
use crate::checkpoint_store::CheckpointStore;
use crate::conversation_registry::{ConversationMetadata, ConversationRegistry};
use crate::engine_config::EngineConfig;
use crate::error::AgentError;
use crate::eventic::{Engine as DispatchEngine, EventKind, Services};
use crate::llm_adapter::LlmAdapter;
use crate::progress::ProgressSink;
use crate::request_context::{RequestContext, RequestOptions};
use crate::task_checkpoint_manager::TaskCheckpointManager;
use crate::task_manager::{
    BackgroundTask, TaskFilter, TaskManager, TaskRunner, TaskSpec, TaskStatus,
};
use crate::tool_registry::ToolRegistry;

/// Everything the facade needs to build the Eventic engine and service bundle,
/// supplied once at startup.
pub struct EngineFacadeConfig {
    pub workspace_root: PathBuf,
    pub config: Arc<EngineConfig>,
    pub llm: Arc<dyn LlmAdapter>,
    pub tools: Arc<ToolRegistry>,
    pub model: String,
}

/// Process-lifetime owner of every orchestration component, exposing the
/// single `(conversationName, userInput, options)` request path plus
/// conversation/task/controller management.
pub struct EngineFacade {
    conversations: Arc<ConversationRegistry>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmAdapter>,
    config: Arc<EngineConfig>,
    progress: ProgressSink,
    dispatch_engine: Arc<DispatchEngine>,
    tasks: Arc<TaskManager>,
    task_checkpoints: Arc<TaskCheckpointManager>,
    in_flight: StdMutex<HashMap<String, CancellationToken>>,
}

impl EngineFacade {
    /// Builds a fresh engine rooted at `cfg.workspace_root`. Does not run
    /// crash recovery; call [`Self::recover`] explicitly after construction.
    pub fn new(cfg: EngineFacadeConfig) -> Result<Arc<Self>, AgentError> {
        let conversations = Arc::new(ConversationRegistry::new(
            cfg.workspace_root.join(".conversations"),
        ));
        let progress = ProgressSink::new();
        let checkpoint_store = Arc::new(
            CheckpointStore::new(cfg.workspace_root.join(".checkpoints"))
                .map_err(AgentError::from)?,
        );

        let mut builder = DispatchEngine::builder();
        builder.use_plugin(AgentLoopPlugin { model: cfg.model });
        let dispatch_engine = Arc::new(builder.build());

        let runner = Arc::new(ChildEngineTaskRunner {
            dispatch_engine: Arc::clone(&dispatch_engine),
            tools: Arc::clone(&cfg.tools),
            llm: Arc::clone(&cfg.llm),
            config: Arc::clone(&cfg.config),
            progress: progress.clone(),
        });
        let tasks = TaskManager::new(Arc::clone(&cfg.config), progress.clone(), runner);
        let task_checkpoints = TaskCheckpointManager::new(
            checkpoint_store,
            Arc::clone(&tasks),
            progress.clone(),
            Arc::clone(&cfg.config),
        );

        Ok(Arc::new(Self {
            conversations,
            tools: cfg.tools,
            llm: cfg.llm,
            config: cfg.config,
            progress,
            dispatch_engine,
            tasks,
            task_checkpoints,
            in_flight: StdMutex::new(HashMap::new()),
        }))
    }

    pub fn progress(&self) -> &ProgressSink {
        &self.progress
    }

    // ---- Conversation management (C3 passthrough) ----

    pub async fn list_conversations(&self) -> Vec<ConversationMetadata> {
        self.conversations.list().await
    }

    pub async fn create_conversation(&self, name: &str) -> Result<(), AgentError> {
        self.conversations.create(name).await
    }

    pub async fn switch_active_conversation(&self, name: &str) -> Result<(), AgentError> {
        self.conversations.switch_active(name).await
    }

    pub async fn delete_conversation(&self, name: &str) -> Result<(), AgentError> {
        self.conversations.delete(name).await
    }

    pub async fn rename_conversation(&self, old: &str, new: &str) -> Result<(), AgentError> {
        self.conversations.rename(old, new).await
    }

    // ---- Request submission ----

    /// Acquires `conversation_name`'s lock, builds a `RequestContext`,
    /// dispatches `AGENT_START`, and returns the final assistant response.
    /// Creates the conversation implicitly if it doesn't exist yet.
    pub async fn submit_request(
        &self,
        conversation_name: &str,
        user_input: &str,
        options: RequestOptions,
    ) -> Result<String, AgentError> {
        let cancel = CancellationToken::new();
        self.in_flight
            .lock()
            .unwrap()
            .insert(conversation_name.to_string(), cancel.clone());

        let services = Services {
            tools: Arc::clone(&self.tools),
            llm: Arc::clone(&self.llm),
            progress: self.progress.clone(),
            config: Arc::clone(&self.config),
        };
        let dispatch_engine = Arc::clone(&self.dispatch_engine);
        let max_turns = self.config.max_turns;

        let result = self
            .conversations
            .with_lock(conversation_name, true, |history| async move {
                let mut ctx = RequestContext::new(
                    conversation_name,
                    user_input,
                    options,
                    Some(&cancel),
                    max_turns,
                );
                dispatch_engine
                    .dispatch(EventKind::AgentStart, &mut ctx, history, &services)
                    .await?;
                Ok(ctx.final_response.clone().unwrap_or_default())
            })
            .await;

        self.in_flight.lock().unwrap().remove(conversation_name);
        result
    }

    // ---- Background tasks (C9/C10 passthrough) ----

    /// Spawns a background task and enables periodic checkpointing on it.
    pub async fn spawn_task(&self, spec: TaskSpec) -> Result<String, AgentError> {
        let id = self.tasks.spawn(spec).await?;
        self.task_checkpoints.enable(id.clone());
        Ok(id)
    }

    pub async fn task_status(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks.status(task_id).await
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), AgentError> {
        self.tasks.cancel(task_id).await
    }

    pub async fn task_output(&self, task_id: &str, since: usize) -> Result<Vec<String>, AgentError> {
        self.tasks.output(task_id, since).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<BackgroundTask> {
        self.tasks.list(filter).await
    }

    /// Consults the checkpoint store for tasks orphaned by a prior process
    /// exit and requeues them. Call once at startup, before serving traffic.
    pub async fn recover(&self) -> Result<Vec<String>, AgentError> {
        self.task_checkpoints.startup_recover().await
    }

    // ---- Autonomous mode (C11) ----

    /// Builds an [`AgentLoopController`] driving `conversation_name`, whose
    /// briefing packets summarize this engine's outstanding background tasks.
    pub fn controller(self: &Arc<Self>, conversation_name: impl Into<String>) -> Arc<AgentLoopController> {
        let briefing: Arc<dyn BriefingSource> = Arc::new(WorkspaceBriefing {
            tasks: Arc::clone(&self.tasks),
        });
        let submitter: Arc<dyn RequestSubmitter> = Arc::clone(self) as Arc<dyn RequestSubmitter>;
        AgentLoopController::new(conversation_name, submitter, briefing, self.progress.clone())
    }
}

#[async_trait]
impl RequestSubmitter for EngineFacade {
    async fn submit(&self, conversation: &str, user_input: &str) -> Result<String, AgentError> {
        self.submit_request(conversation, user_input, RequestOptions::default())
            .await
    }

    fn cancel(&self, conversation: &str) {
        if let Some(token) = self.in_flight.lock().unwrap().get(conversation) {
            token.cancel();
        }
    }
}

/// Summarizes outstanding background tasks for the autonomous controller's
/// periodic briefing packet.
struct WorkspaceBriefing {
    tasks: Arc<TaskManager>,
}

#[async_trait]
impl BriefingSource for WorkspaceBriefing {
    async fn assemble(&self) -> String {
        let tasks = self.tasks.list(&TaskFilter::default()).await;
        let outstanding: Vec<String> = tasks
            .iter()
            .filter(|t| {
                !matches!(
                    t.status,
                    TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
                )
            })
            .map(|t| format!("- [{:?}] {}: {}", t.status, t.id, t.description))
            .collect();
        if outstanding.is_empty() {
            "No outstanding background tasks.".to_string()
        } else {
            format!("Outstanding background tasks:\n{}", outstanding.join("\n"))
        }
    }
}

/// Runs one background task's query through the same Eventic dispatch
/// machinery as a foreground request, against a conversation registry rooted
/// at the task's own working directory — the "fully isolated child engine"
/// a workspace-typed `BackgroundTask` owns.
struct ChildEngineTaskRunner {
    dispatch_engine: Arc<DispatchEngine>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmAdapter>,
    config: Arc<EngineConfig>,
    progress: ProgressSink,
}

#[async_trait]
impl TaskRunner for ChildEngineTaskRunner {
    async fn run(
        &self,
        task: &BackgroundTask,
        initial_scratch: Option<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<String, AgentError> {
        let child_conversations_dir = task.working_dir.join(".conversations");
        let conversations = ConversationRegistry::new(child_conversations_dir);
        match conversations.create("task").await {
            Ok(()) | Err(AgentError::ConversationExists(_)) => {}
            Err(other) => return Err(other),
        }

        let services = Services {
            tools: Arc::clone(&self.tools),
            llm: Arc::clone(&self.llm),
            progress: self.progress.clone(),
            config: Arc::clone(&self.config),
        };
        let dispatch_engine = Arc::clone(&self.dispatch_engine);
        let max_turns = self.config.max_turns;
        let query = task.query.clone();

        conversations
            .with_lock("task", true, move |history| async move {
                let mut ctx = RequestContext::new(
                    "task",
                    query,
                    RequestOptions::default(),
                    Some(&cancel),
                    max_turns,
                );
                if let Some(serde_json::Value::Object(map)) = initial_scratch {
                    for (k, v) in map {
                        ctx.scratch.insert(k, v);
                    }
                }
                dispatch_engine
                    .dispatch(EventKind::AgentStart, &mut ctx, history, &services)
                    .await?;
                Ok(ctx.final_response.clone().unwrap_or_default())
            })
            .await
    }
}

/// Convenience constructor for the layered env/`.env`/XDG configuration load.
pub fn load_config(app_name: &str, project_dir: Option<&Path>) -> Arc<EngineConfig> {
    Arc::new(EngineConfig::load(app_name, project_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_adapter::{LlmRequest, LlmResponse};
    use crate::tools::Tool;

    struct StaticLlm;
    #[async_trait]
    impl LlmAdapter for StaticLlm {
        async fn call(&self, _req: &LlmRequest) -> Result<LlmResponse, AgentError> {
            Ok(LlmResponse {
                content: "all done".to_string(),
                tool_calls: vec![],
                usage: None,
            })
        }
    }

    fn test_facade(root: &Path) -> Arc<EngineFacade> {
        let mut config = EngineConfig::default();
        config.triage_enabled = false;
        EngineFacade::new(EngineFacadeConfig {
            workspace_root: root.to_path_buf(),
            config: Arc::new(config),
            llm: Arc::new(StaticLlm),
            tools: Arc::new(ToolRegistry::new()),
            model: "test-model".to_string(),
        })
        .unwrap()
    }

    /// **Scenario**: submitting a request to a new conversation creates it implicitly
    /// and returns the assistant's final response.
    #[tokio::test]
    async fn submit_request_creates_conversation_and_returns_response() {
        let dir = tempfile::tempdir().unwrap();
        let facade = test_facade(dir.path());
        let response = facade
            .submit_request("chat", "hello", RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response, "all done");
        let conversations = facade.list_conversations().await;
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].name, "chat");
    }

    /// **Scenario**: a spawned workspace task runs to completion via its own child
    /// conversation registry rooted at its working directory.
    #[tokio::test]
    async fn spawn_task_runs_through_child_engine() {
        let dir = tempfile::tempdir().unwrap();
        let facade = test_facade(dir.path());
        let task_dir = dir.path().join("task-root");

        let id = facade
            .spawn_task(TaskSpec {
                description: "demo".to_string(),
                query: "do something".to_string(),
                task_type: crate::task_manager::TaskType::Workspace,
                working_dir: task_dir.clone(),
                origin_conversation: Some("chat".to_string()),
                create_if_missing: true,
                init_vcs_marker: false,
            })
            .await
            .unwrap();

        assert!(task_dir.exists());

        let mut status = facade.task_status(&id).await.unwrap();
        for _ in 0..50 {
            if status.status == crate::task_manager::TaskStatus::Succeeded {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            status = facade.task_status(&id).await.unwrap();
        }
        assert_eq!(status.status, crate::task_manager::TaskStatus::Succeeded);
    }

    /// **Scenario**: the RequestSubmitter impl cancels the right in-flight conversation.
    #[tokio::test]
    async fn cancel_targets_named_conversation_only() {
        let dir = tempfile::tempdir().unwrap();
        let facade = test_facade(dir.path());
        facade.create_conversation("a").await.unwrap();
        RequestSubmitter::cancel(facade.as_ref(), "a");
        // No in-flight request named "a" yet; cancel() on an absent entry is a no-op.
    }

    fn _assert_tool_trait_in_scope<T: Tool>() {}
}
