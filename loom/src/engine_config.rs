//! Immutable engine-wide configuration.
//!
//! Built once at startup from [`env_config::load_and_apply`] (layered
//! env / project `.env` / XDG `config.toml`) and `clap`'s `env` derive, then
//! shared by `Arc` with every component that reads it. Runtime-mutable
//! settings (the autonomous controller's tick interval, model routing
//! choices) live on the owning component instead, guarded by a lock — this
//! struct itself never changes after construction.

use clap::Parser;

/// Recognized configuration surface.
#[derive(Debug, Clone, Parser, serde::Serialize, serde::Deserialize)]
#[command(name = "engine-config")]
pub struct EngineConfig {
    /// Cap on `turnNumber` per request.
    #[arg(long, env = "LOOM_MAX_TURNS", default_value_t = 20)]
    pub max_turns: u32,

    /// Enable/disable the triage stage.
    #[arg(long, env = "LOOM_TRIAGE_ENABLED", default_value_t = true)]
    pub triage_enabled: bool,

    /// Task Manager admission cap.
    #[arg(long, env = "LOOM_MAX_CONCURRENT_TASKS", default_value_t = 3)]
    pub max_concurrent_tasks: usize,

    /// Periodic checkpoint period, in milliseconds.
    #[arg(long, env = "LOOM_CHECKPOINT_INTERVAL_MS", default_value_t = 30_000)]
    pub checkpoint_interval_ms: u64,

    /// How many checkpoint records per task to retain after compaction.
    #[arg(long, env = "LOOM_CHECKPOINT_RETENTION", default_value_t = 5)]
    pub checkpoint_retention: usize,

    /// Worker pool size for parallel-safe tools.
    #[arg(long, env = "LOOM_PARALLEL_TOOL_WORKERS", default_value_t = 8)]
    pub parallel_tool_workers: usize,

    /// Per-tool default timeout, in milliseconds.
    #[arg(long, env = "LOOM_TOOL_CALL_TIMEOUT_MS", default_value_t = 120_000)]
    pub tool_call_timeout_ms: u64,

    /// Per-LLM-call default timeout, in milliseconds.
    #[arg(long, env = "LOOM_LLM_CALL_TIMEOUT_MS", default_value_t = 300_000)]
    pub llm_call_timeout_ms: u64,

    /// Default token budget for prompt assembly.
    #[arg(long, env = "LOOM_HISTORY_TOKEN_BUDGET", default_value_t = 8_000)]
    pub history_token_budget: usize,

    /// How long completed task records remain queryable, in seconds.
    #[arg(long, env = "LOOM_OUTPUT_RETENTION_SECONDS", default_value_t = 86_400)]
    pub output_retention_seconds: u64,

    /// Default tick for the Agent Loop Controller, in milliseconds.
    #[arg(
        long,
        env = "LOOM_AUTONOMOUS_DEFAULT_INTERVAL_MS",
        default_value_t = 60_000
    )]
    pub autonomous_default_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        // `Parser::parse_from` over an empty argument list applies every
        // `default_value_t`/`env` without requiring a real argv.
        EngineConfig::parse_from(std::iter::empty::<String>())
    }
}

impl EngineConfig {
    /// Loads the workspace's layered env/`.env`/XDG config into the process
    /// environment, then builds an `EngineConfig` from it (falling back to
    /// the documented defaults for anything unset).
    pub fn load(app_name: &str, project_dir: Option<&std::path::Path>) -> Self {
        let _ = env_config::load_and_apply(app_name, project_dir);
        EngineConfig::parse_from(std::iter::empty::<String>())
    }
}
