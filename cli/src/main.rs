//! Thin pass-through CLI: parses a message, submits it to an `EngineFacade`,
//! prints the final response. No remote backend, no per-graph subcommands —
//! those are product surface this binary deliberately doesn't carry.

mod log_format;
mod logging;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use loom::engine::{load_config, EngineFacade, EngineFacadeConfig};
use loom::llm_adapter::MockLlmAdapter;
use loom::request_context::RequestOptions;
use loom::tool_registry::ToolRegistry;

#[derive(Parser, Debug)]
#[command(name = "loom")]
#[command(about = "Loom — submit a request to the agent orchestration engine")]
struct Args {
    /// User message (or pass as trailing positional args)
    #[arg(short, long, value_name = "TEXT")]
    message: Option<String>,

    /// Positional args: user message when -m/--message is not used
    #[arg(trailing_var_arg = true)]
    rest: Vec<String>,

    /// Workspace root for conversations/checkpoints; default: `.loom` under the current directory
    #[arg(short, long, value_name = "DIR")]
    working_folder: Option<PathBuf>,

    /// Conversation name to continue or create
    #[arg(long, value_name = "NAME", default_value = "default")]
    conversation: String,

    /// Verbose: debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Print the response as a single JSON line ({"reply": "..."}) instead of plain text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.verbose)?;

    let message = args.message.unwrap_or_else(|| args.rest.join(" "));
    if message.trim().is_empty() {
        eprintln!("loom: provide a message via -m/--message or positional args");
        std::process::exit(1);
    }

    let working_folder = args
        .working_folder
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default().join(".loom"));
    std::fs::create_dir_all(&working_folder)?;

    let engine_config = load_config("loom", Some(&working_folder));
    let model = "mock-model".to_string();
    let facade = EngineFacade::new(EngineFacadeConfig {
        workspace_root: working_folder,
        config: engine_config,
        llm: Arc::new(MockLlmAdapter::new("loom")),
        tools: Arc::new(ToolRegistry::new()),
        model,
    })?;

    facade.recover().await?;

    let response = facade
        .submit_request(&args.conversation, &message, RequestOptions::default())
        .await?;

    if args.json {
        println!("{}", serde_json::json!({ "reply": response }));
    } else {
        println!("{response}");
    }

    Ok(())
}
