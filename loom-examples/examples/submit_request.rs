//! Wires the reference `MockLlmAdapter` and an empty `ToolRegistry` into an
//! `EngineFacade` and drives one request through the full dispatch path
//! (triage → actor/critic → finalize) via `submit_request`.
//!
//! Run with `cargo run -p loom-examples --example submit_request`.

use std::sync::Arc;

use loom::engine::{load_config, EngineFacade, EngineFacadeConfig};
use loom::error::AgentError;
use loom::llm_adapter::MockLlmAdapter;
use loom::request_context::RequestOptions;
use loom::tool_registry::ToolRegistry;

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    let workspace_root = std::env::temp_dir().join("loom-submit-request-example");
    std::fs::create_dir_all(&workspace_root).expect("create example workspace root");

    let config = load_config("loom-example", Some(&workspace_root));

    let facade = EngineFacade::new(EngineFacadeConfig {
        workspace_root,
        config,
        llm: Arc::new(MockLlmAdapter::new("example")),
        tools: Arc::new(ToolRegistry::new()),
        model: "mock-model".to_string(),
    })?;

    // Requeue anything orphaned by a prior crash before serving traffic.
    let recovered = facade.recover().await?;
    if !recovered.is_empty() {
        println!("recovered {} orphaned task(s)", recovered.len());
    }

    let response = facade
        .submit_request("demo", "hello from the example", RequestOptions::default())
        .await?;
    println!("{response}");

    Ok(())
}
