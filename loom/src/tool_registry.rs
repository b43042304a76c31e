//! Schema catalog + dispatch shim to externally-provided tool handlers (C4).
//!
//! Append-only for the lifetime of an engine: [`ToolRegistry::register`] never
//! replaces an existing entry — handlers are pure-by-contract with respect to
//! the registry and never reach back in to re-register.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::tool_source::{ToolCallContent, ToolCallContext, ToolSpec};
use crate::tools::Tool;

struct Entry {
    spec: ToolSpec,
    tool: Arc<dyn Tool>,
}

/// Maps `toolName → (schema, handler)`.
#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, rejecting with `DuplicateTool` if the name is taken.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let spec = tool.spec();
        if self.entries.contains_key(&spec.name) {
            return Err(AgentError::DuplicateTool(spec.name));
        }
        self.entries.insert(spec.name.clone(), Entry { spec, tool });
        Ok(())
    }

    /// Enumerates all schemas, e.g. for system-prompt construction.
    pub fn available(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.entries.values().map(|e| e.spec.clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn spec_for(&self, name: &str) -> Option<ToolSpec> {
        self.entries.get(name).map(|e| e.spec.clone())
    }

    pub fn is_parallel_safe(&self, name: &str) -> bool {
        self.entries
            .get(name)
            .map(|e| e.spec.capabilities.parallel_safe)
            .unwrap_or(false)
    }

    /// Looks up and calls `name`; unknown names fail with `ToolNotFound`.
    /// Honors `cancel` and `timeout`.
    pub async fn invoke(
        &self,
        name: &str,
        args: serde_json::Value,
        ctx: Option<&ToolCallContext>,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<ToolCallContent, AgentError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| AgentError::ToolNotFound(name.to_string()))?;

        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }

        let call = entry.tool.call(args, ctx);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            result = tokio::time::timeout(timeout, call) => {
                match result {
                    Ok(Ok(content)) => Ok(content),
                    Ok(Err(e)) => Err(AgentError::ToolExecutionError {
                        tool_name: name.to_string(),
                        inner: e.to_string(),
                    }),
                    Err(_elapsed) => Err(AgentError::ToolTimeout {
                        tool_name: name.to_string(),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool_source::{ToolCapabilities, ToolSourceError};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".to_string(),
                description: Some("echoes input".to_string()),
                input_schema: serde_json::json!({}),
                capabilities: ToolCapabilities {
                    parallel_safe: true,
                    ..Default::default()
                },
            }
        }
        async fn call(
            &self,
            args: serde_json::Value,
            _ctx: Option<&ToolCallContext>,
        ) -> Result<ToolCallContent, ToolSourceError> {
            Ok(ToolCallContent {
                text: args.to_string(),
            })
        }
    }

    struct SlowTool(Duration);

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "slow".to_string(),
                description: None,
                input_schema: serde_json::json!({}),
                capabilities: ToolCapabilities::default(),
            }
        }
        async fn call(
            &self,
            _args: serde_json::Value,
            _ctx: Option<&ToolCallContext>,
        ) -> Result<ToolCallContent, ToolSourceError> {
            tokio::time::sleep(self.0).await;
            Ok(ToolCallContent {
                text: "done".to_string(),
            })
        }
    }

    /// **Scenario**: registering the same tool name twice fails with DuplicateTool.
    #[test]
    fn duplicate_register_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let err = registry.register(Arc::new(EchoTool)).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTool(_)));
    }

    /// **Scenario**: invoking an unregistered tool name fails with ToolNotFound.
    #[tokio::test]
    async fn invoke_unknown_tool_fails() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke(
                "ghost",
                serde_json::json!({}),
                None,
                &CancellationToken::new(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotFound(_)));
    }

    /// **Scenario**: a tool that exceeds its timeout reports ToolTimeout.
    #[tokio::test]
    async fn invoke_respects_timeout() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(SlowTool(Duration::from_millis(200))))
            .unwrap();
        let err = registry
            .invoke(
                "slow",
                serde_json::json!({}),
                None,
                &CancellationToken::new(),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolTimeout { .. }));
    }

    /// **Scenario**: cancelling before a call starts short-circuits with Cancelled.
    #[tokio::test]
    async fn invoke_honors_pre_cancelled_token() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = registry
            .invoke(
                "echo",
                serde_json::json!({}),
                None,
                &cancel,
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    /// **Scenario**: cancelling mid-call wins the race over a slow tool completing.
    #[tokio::test]
    async fn invoke_cancelled_mid_call_returns_cancelled() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(SlowTool(Duration::from_millis(200))))
            .unwrap();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });
        let err = registry
            .invoke(
                "slow",
                serde_json::json!({}),
                None,
                &cancel,
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    /// **Scenario**: available() enumerates every registered schema, sorted by name.
    #[test]
    fn available_lists_all_schemas_sorted() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool(Duration::from_secs(0)))).unwrap();
        registry.register(Arc::new(EchoTool)).unwrap();
        let names: Vec<_> = registry.available().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["echo".to_string(), "slow".to_string()]);
    }
}
