//! The [`Tool`] trait: a single callable tool exposed to the LLM.
//!
//! Concrete tool implementations (file I/O, shell, browser automation, MCP,
//! ...) are external collaborators consumed through this trait and
//! [`crate::tool_source::ToolSource`]; this crate ships only the interface
//! and the [`crate::tool_registry::ToolRegistry`] that dispatches to it.

mod r#trait;

pub use r#trait::Tool;
