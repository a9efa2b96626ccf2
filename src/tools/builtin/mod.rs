//! Built-in tools registered at startup.

pub mod dispatch;
pub mod file;
pub mod shell;

use std::sync::Arc;

use crate::tools::registry::ToolRegistry;

pub use dispatch::DispatchWorkerTool;
pub use file::{ListDirTool, ReadFileTool, WriteFileTool};
pub use shell::ShellTool;

/// Register the primitive tool set (file access and shell).
pub async fn register_primitives(registry: &ToolRegistry) {
    registry.register(Arc::new(ReadFileTool)).await;
    registry.register(Arc::new(WriteFileTool)).await;
    registry.register(Arc::new(ListDirTool)).await;
    registry.register(Arc::new(ShellTool::new())).await;
}
