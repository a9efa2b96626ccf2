//! File primitives: read, write, list.
//!
//! All paths resolve under the calling context's workspace root; lexical
//! normalization blocks `..` escapes even through directories that do not
//! exist yet.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::ToolError;
use crate::tools::tool::{Tool, ToolContext, optional_str, require_str};

/// Maximum file size for reading (1MB).
const MAX_READ_SIZE: u64 = 1024 * 1024;

/// Maximum file size for writing (5MB).
const MAX_WRITE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum directory listing entries.
const MAX_DIR_ENTRIES: usize = 500;

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn normalize_lexical(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if components
                    .last()
                    .is_some_and(|c| matches!(c, Component::Normal(_)))
                {
                    components.pop();
                }
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Resolve a tool-supplied path inside the workspace, rejecting escapes.
fn resolve_in_workspace(path_str: &str, root: &Path) -> Result<PathBuf, ToolError> {
    let joined = if Path::new(path_str).is_absolute() {
        PathBuf::from(path_str)
    } else {
        root.join(path_str)
    };
    let normalized = normalize_lexical(&joined);
    let root_normalized = normalize_lexical(root);
    if !normalized.starts_with(&root_normalized) {
        return Err(ToolError::NotAuthorized {
            name: String::new(),
            reason: format!("path escapes the workspace: {path_str}"),
        });
    }
    Ok(normalized)
}

/// Read a file from the workspace.
pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace. Returns the file content."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root"}
            },
            "required": ["path"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let path = require_str(&args, "path")?;
        let full = resolve_in_workspace(path, &ctx.workspace_root)?;

        let meta = fs::metadata(&full).await.map_err(|e| ToolError::ExecutionFailed {
            name: self.name().to_string(),
            reason: format!("{path}: {e}"),
        })?;
        if meta.len() > MAX_READ_SIZE {
            return Err(ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: format!("{path} is too large ({} bytes)", meta.len()),
            });
        }

        let content = fs::read_to_string(&full)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: format!("{path}: {e}"),
            })?;
        Ok(serde_json::Value::String(content))
    }
}

/// Write (overwrite) a file in the workspace.
pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file in the workspace, creating parent directories as needed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace root"},
                "content": {"type": "string", "description": "Content to write"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let path = require_str(&args, "path")?;
        let content = require_str(&args, "content")?;
        if content.len() > MAX_WRITE_SIZE {
            return Err(ToolError::InvalidArgs {
                name: self.name().to_string(),
                reason: format!("content too large ({} bytes)", content.len()),
            });
        }

        let full = resolve_in_workspace(path, &ctx.workspace_root)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed {
                    name: self.name().to_string(),
                    reason: e.to_string(),
                })?;
        }
        fs::write(&full, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed {
                name: self.name().to_string(),
                reason: format!("{path}: {e}"),
            })?;

        Ok(serde_json::json!(format!(
            "wrote {} bytes to {path}",
            content.len()
        )))
    }
}

/// List a directory in the workspace.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a workspace directory."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Directory path, defaults to the workspace root"}
            }
        })
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let path = optional_str(&args, "path").unwrap_or(".");
        let full = resolve_in_workspace(path, &ctx.workspace_root)?;

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&full).await.map_err(|e| ToolError::ExecutionFailed {
            name: self.name().to_string(),
            reason: format!("{path}: {e}"),
        })?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| ToolError::ExecutionFailed {
            name: self.name().to_string(),
            reason: e.to_string(),
        })? {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            entries.push(if is_dir { format!("{name}/") } else { name });
            if entries.len() >= MAX_DIR_ENTRIES {
                entries.push(format!("... (truncated at {MAX_DIR_ENTRIES} entries)"));
                break;
            }
        }
        entries.sort();
        Ok(serde_json::json!(entries.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &Path) -> ToolContext {
        ToolContext::rooted_at(root.to_path_buf())
    }

    #[test]
    fn lexical_normalization_strips_dot_segments() {
        let p = normalize_lexical(Path::new("/a/b/../c/./d"));
        assert_eq!(p, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn traversal_is_rejected() {
        let err = resolve_in_workspace("../outside.txt", Path::new("/work/ws"));
        assert!(matches!(err, Err(ToolError::NotAuthorized { .. })));
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());

        let write = WriteFileTool;
        let out = write
            .execute(
                serde_json::json!({"path": "notes/hello.txt", "content": "hi there"}),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.as_str().unwrap().contains("8 bytes"));

        let read = ReadFileTool;
        let content = read
            .execute(serde_json::json!({"path": "notes/hello.txt"}), &ctx)
            .await
            .unwrap();
        assert_eq!(content.as_str().unwrap(), "hi there");
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("file.txt"), "x").await.unwrap();

        let listing = ListDirTool
            .execute(serde_json::json!({}), &ctx(dir.path()))
            .await
            .unwrap();
        let listing = listing.as_str().unwrap();
        assert!(listing.contains("sub/"));
        assert!(listing.contains("file.txt"));
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "nope.txt"}), &ctx(dir.path()))
            .await;
        assert!(matches!(err, Err(ToolError::ExecutionFailed { .. })));
    }
}
