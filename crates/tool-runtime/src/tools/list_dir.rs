//! Directory listing tool.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::permission::PermissionClass;
use crate::tool::{Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput};

/// List the entries of a directory, sorted, directories suffixed with `/`.
pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "list_dir",
            "List files and directories in a directory.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "Directory relative to the working directory (default '.')"
                    }
                }
            }),
        )
        .with_permission(PermissionClass::Always)
        .with_match_argument("path")
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path_str = input.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let path = super::resolve_in(&context.working_directory, path_str)?;

        debug!(path = %path.display(), "listing directory");

        let mut reader = tokio::fs::read_dir(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to list '{}': {e}", path.display()))
        })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
        {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                name.push('/');
            }
            entries.push(name);
        }
        entries.sort();

        if entries.is_empty() {
            return Ok(ToolOutput::text("(empty directory)"));
        }
        Ok(ToolOutput::text(entries.join("\n")))
    }
}
