//! File reading tool with line range support and binary detection.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::permission::PermissionClass;
use crate::tool::{Tool, ToolContext, ToolDescriptor, ToolError, ToolOutput};

/// Read file contents with optional line offset and limit.
pub struct ReadFileTool;

impl ReadFileTool {
    /// Check if content appears to be binary (contains null bytes in first 8KB).
    fn is_binary(bytes: &[u8]) -> bool {
        let check_len = bytes.len().min(8192);
        bytes[..check_len].contains(&0)
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "read_file",
            "Read file contents, optionally restricted to a line range.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "path": {
                        "type": "string",
                        "description": "File path relative to the working directory"
                    },
                    "offset": {
                        "type": "integer",
                        "minimum": 1,
                        "description": "Starting line number (1-based, default 1)"
                    },
                    "limit": {
                        "type": "integer",
                        "minimum": 0,
                        "description": "Maximum number of lines to return"
                    }
                },
                "required": ["path"]
            }),
        )
        .with_permission(PermissionClass::Always)
        .with_match_argument("path")
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolOutput, ToolError> {
        let path_str = input
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'path' field".to_string()))?;

        let offset = input
            .get("offset")
            .and_then(|v| v.as_u64())
            .map(|v| v.max(1) as usize)
            .unwrap_or(1);

        let limit = input.get("limit").and_then(|v| v.as_u64()).map(|v| v as usize);

        let path = super::resolve_in(&context.working_directory, path_str)?;

        debug!(path = %path.display(), offset = offset, limit = ?limit, "reading file");

        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            ToolError::ExecutionFailed(format!("failed to read '{}': {e}", path.display()))
        })?;

        if Self::is_binary(&bytes) {
            return Ok(ToolOutput::text(format!("Binary file, {} bytes", bytes.len())));
        }

        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content.lines().collect();

        // offset is 1-based
        let start = (offset - 1).min(lines.len());
        let end = match limit {
            Some(l) => (start + l).min(lines.len()),
            None => lines.len(),
        };

        let selected: Vec<String> = lines[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{}", start + i + 1, line))
            .collect();

        Ok(ToolOutput::text(selected.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_with_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("test.txt"), "a\nb\nc\nd\ne\n")
            .await
            .unwrap();

        let ctx = ToolContext::new(dir.path());
        let output = ReadFileTool
            .execute(serde_json::json!({"path": "test.txt", "offset": 2, "limit": 2}), &ctx)
            .await
            .unwrap();

        assert!(!output.is_error);
        assert_eq!(output.content, "     2\tb\n     3\tc");
    }

    #[tokio::test]
    async fn test_binary_file_detection() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("binary.bin"), b"hello\x00world")
            .await
            .unwrap();

        let ctx = ToolContext::new(dir.path());
        let output = ReadFileTool
            .execute(serde_json::json!({"path": "binary.bin"}), &ctx)
            .await
            .unwrap();

        assert!(output.content.starts_with("Binary file"));
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext::new(dir.path());
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "nope.txt"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let ctx = ToolContext::new("/tmp");
        let err = ReadFileTool
            .execute(serde_json::json!({"path": "../etc/passwd"}), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ToolError::PermissionDenied(_)));
    }
}
