//! Built-in tool implementations for the agentic runtime.
//!
//! `bash`, `read_file`, `write_file` and `list_dir` operate relative to the
//! call's working directory and refuse paths that climb out of it.

pub mod bash;
pub mod list_dir;
pub mod read_file;
pub mod write_file;

pub use bash::BashTool;
pub use list_dir::ListDirTool;
pub use read_file::ReadFileTool;
pub use write_file::WriteFileTool;

use std::path::{Component, Path, PathBuf};

use crate::registry::{RegistryError, ToolRegistry};
use crate::tool::ToolError;

/// Registry holding every built-in tool.
pub fn builtin_registry() -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(BashTool)?;
    registry.register(ReadFileTool)?;
    registry.register(WriteFileTool)?;
    registry.register(ListDirTool)?;
    Ok(registry)
}

/// Resolve `requested` against `base`, rejecting `..` components and
/// absolute paths outside `base`.
pub(crate) fn resolve_in(base: &Path, requested: &str) -> Result<PathBuf, ToolError> {
    let requested_path = Path::new(requested);
    if requested_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(ToolError::PermissionDenied(
            "path traversal ('..') not allowed".to_string(),
        ));
    }
    if requested_path.is_absolute() {
        if !requested_path.starts_with(base) {
            return Err(ToolError::PermissionDenied(format!(
                "'{}' is outside the working directory",
                requested
            )));
        }
        return Ok(requested_path.to_path_buf());
    }
    Ok(base.join(requested_path))
}
